// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! USB descriptors and class requests for the RNDIS function.

use self::packed_nums::*;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

#[allow(non_camel_case_types)]
mod packed_nums {
    pub type u16_le = zerocopy::U16<zerocopy::LittleEndian>;
}

pub const DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
pub const DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;
pub const DESCRIPTOR_TYPE_INTERFACE_ASSOCIATION: u8 = 0x0b;
pub const DESCRIPTOR_TYPE_CS_INTERFACE: u8 = 0x24;

pub const CDC_SUBTYPE_HEADER: u8 = 0x00;
pub const CDC_SUBTYPE_CALL_MANAGEMENT: u8 = 0x01;
pub const CDC_SUBTYPE_ACM: u8 = 0x02;
pub const CDC_SUBTYPE_UNION: u8 = 0x06;

pub const CLASS_WIRELESS_CONTROLLER: u8 = 0xe0;
pub const SUBCLASS_RF_CONTROLLER: u8 = 0x01;
pub const PROTOCOL_RNDIS: u8 = 0x03;
pub const CLASS_CDC_DATA: u8 = 0x0a;

pub const ENDPOINT_DIR_IN: u8 = 0x80;
pub const ENDPOINT_BULK: u8 = 0x02;
pub const ENDPOINT_INTERRUPT: u8 = 0x03;

/// bmRequestType bits.
pub const REQUEST_DIR_IN: u8 = 0x80;
pub const REQUEST_TYPE_MASK: u8 = 0x60;
pub const REQUEST_TYPE_CLASS: u8 = 0x20;
pub const REQUEST_RECIPIENT_MASK: u8 = 0x1f;
pub const REQUEST_RECIPIENT_INTERFACE: u8 = 0x01;

/// CDC class requests used by RNDIS.
pub const SEND_ENCAPSULATED_COMMAND: u8 = 0x00;
pub const GET_ENCAPSULATED_RESPONSE: u8 = 0x01;

/// Size of a response-available notification.
pub const NOTIFICATION_MAX_PACKET_SIZE: u16 = 8;
/// Polling interval of the notification endpoint, in frames (or 2^(n-1)
/// microframes at high speed).
const NOTIFICATION_INTERVAL: u8 = 9;

/// Bus speed negotiated by the controller, which determines the bulk
/// endpoint packet size.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UsbSpeed {
    Full,
    High,
    Super,
}

impl UsbSpeed {
    pub fn bulk_max_packet_size(self) -> u16 {
        match self {
            UsbSpeed::Full => 64,
            UsbSpeed::High => 512,
            UsbSpeed::Super => 1024,
        }
    }
}

/// A control request setup packet.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16_le,
    pub index: u16_le,
    pub length: u16_le,
}

impl SetupPacket {
    pub fn is_device_to_host(&self) -> bool {
        self.request_type & REQUEST_DIR_IN != 0
    }

    pub fn is_class_interface_request(&self) -> bool {
        self.request_type & REQUEST_TYPE_MASK == REQUEST_TYPE_CLASS
            && self.request_type & REQUEST_RECIPIENT_MASK == REQUEST_RECIPIENT_INTERFACE
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct InterfaceAssociationDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub first_interface: u8,
    pub interface_count: u8,
    pub function_class: u8,
    pub function_subclass: u8,
    pub function_protocol: u8,
    pub function: u8,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface: u8,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct CdcHeaderDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub descriptor_subtype: u8,
    pub cdc: u16_le,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct CdcCallManagementDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub descriptor_subtype: u8,
    pub capabilities: u8,
    pub data_interface: u8,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct CdcAcmDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub descriptor_subtype: u8,
    pub capabilities: u8,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct CdcUnionDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub descriptor_subtype: u8,
    pub control_interface: u8,
    pub subordinate_interface: u8,
}

#[repr(C)]
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned,
)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: u16_le,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn new(endpoint_address: u8, attributes: u8, max_packet_size: u16, interval: u8) -> Self {
        Self {
            length: size_of::<Self>() as u8,
            descriptor_type: DESCRIPTOR_TYPE_ENDPOINT,
            endpoint_address,
            attributes,
            max_packet_size: max_packet_size.into(),
            interval,
        }
    }
}

/// The complete descriptor set for the function, in the order the host
/// expects to find it in the configuration descriptor.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct FunctionDescriptors {
    pub association: InterfaceAssociationDescriptor,
    pub control_interface: InterfaceDescriptor,
    pub cdc_header: CdcHeaderDescriptor,
    pub call_management: CdcCallManagementDescriptor,
    pub acm: CdcAcmDescriptor,
    pub union: CdcUnionDescriptor,
    pub notification_endpoint: EndpointDescriptor,
    pub data_interface: InterfaceDescriptor,
    pub bulk_in_endpoint: EndpointDescriptor,
    pub bulk_out_endpoint: EndpointDescriptor,
}

const_assert_eq!(size_of::<SetupPacket>(), 8);
const_assert_eq!(size_of::<EndpointDescriptor>(), 7);
const_assert_eq!(size_of::<FunctionDescriptors>(), 8 + 9 + 5 + 5 + 4 + 5 + 7 + 9 + 7 + 7);

/// Interface numbers allocated at bind time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Interfaces {
    pub control: u8,
    pub data: u8,
}

/// Endpoint addresses allocated at bind time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub notification: u8,
    pub bulk_in: u8,
    pub bulk_out: u8,
}

impl Endpoints {
    pub fn all(&self) -> [u8; 3] {
        [self.notification, self.bulk_in, self.bulk_out]
    }

    /// The endpoint descriptors to configure for the given bus speed.
    pub fn descriptors(&self, speed: UsbSpeed) -> [EndpointDescriptor; 3] {
        [
            EndpointDescriptor::new(
                self.notification,
                ENDPOINT_INTERRUPT,
                NOTIFICATION_MAX_PACKET_SIZE,
                NOTIFICATION_INTERVAL,
            ),
            EndpointDescriptor::new(self.bulk_in, ENDPOINT_BULK, speed.bulk_max_packet_size(), 0),
            EndpointDescriptor::new(
                self.bulk_out,
                ENDPOINT_BULK,
                speed.bulk_max_packet_size(),
                0,
            ),
        ]
    }
}

fn interface(
    number: u8,
    num_endpoints: u8,
    class: u8,
    subclass: u8,
    protocol: u8,
) -> InterfaceDescriptor {
    InterfaceDescriptor {
        length: size_of::<InterfaceDescriptor>() as u8,
        descriptor_type: DESCRIPTOR_TYPE_INTERFACE,
        interface_number: number,
        alternate_setting: 0,
        num_endpoints,
        interface_class: class,
        interface_subclass: subclass,
        interface_protocol: protocol,
        interface: 0,
    }
}

pub fn function_descriptors(
    interfaces: Interfaces,
    endpoints: Endpoints,
    speed: UsbSpeed,
) -> FunctionDescriptors {
    let [notification_endpoint, bulk_in_endpoint, bulk_out_endpoint] =
        endpoints.descriptors(speed);
    FunctionDescriptors {
        association: InterfaceAssociationDescriptor {
            length: size_of::<InterfaceAssociationDescriptor>() as u8,
            descriptor_type: DESCRIPTOR_TYPE_INTERFACE_ASSOCIATION,
            first_interface: interfaces.control,
            interface_count: 2,
            function_class: CLASS_WIRELESS_CONTROLLER,
            function_subclass: SUBCLASS_RF_CONTROLLER,
            function_protocol: PROTOCOL_RNDIS,
            function: 0,
        },
        control_interface: interface(
            interfaces.control,
            1,
            CLASS_WIRELESS_CONTROLLER,
            SUBCLASS_RF_CONTROLLER,
            PROTOCOL_RNDIS,
        ),
        cdc_header: CdcHeaderDescriptor {
            length: size_of::<CdcHeaderDescriptor>() as u8,
            descriptor_type: DESCRIPTOR_TYPE_CS_INTERFACE,
            descriptor_subtype: CDC_SUBTYPE_HEADER,
            cdc: 0x0110u16.into(),
        },
        call_management: CdcCallManagementDescriptor {
            length: size_of::<CdcCallManagementDescriptor>() as u8,
            descriptor_type: DESCRIPTOR_TYPE_CS_INTERFACE,
            descriptor_subtype: CDC_SUBTYPE_CALL_MANAGEMENT,
            capabilities: 0,
            data_interface: interfaces.data,
        },
        acm: CdcAcmDescriptor {
            length: size_of::<CdcAcmDescriptor>() as u8,
            descriptor_type: DESCRIPTOR_TYPE_CS_INTERFACE,
            descriptor_subtype: CDC_SUBTYPE_ACM,
            capabilities: 0,
        },
        union: CdcUnionDescriptor {
            length: size_of::<CdcUnionDescriptor>() as u8,
            descriptor_type: DESCRIPTOR_TYPE_CS_INTERFACE,
            descriptor_subtype: CDC_SUBTYPE_UNION,
            control_interface: interfaces.control,
            subordinate_interface: interfaces.data,
        },
        notification_endpoint,
        data_interface: interface(interfaces.data, 2, CLASS_CDC_DATA, 0, 0),
        bulk_in_endpoint,
        bulk_out_endpoint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_descriptors() {
        let descriptors = function_descriptors(
            Interfaces {
                control: 2,
                data: 3,
            },
            Endpoints {
                notification: 0x81,
                bulk_in: 0x82,
                bulk_out: 0x01,
            },
            UsbSpeed::High,
        );
        let bytes = descriptors.as_bytes();
        // Walk the descriptor chain by bLength.
        let mut types = Vec::new();
        let mut rest = bytes;
        while !rest.is_empty() {
            let len = rest[0] as usize;
            assert!(len >= 2 && len <= rest.len());
            types.push(rest[1]);
            rest = &rest[len..];
        }
        assert_eq!(
            types,
            [
                DESCRIPTOR_TYPE_INTERFACE_ASSOCIATION,
                DESCRIPTOR_TYPE_INTERFACE,
                DESCRIPTOR_TYPE_CS_INTERFACE,
                DESCRIPTOR_TYPE_CS_INTERFACE,
                DESCRIPTOR_TYPE_CS_INTERFACE,
                DESCRIPTOR_TYPE_CS_INTERFACE,
                DESCRIPTOR_TYPE_ENDPOINT,
                DESCRIPTOR_TYPE_INTERFACE,
                DESCRIPTOR_TYPE_ENDPOINT,
                DESCRIPTOR_TYPE_ENDPOINT,
            ]
        );
        assert_eq!(descriptors.union.control_interface, 2);
        assert_eq!(descriptors.union.subordinate_interface, 3);
        assert_eq!(descriptors.bulk_in_endpoint.max_packet_size.get(), 512);
        assert_eq!(descriptors.bulk_out_endpoint.endpoint_address, 0x01);
    }

    #[test]
    fn test_setup_packet() {
        let setup = SetupPacket::read_from_bytes(&[0xa1, 0x01, 0, 0, 2, 0, 0x00, 0x04]).unwrap();
        assert!(setup.is_device_to_host());
        assert!(setup.is_class_interface_request());
        assert_eq!(setup.request, GET_ENCAPSULATED_RESPONSE);
        assert_eq!(setup.index.get(), 2);
        assert_eq!(setup.length.get(), 0x400);
    }
}
