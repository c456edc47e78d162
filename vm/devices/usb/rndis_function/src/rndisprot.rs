// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Remote NDIS wire definitions.
//!
//! All multi-byte fields are little endian. Every message starts with a
//! [`MessageHeader`]; the type-specific body follows immediately.

#![allow(dead_code)]

use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

//
//  Basic types
//

pub type RequestId = u32;
pub type Status = u32;
pub type Oid = u32;

//
//  Status codes
//

pub const STATUS_SUCCESS: Status = 0x00000000;
pub const STATUS_PENDING: Status = 0x00000103;
pub const STATUS_NOT_ACCEPTED: Status = 0x00010003;
pub const STATUS_MEDIA_CONNECT: Status = 0x4001000B;
pub const STATUS_MEDIA_DISCONNECT: Status = 0x4001000C;
pub const STATUS_FAILURE: Status = 0xC0000001;
pub const STATUS_NOT_SUPPORTED: Status = 0xC00000BB;
pub const STATUS_INVALID_LENGTH: Status = 0xC0010014;
pub const STATUS_INVALID_DATA: Status = 0xC0010015;
pub const STATUS_BAD_VERSION: Status = 0xC0010004;

//
// Object identifiers used by query and set requests
//

pub const OID_GEN_SUPPORTED_LIST: Oid = 0x00010101;
pub const OID_GEN_HARDWARE_STATUS: Oid = 0x00010102;
pub const OID_GEN_MEDIA_SUPPORTED: Oid = 0x00010103;
pub const OID_GEN_MEDIA_IN_USE: Oid = 0x00010104;
pub const OID_GEN_MAXIMUM_FRAME_SIZE: Oid = 0x00010106;
pub const OID_GEN_LINK_SPEED: Oid = 0x00010107;
pub const OID_GEN_VENDOR_DESCRIPTION: Oid = 0x0001010D;
pub const OID_GEN_CURRENT_PACKET_FILTER: Oid = 0x0001010E;
pub const OID_GEN_MAXIMUM_TOTAL_SIZE: Oid = 0x00010111;
pub const OID_GEN_MAC_OPTIONS: Oid = 0x00010113;
pub const OID_GEN_MEDIA_CONNECT_STATUS: Oid = 0x00010114;
pub const OID_GEN_PHYSICAL_MEDIUM: Oid = 0x00010202;

pub const OID_GEN_XMIT_OK: Oid = 0x00020101;
pub const OID_GEN_RCV_OK: Oid = 0x00020102;
pub const OID_GEN_XMIT_ERROR: Oid = 0x00020103;
pub const OID_GEN_RCV_ERROR: Oid = 0x00020104;
pub const OID_GEN_RCV_NO_BUFFER: Oid = 0x00020105;

pub const OID_802_3_PERMANENT_ADDRESS: Oid = 0x01010101;
pub const OID_802_3_CURRENT_ADDRESS: Oid = 0x01010102;
pub const OID_802_3_MULTICAST_LIST: Oid = 0x01010103;
pub const OID_802_3_MAXIMUM_LIST_SIZE: Oid = 0x01010104;

//
// Remote NDIS message types
//
pub const MESSAGE_TYPE_PACKET_MSG: u32 = 0x00000001;
pub const MESSAGE_TYPE_INITIALIZE_MSG: u32 = 0x00000002;
pub const MESSAGE_TYPE_HALT_MSG: u32 = 0x00000003;
pub const MESSAGE_TYPE_QUERY_MSG: u32 = 0x00000004;
pub const MESSAGE_TYPE_SET_MSG: u32 = 0x00000005;
pub const MESSAGE_TYPE_RESET_MSG: u32 = 0x00000006;
pub const MESSAGE_TYPE_INDICATE_STATUS_MSG: u32 = 0x00000007;
pub const MESSAGE_TYPE_KEEPALIVE_MSG: u32 = 0x00000008;

// Remote NDIS message completion types
pub const MESSAGE_TYPE_INITIALIZE_CMPLT: u32 = 0x80000002;
pub const MESSAGE_TYPE_QUERY_CMPLT: u32 = 0x80000004;
pub const MESSAGE_TYPE_SET_CMPLT: u32 = 0x80000005;
pub const MESSAGE_TYPE_RESET_CMPLT: u32 = 0x80000006;
pub const MESSAGE_TYPE_KEEPALIVE_CMPLT: u32 = 0x80000008;

//
//  Defines for DeviceFlags in RNDIS_INITIALIZE_COMPLETE
//
pub const DF_CONNECTIONLESS: u32 = 0x00000001;
pub const DF_CONNECTION_ORIENTED: u32 = 0x00000002;

//
//  Remote NDIS medium types.
//
pub const MEDIUM_802_3: u32 = 0x00000000;

/// NdisPhysicalMediumUnspecified.
pub const PHYSICAL_MEDIUM_UNSPECIFIED: u32 = 0x00000000;

//
// Remote NDIS medium connection states.
//
pub const MEDIA_STATE_CONNECTED: u32 = 0x00000000;
pub const MEDIA_STATE_DISCONNECTED: u32 = 0x00000001;

//
//  Remote NDIS version numbers
//
pub const MAJOR_VERSION: u32 = 0x00000001;
pub const MINOR_VERSION: u32 = 0x00000000;

//
// Ndis MAC option bits (OID_GEN_MAC_OPTIONS).
//
pub const MAC_OPTION_COPY_LOOKAHEAD_DATA: u32 = 0x00000001;
pub const MAC_OPTION_RECEIVE_SERIALIZED: u32 = 0x00000002;
pub const MAC_OPTION_TRANSFERS_NOT_PEND: u32 = 0x00000004;
pub const MAC_OPTION_NO_LOOPBACK: u32 = 0x00000008;
pub const MAC_OPTION_FULL_DUPLEX: u32 = 0x00000010;

//
// Packet filter bits (OID_GEN_CURRENT_PACKET_FILTER).
//
pub const PACKET_TYPE_DIRECTED: u32 = 0x00000001;
pub const PACKET_TYPE_MULTICAST: u32 = 0x00000002;
pub const PACKET_TYPE_ALL_MULTICAST: u32 = 0x00000004;
pub const PACKET_TYPE_BROADCAST: u32 = 0x00000008;
pub const PACKET_TYPE_PROMISCUOUS: u32 = 0x00000020;

/// The largest information buffer accepted in a set request.
pub const SET_INFO_BUFFER_LENGTH: usize = 0x14;

//
// Remote NDIS message format
//
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MessageHeader {
    pub message_type: u32,

    // Total length of this message, from the beginning
    // of the header struct, in bytes.
    pub message_length: u32,
}

//
//  NdisInitialize message
//
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct InitializeRequest {
    pub request_id: RequestId,
    pub major_version: u32,
    pub minor_version: u32,
    pub max_transfer_size: u32,
}

//
//  Response to NdisInitialize
//
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct InitializeComplete {
    pub request_id: RequestId,
    pub status: Status,
    pub major_version: u32,
    pub minor_version: u32,
    pub device_flags: u32,
    pub medium: u32,
    pub max_packets_per_message: u32,
    pub max_transfer_size: u32,
    pub packet_alignment_factor: u32,
    pub af_list_offset: u32,
    pub af_list_size: u32,
}

//
//  NdisHalt message
//
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HaltRequest {
    pub request_id: RequestId,
}

//
// NdisQueryRequest message
//
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct QueryRequest {
    pub request_id: RequestId,
    pub oid: Oid,
    pub information_buffer_length: u32,
    pub information_buffer_offset: u32,
    pub device_vc_handle: u32,
}

//
//  Response to NdisQueryRequest
//
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct QueryComplete {
    pub request_id: RequestId,
    pub status: Status,
    pub information_buffer_length: u32,
    pub information_buffer_offset: u32,
}

//
//  NdisSetRequest message. The information buffer offset is relative to
//  the request_id field.
//
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SetRequest {
    pub request_id: RequestId,
    pub oid: Oid,
    pub information_buffer_length: u32,
    pub information_buffer_offset: u32,
    pub device_vc_handle: u32,
}

//
//  Response to NdisSetRequest
//
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SetComplete {
    pub request_id: RequestId,
    pub status: Status,
}

//
//  NdisReset message
//
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ResetRequest {
    pub reserved: u32,
}

//
//  Response to NdisReset
//
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ResetComplete {
    pub status: Status,
    pub addressing_reset: u32,
}

//
//  NdisMIndicateStatus message
//
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IndicateStatus {
    pub status: Status,
    pub status_buffer_length: u32,
    pub status_buffer_offset: u32,
}

//
//  Diagnostic information passed as the status buffer in
//  RNDIS_INDICATE_STATUS messages signifying error conditions.
//
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DiagnosticInfo {
    pub diag_status: Status,
    pub error_offset: u32,
}

//
//  NdisKeepAlive message
//
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct KeepaliveRequest {
    pub request_id: RequestId,
}

//
// Response to NdisKeepAlive
//
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct KeepaliveComplete {
    pub request_id: RequestId,
    pub status: Status,
}

//
//  Data message. All offset fields are byte offsets from the beginning
//  of this structure, i.e. from the data_offset field, not from the
//  message header. All length fields are in bytes.
//
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Packet {
    pub data_offset: u32,
    pub data_length: u32,
    pub oob_data_offset: u32,
    pub oob_data_length: u32,
    pub num_oob_data_elements: u32,
    pub per_packet_info_offset: u32,
    pub per_packet_info_length: u32,
    pub vc_handle: u32,
    pub reserved: u32,
}

//
// Notification sent on the interrupt endpoint when an encapsulated
// response is ready to be read.
//
pub const NOTIFICATION_RESPONSE_AVAILABLE: u32 = 0x00000001;

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ResponseAvailable {
    pub notification: u32,
    pub reserved: u32,
}

const_assert_eq!(size_of::<MessageHeader>(), 8);
const_assert_eq!(size_of::<InitializeRequest>(), 16);
const_assert_eq!(size_of::<InitializeComplete>(), 44);
const_assert_eq!(size_of::<QueryRequest>(), 20);
const_assert_eq!(size_of::<QueryComplete>(), 16);
const_assert_eq!(size_of::<SetRequest>(), 20);
const_assert_eq!(size_of::<SetComplete>(), 8);
const_assert_eq!(size_of::<ResetComplete>(), 8);
const_assert_eq!(size_of::<IndicateStatus>(), 12);
const_assert_eq!(size_of::<KeepaliveComplete>(), 8);
const_assert_eq!(size_of::<Packet>(), 36);
const_assert_eq!(size_of::<ResponseAvailable>(), 8);
