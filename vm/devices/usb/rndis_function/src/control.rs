// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The RNDIS control channel: dispatch of host control writes, OID handling
//! and the queue of responses waiting for the host to read them.

use crate::codec;
use crate::codec::ControlMessage;
use crate::codec::ControlResponse;
use crate::rndisprot;
use crate::ETHERNET_HEADER_LEN;
use net_backend_resources::mac_address::MacAddress;
use std::collections::VecDeque;
use thiserror::Error;
use zerocopy::IntoBytes;

/// Fixed device properties reported through OID queries.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// The address stored for this device. The host is given the peer
    /// address so the two ends of the link differ.
    pub mac_address: MacAddress,
    /// Largest Ethernet frame, including the Ethernet header, that fits in
    /// one bulk transfer.
    pub max_frame_size: u32,
    /// Link speed in bits per second.
    pub link_speed: u64,
    /// Vendor description, NUL terminated.
    pub vendor_description: Vec<u8>,
}

/// Device state mutated by the control channel.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeviceState {
    /// The endpoints are configured and enabled.
    pub configured: bool,
    /// The host has set the packet filter.
    pub ready: bool,
    pub packet_filter: u32,
}

impl DeviceState {
    pub fn online(&self) -> bool {
        self.configured && self.ready
    }
}

#[derive(Debug, Error)]
pub enum OidError {
    #[error("unknown oid")]
    UnknownOid,
    #[error("invalid oid input, bad field {0}")]
    InvalidInput(&'static str),
    #[error("oid not accepted in the current state")]
    NotAccepted,
}

impl OidError {
    pub fn as_status(&self) -> rndisprot::Status {
        match self {
            OidError::UnknownOid => rndisprot::STATUS_NOT_SUPPORTED,
            OidError::InvalidInput(_) => rndisprot::STATUS_INVALID_DATA,
            OidError::NotAccepted => rndisprot::STATUS_NOT_ACCEPTED,
        }
    }
}

/// The result of handling one control write.
#[derive(Debug)]
pub struct Handled {
    pub response: ControlResponse,
    /// The write moved the device from offline to online.
    pub went_online: bool,
}

const SUPPORTED_OIDS: &[rndisprot::Oid] = &[
    rndisprot::OID_GEN_SUPPORTED_LIST,
    rndisprot::OID_GEN_HARDWARE_STATUS,
    rndisprot::OID_GEN_MEDIA_SUPPORTED,
    rndisprot::OID_GEN_MEDIA_IN_USE,
    rndisprot::OID_GEN_MAXIMUM_FRAME_SIZE,
    rndisprot::OID_GEN_LINK_SPEED,
    rndisprot::OID_GEN_VENDOR_DESCRIPTION,
    rndisprot::OID_GEN_CURRENT_PACKET_FILTER,
    rndisprot::OID_GEN_MAXIMUM_TOTAL_SIZE,
    rndisprot::OID_GEN_MAC_OPTIONS,
    rndisprot::OID_GEN_MEDIA_CONNECT_STATUS,
    rndisprot::OID_GEN_PHYSICAL_MEDIUM,
    // Statistics
    rndisprot::OID_GEN_XMIT_OK,
    rndisprot::OID_GEN_RCV_OK,
    rndisprot::OID_GEN_XMIT_ERROR,
    rndisprot::OID_GEN_RCV_ERROR,
    rndisprot::OID_GEN_RCV_NO_BUFFER,
    // Ethernet
    rndisprot::OID_802_3_PERMANENT_ADDRESS,
    rndisprot::OID_802_3_CURRENT_ADDRESS,
    rndisprot::OID_802_3_MAXIMUM_LIST_SIZE,
];

/// Handles one control write from the host, producing exactly one response.
pub fn handle_control_write(info: &DeviceInfo, state: &mut DeviceState, bytes: &[u8]) -> Handled {
    let message = codec::decode_control_message(bytes);
    tracing::trace!(?message, "control message");
    let was_online = state.online();
    let response = match message {
        ControlMessage::Initialize {
            request_id,
            major_version,
            minor_version,
        } => {
            if major_version != rndisprot::MAJOR_VERSION
                || minor_version != rndisprot::MINOR_VERSION
            {
                tracing::warn!(
                    major_version,
                    minor_version,
                    "host requested unexpected rndis version"
                );
            }
            codec::encode_init_complete(request_id, rndisprot::STATUS_SUCCESS)
        }
        ControlMessage::Query { request_id, oid } => match handle_oid_query(info, state, oid) {
            Ok(data) => codec::encode_query_complete(request_id, Some(&data)),
            Err(err) => {
                tracing::warn!(
                    oid,
                    error = &err as &dyn std::error::Error,
                    "oid query failed"
                );
                codec::encode_query_complete(request_id, None)
            }
        },
        ControlMessage::Set {
            request_id,
            oid,
            payload,
        } => {
            let status = match handle_oid_set(state, oid, payload) {
                Ok(()) => rndisprot::STATUS_SUCCESS,
                Err(err) => {
                    tracing::warn!(
                        oid,
                        error = &err as &dyn std::error::Error,
                        "oid set failed"
                    );
                    err.as_status()
                }
            };
            codec::encode_set_complete(request_id, status)
        }
        ControlMessage::Halt => {
            tracing::debug!("halt requested");
            codec::encode_indicate_status(rndisprot::STATUS_SUCCESS, &[])
        }
        ControlMessage::Reset => {
            tracing::debug!("reset requested");
            codec::encode_reset_complete()
        }
        ControlMessage::KeepAlive { request_id } => codec::encode_keepalive_complete(request_id),
        ControlMessage::DataOnControlChannel => {
            tracing::warn!(len = bytes.len(), "data packet on the control channel");
            codec::encode_invalid_message_indication(bytes)
        }
        ControlMessage::Malformed { raw } => {
            tracing::warn!(len = raw.len(), "malformed control message");
            codec::encode_invalid_message_indication(raw)
        }
    };
    Handled {
        response,
        went_online: !was_online && state.online(),
    }
}

fn handle_oid_query(
    info: &DeviceInfo,
    state: &DeviceState,
    oid: rndisprot::Oid,
) -> Result<Vec<u8>, OidError> {
    tracing::debug!(oid, "oid query");
    let value: u32 = match oid {
        rndisprot::OID_GEN_SUPPORTED_LIST => return Ok(SUPPORTED_OIDS.as_bytes().to_vec()),
        rndisprot::OID_GEN_VENDOR_DESCRIPTION => return Ok(info.vendor_description.clone()),
        rndisprot::OID_802_3_PERMANENT_ADDRESS | rndisprot::OID_802_3_CURRENT_ADDRESS => {
            return Ok(info.mac_address.peer().to_bytes().to_vec());
        }
        rndisprot::OID_GEN_HARDWARE_STATUS => 0, // NdisHardwareStatusReady
        rndisprot::OID_GEN_MEDIA_SUPPORTED | rndisprot::OID_GEN_MEDIA_IN_USE => {
            rndisprot::MEDIUM_802_3
        }
        rndisprot::OID_GEN_MAXIMUM_FRAME_SIZE => info.max_frame_size - ETHERNET_HEADER_LEN,
        rndisprot::OID_GEN_MAXIMUM_TOTAL_SIZE => info.max_frame_size,
        // In units of 100 bps.
        rndisprot::OID_GEN_LINK_SPEED => (info.link_speed / 100).try_into().unwrap_or(u32::MAX),
        rndisprot::OID_GEN_CURRENT_PACKET_FILTER => state.packet_filter,
        rndisprot::OID_GEN_MAC_OPTIONS => {
            rndisprot::MAC_OPTION_TRANSFERS_NOT_PEND
                | rndisprot::MAC_OPTION_NO_LOOPBACK
                | rndisprot::MAC_OPTION_FULL_DUPLEX
        }
        rndisprot::OID_GEN_MEDIA_CONNECT_STATUS => rndisprot::MEDIA_STATE_CONNECTED,
        rndisprot::OID_GEN_PHYSICAL_MEDIUM => rndisprot::PHYSICAL_MEDIUM_UNSPECIFIED,
        rndisprot::OID_GEN_XMIT_OK
        | rndisprot::OID_GEN_RCV_OK
        | rndisprot::OID_GEN_XMIT_ERROR
        | rndisprot::OID_GEN_RCV_ERROR
        | rndisprot::OID_GEN_RCV_NO_BUFFER => 0,
        rndisprot::OID_802_3_MAXIMUM_LIST_SIZE => 0,
        _ => return Err(OidError::UnknownOid),
    };
    Ok(value.to_le_bytes().to_vec())
}

fn handle_oid_set(
    state: &mut DeviceState,
    oid: rndisprot::Oid,
    payload: &[u8],
) -> Result<(), OidError> {
    tracing::debug!(oid, len = payload.len(), "oid set");
    match oid {
        rndisprot::OID_GEN_CURRENT_PACKET_FILTER => {
            let filter: [u8; 4] = payload
                .try_into()
                .map_err(|_| OidError::InvalidInput("packet filter length"))?;
            if !state.configured {
                return Err(OidError::NotAccepted);
            }
            state.packet_filter = u32::from_le_bytes(filter);
            state.ready = true;
            tracing::debug!(filter = state.packet_filter, "packet filter set, device ready");
            Ok(())
        }
        _ => Err(OidError::UnknownOid),
    }
}

/// Responses waiting for GET_ENCAPSULATED_RESPONSE, in the order their
/// commands were handled.
#[derive(Debug, Default)]
pub struct PendingResponses {
    queue: VecDeque<ControlResponse>,
}

impl PendingResponses {
    pub fn push(&mut self, response: ControlResponse) {
        self.queue.push_back(response);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Copies the head response into `out` and removes it from the queue.
    /// If the queue is empty or `out` cannot hold the whole response, the
    /// queue is untouched and a single zero byte is written instead.
    ///
    /// Returns the number of bytes written.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        if let Some(head) = self.queue.front() {
            if let Some(dest) = out.get_mut(..head.len()) {
                dest.copy_from_slice(head.as_bytes());
                let len = head.len();
                self.queue.pop_front();
                return len;
            }
            tracing::debug!(
                response_len = head.len(),
                buffer_len = out.len(),
                "response read buffer too small"
            );
        }
        match out.first_mut() {
            Some(b) => {
                *b = 0;
                1
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromBytes;

    fn info() -> DeviceInfo {
        DeviceInfo {
            mac_address: MacAddress::new([0x01, 0x23, 0x34, 0x56, 0x67, 0x89]),
            max_frame_size: 2004,
            link_speed: 100_000_000,
            vendor_description: b"test\0".to_vec(),
        }
    }

    fn query(oid: rndisprot::Oid) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(
            rndisprot::MessageHeader {
                message_type: rndisprot::MESSAGE_TYPE_QUERY_MSG,
                message_length: 28,
            }
            .as_bytes(),
        );
        bytes.extend_from_slice(
            rndisprot::QueryRequest {
                request_id: 1,
                oid,
                information_buffer_length: 0,
                information_buffer_offset: 0,
                device_vc_handle: 0,
            }
            .as_bytes(),
        );
        bytes
    }

    fn set_filter(filter: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(
            rndisprot::MessageHeader {
                message_type: rndisprot::MESSAGE_TYPE_SET_MSG,
                message_length: (28 + filter.len()) as u32,
            }
            .as_bytes(),
        );
        bytes.extend_from_slice(
            rndisprot::SetRequest {
                request_id: 2,
                oid: rndisprot::OID_GEN_CURRENT_PACKET_FILTER,
                information_buffer_length: filter.len() as u32,
                information_buffer_offset: 20,
                device_vc_handle: 0,
            }
            .as_bytes(),
        );
        bytes.extend_from_slice(filter);
        bytes
    }

    /// Returns the status and data of a query completion.
    fn query_result(response: &ControlResponse) -> (rndisprot::Status, Vec<u8>) {
        assert_eq!(response.message_type(), rndisprot::MESSAGE_TYPE_QUERY_CMPLT);
        let (complete, rest) =
            rndisprot::QueryComplete::read_from_prefix(&response.as_bytes()[8..]).unwrap();
        (complete.status, rest.to_vec())
    }

    fn set_status(response: &ControlResponse) -> rndisprot::Status {
        assert_eq!(response.message_type(), rndisprot::MESSAGE_TYPE_SET_CMPLT);
        rndisprot::SetComplete::read_from_bytes(&response.as_bytes()[8..])
            .unwrap()
            .status
    }

    #[test]
    fn permanent_address_is_peer() {
        let mut state = DeviceState::default();
        let handled = handle_control_write(
            &info(),
            &mut state,
            &query(rndisprot::OID_802_3_PERMANENT_ADDRESS),
        );
        let (status, data) = query_result(&handled.response);
        assert_eq!(status, rndisprot::STATUS_SUCCESS);
        assert_eq!(data, [0x01, 0x23, 0x34, 0x56, 0x67, 0x88]);
    }

    #[test]
    fn query_values() {
        let info = info();
        let mut state = DeviceState::default();
        let mut query_u32 = |oid| {
            let handled = handle_control_write(&info, &mut state, &query(oid));
            let (status, data) = query_result(&handled.response);
            assert_eq!(status, rndisprot::STATUS_SUCCESS);
            u32::from_le_bytes(data.try_into().unwrap())
        };
        assert_eq!(query_u32(rndisprot::OID_GEN_LINK_SPEED), 1_000_000);
        assert_eq!(query_u32(rndisprot::OID_GEN_MAXIMUM_FRAME_SIZE), 1990);
        assert_eq!(query_u32(rndisprot::OID_GEN_MAXIMUM_TOTAL_SIZE), 2004);
        assert_eq!(query_u32(rndisprot::OID_GEN_RCV_ERROR), 0);
        assert_eq!(
            query_u32(rndisprot::OID_GEN_PHYSICAL_MEDIUM),
            rndisprot::PHYSICAL_MEDIUM_UNSPECIFIED
        );

        let handled =
            handle_control_write(&info, &mut state, &query(rndisprot::OID_GEN_SUPPORTED_LIST));
        let (_, data) = query_result(&handled.response);
        assert_eq!(data.len(), SUPPORTED_OIDS.len() * 4);
        assert_eq!(
            &data[..4],
            &rndisprot::OID_GEN_SUPPORTED_LIST.to_le_bytes()
        );

        let handled = handle_control_write(
            &info,
            &mut state,
            &query(rndisprot::OID_GEN_VENDOR_DESCRIPTION),
        );
        assert_eq!(query_result(&handled.response).1, b"test\0");
    }

    #[test]
    fn unknown_oid_not_supported() {
        let mut state = DeviceState::default();
        let handled = handle_control_write(&info(), &mut state, &query(0xdead_beef));
        let (status, data) = query_result(&handled.response);
        assert_eq!(status, rndisprot::STATUS_NOT_SUPPORTED);
        assert!(data.is_empty());
    }

    #[test]
    fn packet_filter_requires_configured() {
        let mut state = DeviceState::default();
        let handled = handle_control_write(&info(), &mut state, &set_filter(&[0x2d, 0, 0, 0]));
        assert_eq!(set_status(&handled.response), rndisprot::STATUS_NOT_ACCEPTED);
        assert!(!handled.went_online);
        assert!(!state.ready);

        // A rejected set leaves the reported filter untouched.
        let handled = handle_control_write(
            &info(),
            &mut state,
            &query(rndisprot::OID_GEN_CURRENT_PACKET_FILTER),
        );
        assert_eq!(query_result(&handled.response).1, [0, 0, 0, 0]);

        state.configured = true;
        let handled = handle_control_write(&info(), &mut state, &set_filter(&[0x2d, 0, 0, 0]));
        assert_eq!(set_status(&handled.response), rndisprot::STATUS_SUCCESS);
        assert!(handled.went_online);
        assert!(state.online());
        assert_eq!(state.packet_filter, 0x2d);

        // Setting it again does not transition.
        let handled = handle_control_write(&info(), &mut state, &set_filter(&[0x0f, 0, 0, 0]));
        assert!(!handled.went_online);

        let handled = handle_control_write(
            &info(),
            &mut state,
            &query(rndisprot::OID_GEN_CURRENT_PACKET_FILTER),
        );
        assert_eq!(query_result(&handled.response).1, [0x0f, 0, 0, 0]);
    }

    #[test]
    fn packet_filter_bad_length() {
        let mut state = DeviceState {
            configured: true,
            ..Default::default()
        };
        let handled = handle_control_write(&info(), &mut state, &set_filter(&[1, 2]));
        assert_eq!(set_status(&handled.response), rndisprot::STATUS_INVALID_DATA);
        assert!(!state.ready);
    }

    #[test]
    fn one_response_for_any_input() {
        let info = info();
        let mut state = DeviceState::default();
        let mut inputs: Vec<Vec<u8>> = vec![
            Vec::new(),
            vec![0; 3],
            vec![0xff; 8],
            vec![0xff; 4096],
            query(rndisprot::OID_GEN_LINK_SPEED)[..20].to_vec(),
            codec::encode_packet_frame(&[0; 64]),
        ];
        for message_type in 0..10u32 {
            let mut bytes = message_type.to_le_bytes().to_vec();
            bytes.extend_from_slice(&12u32.to_le_bytes());
            bytes.extend_from_slice(&[0; 4]);
            inputs.push(bytes);
        }
        for input in &inputs {
            let handled = handle_control_write(&info, &mut state, input);
            assert!(!handled.response.is_empty());
        }
    }

    #[test]
    fn data_on_control_channel_is_invalid() {
        let mut state = DeviceState::default();
        let frame = codec::encode_packet_frame(&[0; 16]);
        let handled = handle_control_write(&info(), &mut state, &frame);
        assert_eq!(
            handled.response.message_type(),
            rndisprot::MESSAGE_TYPE_INDICATE_STATUS_MSG
        );
        let status =
            rndisprot::IndicateStatus::read_from_prefix(&handled.response.as_bytes()[8..])
                .unwrap()
                .0;
        assert_eq!(status.status, rndisprot::STATUS_INVALID_DATA);
    }

    #[test]
    fn halt_and_reset_do_not_change_state() {
        let mut state = DeviceState {
            configured: true,
            ready: true,
            packet_filter: 1,
        };
        let before = state.clone();
        let halt = [3, 0, 0, 0, 12, 0, 0, 0, 5, 0, 0, 0];
        let handled = handle_control_write(&info(), &mut state, &halt);
        assert_eq!(
            handled.response.message_type(),
            rndisprot::MESSAGE_TYPE_INDICATE_STATUS_MSG
        );
        let reset = [6, 0, 0, 0, 12, 0, 0, 0, 0, 0, 0, 0];
        let handled = handle_control_write(&info(), &mut state, &reset);
        assert_eq!(
            handled.response.message_type(),
            rndisprot::MESSAGE_TYPE_RESET_CMPLT
        );
        assert_eq!(state, before);
    }

    #[test]
    fn small_read_keeps_head() {
        let mut pending = PendingResponses::default();
        let mut buf = [0xff; 64];
        assert_eq!(pending.read(&mut buf), 1);
        assert_eq!(buf[0], 0);

        let first = codec::encode_keepalive_complete(1);
        let second = codec::encode_keepalive_complete(2);
        pending.push(first.clone());
        pending.push(second.clone());

        let mut small = [0xff; 4];
        assert_eq!(pending.read(&mut small), 1);
        assert_eq!(small[0], 0);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.read(&mut []), 0);

        let n = pending.read(&mut buf);
        assert_eq!(&buf[..n], first.as_bytes());
        let n = pending.read(&mut buf);
        assert_eq!(&buf[..n], second.as_bytes());
        assert!(pending.is_empty());
    }
}
