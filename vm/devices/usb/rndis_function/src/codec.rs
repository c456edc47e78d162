// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Encoding and decoding of RNDIS control messages and data packets.
//!
//! Everything here is a pure function of its input; the engine owns all
//! state.

use crate::rndisprot;
use crate::MAX_TRANSFER_SIZE;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

const MESSAGE_HEADER_LEN: usize = size_of::<rndisprot::MessageHeader>();

/// Size of the framing that precedes each Ethernet frame on the bulk
/// endpoints.
pub const PACKET_HEADER_LEN: usize = MESSAGE_HEADER_LEN + size_of::<rndisprot::Packet>();

/// Upper bound on an encoded invalid-message indication, so the host can
/// always drain it with a reasonably sized read.
const MAX_INDICATION_LEN: usize = 1024;
const MAX_ECHO_LEN: usize = MAX_INDICATION_LEN
    - MESSAGE_HEADER_LEN
    - size_of::<rndisprot::IndicateStatus>()
    - size_of::<rndisprot::DiagnosticInfo>();

/// A control message written by the host with SEND_ENCAPSULATED_COMMAND.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage<'a> {
    Initialize {
        request_id: u32,
        major_version: u32,
        minor_version: u32,
    },
    Query {
        request_id: u32,
        oid: rndisprot::Oid,
    },
    Set {
        request_id: u32,
        oid: rndisprot::Oid,
        payload: &'a [u8],
    },
    Halt,
    Reset,
    KeepAlive {
        request_id: u32,
    },
    /// A data packet sent on the control channel. This is a protocol
    /// violation.
    DataOnControlChannel,
    /// The buffer could not be interpreted as any known message.
    Malformed {
        raw: &'a [u8],
    },
}

fn read_body<T: FromBytes + KnownLayout + Immutable>(body: &[u8]) -> Option<T> {
    T::read_from_prefix(body).ok().map(|(v, _)| v)
}

/// Decodes a control message. Lengths are validated before any typed field
/// is interpreted; anything that does not validate is [`ControlMessage::Malformed`].
pub fn decode_control_message(bytes: &[u8]) -> ControlMessage<'_> {
    decode_known(bytes).unwrap_or(ControlMessage::Malformed { raw: bytes })
}

fn decode_known(bytes: &[u8]) -> Option<ControlMessage<'_>> {
    let header: rndisprot::MessageHeader = read_body(bytes)?;
    let message_length = header.message_length as usize;
    if message_length < MESSAGE_HEADER_LEN || message_length > bytes.len() {
        return None;
    }
    let body = &bytes[MESSAGE_HEADER_LEN..message_length];
    let message = match header.message_type {
        rndisprot::MESSAGE_TYPE_INITIALIZE_MSG => {
            let request: rndisprot::InitializeRequest = read_body(body)?;
            ControlMessage::Initialize {
                request_id: request.request_id,
                major_version: request.major_version,
                minor_version: request.minor_version,
            }
        }
        rndisprot::MESSAGE_TYPE_QUERY_MSG => {
            let request: rndisprot::QueryRequest = read_body(body)?;
            ControlMessage::Query {
                request_id: request.request_id,
                oid: request.oid,
            }
        }
        rndisprot::MESSAGE_TYPE_SET_MSG => {
            let request: rndisprot::SetRequest = read_body(body)?;
            // The information buffer offset is relative to the request ID,
            // which is the start of the body.
            let offset = request.information_buffer_offset as usize;
            let len = request.information_buffer_length as usize;
            if len > rndisprot::SET_INFO_BUFFER_LENGTH {
                return None;
            }
            let payload = body.get(offset..offset.checked_add(len)?)?;
            ControlMessage::Set {
                request_id: request.request_id,
                oid: request.oid,
                payload,
            }
        }
        rndisprot::MESSAGE_TYPE_HALT_MSG => {
            let _: rndisprot::HaltRequest = read_body(body)?;
            ControlMessage::Halt
        }
        rndisprot::MESSAGE_TYPE_RESET_MSG => {
            let _: rndisprot::ResetRequest = read_body(body)?;
            ControlMessage::Reset
        }
        rndisprot::MESSAGE_TYPE_KEEPALIVE_MSG => {
            let request: rndisprot::KeepaliveRequest = read_body(body)?;
            ControlMessage::KeepAlive {
                request_id: request.request_id,
            }
        }
        rndisprot::MESSAGE_TYPE_PACKET_MSG => ControlMessage::DataOnControlChannel,
        _ => return None,
    };
    Some(message)
}

/// A fully encoded response waiting to be read by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse(Vec<u8>);

impl ControlResponse {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The RNDIS message type of the response.
    pub fn message_type(&self) -> u32 {
        read_body::<rndisprot::MessageHeader>(&self.0).map_or(0, |h| h.message_type)
    }
}

/// Writes an RNDIS message header, `payload` and `extra` into a new buffer.
fn encode_message<T: IntoBytes + Immutable>(
    message_type: u32,
    payload: &T,
    extra: &[u8],
) -> ControlResponse {
    let message_length = MESSAGE_HEADER_LEN + size_of_val(payload) + extra.len();
    let mut buf = Vec::with_capacity(message_length);
    buf.extend_from_slice(
        rndisprot::MessageHeader {
            message_type,
            message_length: message_length as u32,
        }
        .as_bytes(),
    );
    buf.extend_from_slice(payload.as_bytes());
    buf.extend_from_slice(extra);
    ControlResponse(buf)
}

pub fn encode_init_complete(request_id: u32, status: rndisprot::Status) -> ControlResponse {
    encode_message(
        rndisprot::MESSAGE_TYPE_INITIALIZE_CMPLT,
        &rndisprot::InitializeComplete {
            request_id,
            status,
            major_version: rndisprot::MAJOR_VERSION,
            minor_version: rndisprot::MINOR_VERSION,
            device_flags: rndisprot::DF_CONNECTIONLESS,
            medium: rndisprot::MEDIUM_802_3,
            max_packets_per_message: 1,
            max_transfer_size: MAX_TRANSFER_SIZE as u32,
            packet_alignment_factor: 0,
            af_list_offset: 0,
            af_list_size: 0,
        },
        &[],
    )
}

/// Encodes a query completion. `None` reports the OID as not supported.
pub fn encode_query_complete(request_id: u32, oid_data: Option<&[u8]>) -> ControlResponse {
    let (status, offset, data) = match oid_data {
        Some(data) => (
            rndisprot::STATUS_SUCCESS,
            size_of::<rndisprot::QueryComplete>() as u32,
            data,
        ),
        None => (rndisprot::STATUS_NOT_SUPPORTED, 0, &[][..]),
    };
    encode_message(
        rndisprot::MESSAGE_TYPE_QUERY_CMPLT,
        &rndisprot::QueryComplete {
            request_id,
            status,
            information_buffer_length: data.len() as u32,
            information_buffer_offset: offset,
        },
        data,
    )
}

pub fn encode_set_complete(request_id: u32, status: rndisprot::Status) -> ControlResponse {
    encode_message(
        rndisprot::MESSAGE_TYPE_SET_CMPLT,
        &rndisprot::SetComplete { request_id, status },
        &[],
    )
}

pub fn encode_reset_complete() -> ControlResponse {
    encode_message(
        rndisprot::MESSAGE_TYPE_RESET_CMPLT,
        &rndisprot::ResetComplete {
            status: rndisprot::STATUS_SUCCESS,
            addressing_reset: 0,
        },
        &[],
    )
}

pub fn encode_keepalive_complete(request_id: u32) -> ControlResponse {
    encode_message(
        rndisprot::MESSAGE_TYPE_KEEPALIVE_CMPLT,
        &rndisprot::KeepaliveComplete {
            request_id,
            status: rndisprot::STATUS_SUCCESS,
        },
        &[],
    )
}

/// Encodes an unsolicited status indication with an optional status buffer.
pub fn encode_indicate_status(status: rndisprot::Status, payload: &[u8]) -> ControlResponse {
    encode_message(
        rndisprot::MESSAGE_TYPE_INDICATE_STATUS_MSG,
        &rndisprot::IndicateStatus {
            status,
            status_buffer_length: payload.len() as u32,
            status_buffer_offset: if payload.is_empty() {
                0
            } else {
                size_of::<rndisprot::IndicateStatus>() as u32
            },
        },
        payload,
    )
}

/// Encodes the indication sent in place of a response to a message that
/// could not be handled. The offending bytes are echoed after the
/// diagnostic header, truncated to keep the indication bounded.
pub fn encode_invalid_message_indication(original: &[u8]) -> ControlResponse {
    let echoed = &original[..original.len().min(MAX_ECHO_LEN)];
    let mut status_buffer =
        Vec::with_capacity(size_of::<rndisprot::DiagnosticInfo>() + echoed.len());
    status_buffer.extend_from_slice(
        rndisprot::DiagnosticInfo {
            diag_status: rndisprot::STATUS_INVALID_DATA,
            error_offset: 0,
        }
        .as_bytes(),
    );
    status_buffer.extend_from_slice(echoed);
    encode_indicate_status(rndisprot::STATUS_INVALID_DATA, &status_buffer)
}

/// Writes a packet message wrapping `payload` to the start of `buf`.
/// Returns the number of bytes written, or `None` if `buf` is too small.
pub fn write_packet_frame(buf: &mut [u8], payload: &[u8]) -> Option<usize> {
    let message_length = PACKET_HEADER_LEN.checked_add(payload.len())?;
    let buf = buf.get_mut(..message_length)?;
    let (header, rest) = buf.split_at_mut(MESSAGE_HEADER_LEN);
    let (packet, data) = rest.split_at_mut(size_of::<rndisprot::Packet>());
    header.copy_from_slice(
        rndisprot::MessageHeader {
            message_type: rndisprot::MESSAGE_TYPE_PACKET_MSG,
            message_length: message_length as u32,
        }
        .as_bytes(),
    );
    packet.copy_from_slice(
        rndisprot::Packet {
            data_offset: size_of::<rndisprot::Packet>() as u32,
            data_length: payload.len() as u32,
            oob_data_offset: 0,
            oob_data_length: 0,
            num_oob_data_elements: 0,
            per_packet_info_offset: 0,
            per_packet_info_length: 0,
            vc_handle: 0,
            reserved: 0,
        }
        .as_bytes(),
    );
    data.copy_from_slice(payload);
    Some(message_length)
}

pub fn encode_packet_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0; PACKET_HEADER_LEN + payload.len()];
    let n = write_packet_frame(&mut buf, payload);
    debug_assert_eq!(n, Some(buf.len()));
    buf
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("packet header truncated")]
    Truncated,
    #[error("unexpected message type {0:#x} on the data channel")]
    UnexpectedType(u32),
    #[error("message length {message_length} out of range, {available} bytes available")]
    LengthOutOfRange {
        message_length: usize,
        available: usize,
    },
    #[error(
        "data offset {data_offset} length {data_length} exceed message body of {body_len} bytes"
    )]
    DataOutOfRange {
        data_offset: u32,
        data_length: u32,
        body_len: usize,
    },
}

/// Iterates over the packet messages in one receive transfer. Yields the
/// Ethernet payload of each valid message; the first invalid message is
/// yielded as an error and ends the iteration.
pub struct PacketFrames<'a> {
    remaining: &'a [u8],
    failed: bool,
}

pub fn decode_packet_frames(bytes: &[u8]) -> PacketFrames<'_> {
    PacketFrames {
        remaining: bytes,
        failed: false,
    }
}

impl<'a> PacketFrames<'a> {
    fn next_frame(&mut self) -> Result<&'a [u8], FrameError> {
        let header: rndisprot::MessageHeader =
            read_body(self.remaining).ok_or(FrameError::Truncated)?;
        if header.message_type != rndisprot::MESSAGE_TYPE_PACKET_MSG {
            return Err(FrameError::UnexpectedType(header.message_type));
        }
        let message_length = header.message_length as usize;
        if message_length < PACKET_HEADER_LEN || message_length > self.remaining.len() {
            return Err(FrameError::LengthOutOfRange {
                message_length,
                available: self.remaining.len(),
            });
        }
        let (message, rest) = self.remaining.split_at(message_length);
        // Packet offsets are relative to the data_offset field.
        let body = &message[MESSAGE_HEADER_LEN..];
        let packet: rndisprot::Packet = read_body(body).ok_or(FrameError::Truncated)?;
        let start = packet.data_offset as usize;
        let data = start
            .checked_add(packet.data_length as usize)
            .and_then(|end| body.get(start..end))
            .ok_or(FrameError::DataOutOfRange {
                data_offset: packet.data_offset,
                data_length: packet.data_length,
                body_len: body.len(),
            })?;
        self.remaining = rest;
        Ok(data)
    }
}

impl<'a> Iterator for PacketFrames<'a> {
    type Item = Result<&'a [u8], FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        // Anything shorter than a header is transfer padding.
        if self.failed || self.remaining.len() < PACKET_HEADER_LEN {
            return None;
        }
        let result = self.next_frame();
        self.failed = result.is_err();
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message<T: IntoBytes + Immutable>(message_type: u32, body: &T, extra: &[u8]) -> Vec<u8> {
        encode_message(message_type, body, extra).0
    }

    #[test]
    fn decode_initialize() {
        let bytes = message(
            rndisprot::MESSAGE_TYPE_INITIALIZE_MSG,
            &rndisprot::InitializeRequest {
                request_id: 7,
                major_version: 1,
                minor_version: 0,
                max_transfer_size: 0x4000,
            },
            &[],
        );
        assert_eq!(
            decode_control_message(&bytes),
            ControlMessage::Initialize {
                request_id: 7,
                major_version: 1,
                minor_version: 0,
            }
        );
    }

    #[test]
    fn decode_too_short_is_malformed() {
        let bytes = message(
            rndisprot::MESSAGE_TYPE_QUERY_MSG,
            &rndisprot::QueryRequest {
                request_id: 1,
                oid: rndisprot::OID_GEN_LINK_SPEED,
                information_buffer_length: 0,
                information_buffer_offset: 0,
                device_vc_handle: 0,
            },
            &[],
        );
        for len in 0..bytes.len() {
            assert!(
                matches!(
                    decode_control_message(&bytes[..len]),
                    ControlMessage::Malformed { .. }
                ),
                "{len}"
            );
        }
        assert!(matches!(
            decode_control_message(&bytes),
            ControlMessage::Query { request_id: 1, .. }
        ));
    }

    #[test]
    fn decode_message_length_must_fit_buffer() {
        let mut bytes = message(
            rndisprot::MESSAGE_TYPE_KEEPALIVE_MSG,
            &rndisprot::KeepaliveRequest { request_id: 3 },
            &[],
        );
        bytes[4] = 0xff;
        assert_eq!(
            decode_control_message(&bytes),
            ControlMessage::Malformed { raw: &bytes }
        );
    }

    #[test]
    fn decode_unknown_type_is_malformed() {
        let bytes = message(0x1234, &[0u32; 4], &[]);
        assert!(matches!(
            decode_control_message(&bytes),
            ControlMessage::Malformed { .. }
        ));
    }

    #[test]
    fn decode_packet_on_control_channel() {
        let bytes = encode_packet_frame(&[1, 2, 3]);
        assert_eq!(
            decode_control_message(&bytes),
            ControlMessage::DataOnControlChannel
        );
    }

    fn set_message(offset: u32, len: u32, payload: &[u8]) -> Vec<u8> {
        message(
            rndisprot::MESSAGE_TYPE_SET_MSG,
            &rndisprot::SetRequest {
                request_id: 9,
                oid: rndisprot::OID_GEN_CURRENT_PACKET_FILTER,
                information_buffer_length: len,
                information_buffer_offset: offset,
                device_vc_handle: 0,
            },
            payload,
        )
    }

    #[test]
    fn decode_set_payload() {
        let filter = 0x2du32.to_le_bytes();
        let bytes = set_message(20, 4, &filter);
        assert_eq!(
            decode_control_message(&bytes),
            ControlMessage::Set {
                request_id: 9,
                oid: rndisprot::OID_GEN_CURRENT_PACKET_FILTER,
                payload: &filter,
            }
        );
    }

    #[test]
    fn decode_set_payload_out_of_bounds() {
        let filter = 0x2du32.to_le_bytes();
        // Past the end of the message.
        let bytes = set_message(20, 8, &filter);
        assert!(matches!(
            decode_control_message(&bytes),
            ControlMessage::Malformed { .. }
        ));
        // Offset overflow.
        let bytes = set_message(u32::MAX, 4, &filter);
        assert!(matches!(
            decode_control_message(&bytes),
            ControlMessage::Malformed { .. }
        ));
        // Larger than the information buffer ceiling.
        let big = [0u8; rndisprot::SET_INFO_BUFFER_LENGTH + 4];
        let bytes = set_message(20, big.len() as u32, &big);
        assert!(matches!(
            decode_control_message(&bytes),
            ControlMessage::Malformed { .. }
        ));
    }

    #[test]
    fn query_complete_layout() {
        let response = encode_query_complete(5, Some(&[0xaa, 0xbb, 0xcc, 0xdd]));
        let bytes = response.as_bytes();
        assert_eq!(response.message_type(), rndisprot::MESSAGE_TYPE_QUERY_CMPLT);
        assert_eq!(bytes.len(), 8 + 16 + 4);
        let (complete, rest) =
            rndisprot::QueryComplete::read_from_prefix(&bytes[MESSAGE_HEADER_LEN..]).unwrap();
        assert_eq!(complete.request_id, 5);
        assert_eq!(complete.status, rndisprot::STATUS_SUCCESS);
        assert_eq!(complete.information_buffer_length, 4);
        assert_eq!(complete.information_buffer_offset, 16);
        assert_eq!(rest, &[0xaa, 0xbb, 0xcc, 0xdd]);

        let response = encode_query_complete(6, None);
        let (complete, rest) = rndisprot::QueryComplete::read_from_prefix(
            &response.as_bytes()[MESSAGE_HEADER_LEN..],
        )
        .unwrap();
        assert_eq!(complete.status, rndisprot::STATUS_NOT_SUPPORTED);
        assert_eq!(complete.information_buffer_length, 0);
        assert_eq!(complete.information_buffer_offset, 0);
        assert!(rest.is_empty());
    }

    #[test]
    fn init_complete_advertises_one_packet_per_transfer() {
        let response = encode_init_complete(11, rndisprot::STATUS_SUCCESS);
        let (header, body) =
            rndisprot::MessageHeader::read_from_prefix(response.as_bytes()).unwrap();
        assert_eq!(header.message_length as usize, response.len());
        let complete = rndisprot::InitializeComplete::read_from_bytes(body).unwrap();
        assert_eq!(complete.request_id, 11);
        assert_eq!(complete.device_flags, rndisprot::DF_CONNECTIONLESS);
        assert_eq!(complete.medium, rndisprot::MEDIUM_802_3);
        assert_eq!(complete.max_packets_per_message, 1);
        assert_eq!(complete.max_transfer_size, MAX_TRANSFER_SIZE as u32);
    }

    #[test]
    fn invalid_message_indication_echoes_input() {
        let original = [1, 2, 3, 4, 5];
        let response = encode_invalid_message_indication(&original);
        let bytes = response.as_bytes();
        assert_eq!(
            response.message_type(),
            rndisprot::MESSAGE_TYPE_INDICATE_STATUS_MSG
        );
        let (status, rest) =
            rndisprot::IndicateStatus::read_from_prefix(&bytes[MESSAGE_HEADER_LEN..]).unwrap();
        assert_eq!(status.status, rndisprot::STATUS_INVALID_DATA);
        assert_eq!(status.status_buffer_length as usize, 8 + original.len());
        assert_eq!(status.status_buffer_offset, 12);
        assert_eq!(&rest[8..], &original);

        let huge = vec![0x5a; 4096];
        let response = encode_invalid_message_indication(&huge);
        assert_eq!(response.len(), MAX_INDICATION_LEN);
    }

    #[test]
    fn packet_frame_round_trip() {
        let payload = (0..60).collect::<Vec<u8>>();
        let frame = encode_packet_frame(&payload);
        assert_eq!(frame.len(), PACKET_HEADER_LEN + payload.len());
        let frames: Vec<_> = decode_packet_frames(&frame).collect();
        assert_eq!(frames, [Ok::<_, FrameError>(&payload[..])]);
    }

    #[test]
    fn write_packet_frame_too_small() {
        let mut buf = [0; PACKET_HEADER_LEN + 3];
        assert_eq!(write_packet_frame(&mut buf, &[0; 4]), None);
        assert_eq!(
            write_packet_frame(&mut buf, &[0; 3]),
            Some(PACKET_HEADER_LEN + 3)
        );
    }

    #[test]
    fn multiple_frames_in_one_transfer() {
        let mut buf = encode_packet_frame(b"first frame");
        buf.extend(encode_packet_frame(b"second"));
        // A single padding byte, as hosts append to avoid short packets.
        buf.push(0);
        let frames: Vec<_> = decode_packet_frames(&buf).collect();
        assert_eq!(
            frames,
            [
                Ok::<_, FrameError>(&b"first frame"[..]),
                Ok(&b"second"[..])
            ]
        );
    }

    #[test]
    fn bad_second_frame_stops_decode() {
        let mut buf = encode_packet_frame(b"good");
        let mut bad = encode_packet_frame(b"bad frame");
        // data_length is at offset 12: claim more data than the message holds.
        bad[12..16].copy_from_slice(&1000u32.to_le_bytes());
        buf.extend(&bad);
        buf.extend(encode_packet_frame(b"never seen"));
        let frames: Vec<_> = decode_packet_frames(&buf).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Ok(&b"good"[..]));
        assert!(matches!(frames[1], Err(FrameError::DataOutOfRange { .. })));
    }

    #[test]
    fn frame_length_checks() {
        let mut frame = encode_packet_frame(b"abc");
        frame[4..8].copy_from_slice(&((PACKET_HEADER_LEN - 1) as u32).to_le_bytes());
        assert!(matches!(
            decode_packet_frames(&frame).next(),
            Some(Err(FrameError::LengthOutOfRange { .. }))
        ));

        let mut frame = encode_packet_frame(b"abc");
        let len = frame.len();
        frame[4..8].copy_from_slice(&((len + 1) as u32).to_le_bytes());
        assert!(matches!(
            decode_packet_frames(&frame).next(),
            Some(Err(FrameError::LengthOutOfRange { .. }))
        ));

        let mut frame = encode_packet_frame(b"abc");
        frame[0..4].copy_from_slice(&rndisprot::MESSAGE_TYPE_QUERY_MSG.to_le_bytes());
        assert_eq!(
            decode_packet_frames(&frame).next(),
            Some(Err(FrameError::UnexpectedType(
                rndisprot::MESSAGE_TYPE_QUERY_MSG
            )))
        );
    }
}
