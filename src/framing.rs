//! Byte stream to MAVLink frames, and back.

use crate::error::{Result, SessionError};
use bytes::{Buf, BytesMut};
use mavlink::common::MavMessage;
use mavlink::peek_reader::PeekReader;
use mavlink::{MavHeader, MavlinkVersion};
use std::io::Cursor;
use tracing::{trace, warn};

// Maximum buffer size to prevent OOM from malformed streams
const MAX_BUFFER_SIZE: usize = 1024 * 1024; // 1MB

const STX_V1: u8 = 0xFE;
const STX_V2: u8 = 0xFD;
const V1_OVERHEAD: usize = 8; // stx, len, seq, sys, comp, msgid, crc(2)
const V2_OVERHEAD: usize = 12; // stx, len, incompat, compat, seq, sys, comp, msgid(3), crc(2)
const V2_SIGNATURE_LEN: usize = 13;
const MAVLINK_IFLAG_SIGNED: u8 = 0x01;

#[derive(Debug, Clone)]
pub struct MavlinkFrame {
    pub header: MavHeader,
    pub message: MavMessage,
    pub version: MavlinkVersion,
}

/// Incremental frame parser for stream transports (serial, TCP).
///
/// Bytes are pushed as they arrive and complete frames are pulled out with
/// [`StreamParser::parse_next`]. Garbage between frames and frames that fail
/// their checksum are skipped one byte at a time until the next start marker.
pub struct StreamParser {
    buffer: BytesMut,
    skipped: u64,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            skipped: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        // Clear buffer if adding new data would exceed the limit
        if self.buffer.len() + data.len() > MAX_BUFFER_SIZE {
            warn!("StreamParser buffer exceeded MAX_BUFFER_SIZE. Clearing buffer to prevent OOM.");
            self.buffer.clear();
        }
        self.buffer.extend_from_slice(data);
    }

    /// Bytes held waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Frames dropped because they did not parse (bad CRC, unknown id).
    pub fn skipped_frames(&self) -> u64 {
        self.skipped
    }

    pub fn parse_next(&mut self) -> Option<MavlinkFrame> {
        loop {
            // 1. Resynchronise on a start marker
            match self.buffer.iter().position(|&b| b == STX_V2 || b == STX_V1) {
                Some(0) => {}
                Some(idx) => self.buffer.advance(idx),
                None => {
                    self.buffer.clear();
                    return None;
                }
            }

            // 2. Wait for the whole frame
            let frame_len = match expected_frame_len(&self.buffer) {
                Some(len) if len <= self.buffer.len() => len,
                _ => return None,
            };

            // 3. Parse exactly that frame
            let frame_bytes = &self.buffer[..frame_len];
            let mut reader = PeekReader::new(Cursor::new(frame_bytes));
            let parsed = if frame_bytes[0] == STX_V2 {
                mavlink::read_v2_msg::<MavMessage, _>(&mut reader)
                    .map(|(header, message)| (header, message, MavlinkVersion::V2))
            } else {
                mavlink::read_v1_msg::<MavMessage, _>(&mut reader)
                    .map(|(header, message)| (header, message, MavlinkVersion::V1))
            };

            match parsed {
                Ok((header, message, version)) => {
                    self.buffer.advance(frame_len);
                    return Some(MavlinkFrame {
                        header,
                        message,
                        version,
                    });
                }
                Err(e) => {
                    trace!("Skipping unparsable frame: {:?}", e);
                    self.skipped += 1;
                    // Invalid packet, skip STX
                    self.buffer.advance(1);
                }
            }
        }
    }
}

/// Total frame length from the header, or `None` while the header is incomplete.
fn expected_frame_len(buf: &[u8]) -> Option<usize> {
    match *buf.first()? {
        STX_V2 => {
            let payload = usize::from(*buf.get(1)?);
            let incompat = *buf.get(2)?;
            let signature = if incompat & MAVLINK_IFLAG_SIGNED != 0 {
                V2_SIGNATURE_LEN
            } else {
                0
            };
            Some(V2_OVERHEAD + payload + signature)
        }
        STX_V1 => Some(V1_OVERHEAD + usize::from(*buf.get(1)?)),
        _ => None,
    }
}

/// Encodes `message` as a MAVLink v2 frame.
pub fn encode_frame(header: MavHeader, message: &MavMessage) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    mavlink::write_v2_msg(&mut buf, header, message)
        .map_err(|e| SessionError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decodes one complete datagram (UDP carries whole frames, possibly several).
pub fn decode_datagram(data: &[u8]) -> Vec<MavlinkFrame> {
    let mut parser = StreamParser::new();
    parser.push(data);
    std::iter::from_fn(|| parser.parse_next()).collect()
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use mavlink::common::{ATTITUDE_DATA, HEARTBEAT_DATA};
    use mavlink::Message;

    fn heartbeat_bytes(seq: u8) -> Vec<u8> {
        let header = MavHeader {
            system_id: 1,
            component_id: 1,
            sequence: seq,
        };
        encode_frame(header, &MavMessage::HEARTBEAT(HEARTBEAT_DATA::default()))
            .expect("Failed to write test message")
    }

    #[test]
    fn test_partial_packet() {
        let mut parser = StreamParser::new();
        let buf = heartbeat_bytes(0);

        let split_idx = buf.len() / 2;
        parser.push(&buf[..split_idx]);
        assert!(parser.parse_next().is_none());

        parser.push(&buf[split_idx..]);
        let res = parser.parse_next().expect("Should have parsed packet");
        assert_eq!(res.message.message_id(), 0);
        assert_eq!(res.version, MavlinkVersion::V2);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_garbage_and_back_to_back_frames() {
        let mut parser = StreamParser::new();
        let mut stream = vec![0x00, 0x11, 0x22];
        stream.extend(heartbeat_bytes(1));
        stream.extend(
            encode_frame(
                MavHeader::default(),
                &MavMessage::ATTITUDE(ATTITUDE_DATA {
                    roll: 0.25,
                    ..Default::default()
                }),
            )
            .expect("encode"),
        );
        parser.push(&stream);

        let first = parser.parse_next().expect("heartbeat");
        assert_eq!(first.header.sequence, 1);
        let second = parser.parse_next().expect("attitude");
        let MavMessage::ATTITUDE(att) = second.message else {
            panic!("expected ATTITUDE");
        };
        assert_eq!(att.roll, 0.25);
        assert!(parser.parse_next().is_none());
    }

    #[test]
    fn test_corrupted_frame_is_skipped() {
        let mut bad = heartbeat_bytes(5);
        let crc_at = bad.len() - 2;
        // Replace the checksum with a wrong one containing no start marker
        let wrong: [u8; 2] = if bad[crc_at..] == [0, 0] { [1, 1] } else { [0, 0] };
        bad[crc_at..].copy_from_slice(&wrong);
        let good = heartbeat_bytes(6);

        let mut parser = StreamParser::new();
        parser.push(&bad);
        parser.push(&good);

        let frame = parser.parse_next().expect("good frame after bad one");
        assert_eq!(frame.header.sequence, 6);
        assert!(parser.skipped_frames() >= 1);
    }

    #[test]
    fn test_v1_frame() {
        let mut buf = Vec::new();
        mavlink::write_v1_msg(
            &mut buf,
            MavHeader::default(),
            &MavMessage::HEARTBEAT(HEARTBEAT_DATA::default()),
        )
        .expect("encode v1");
        let frames = decode_datagram(&buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].version, MavlinkVersion::V1);
    }
}
