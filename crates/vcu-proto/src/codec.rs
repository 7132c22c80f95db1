//! MAVLink v1/v2 framing for tokio byte streams.
//!
//! Frames are validated against the CRC extra of their message id and kept
//! as raw bytes so a router can forward them untouched. Ids outside the
//! dialect cannot be checked and are passed through as-is.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mavlink::MavlinkVersion;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::crc::frame_crc;
use crate::error::ProtoError;
use crate::message::{crc_extra, VcuMessage};

pub const STX_V1: u8 = 0xFE;
pub const STX_V2: u8 = 0xFD;
pub const V1_HEADER_LEN: usize = 6;
pub const V2_HEADER_LEN: usize = 10;
pub const SIGNATURE_LEN: usize = 13;
pub const IFLAG_SIGNED: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub version: MavlinkVersion,
    pub seq: u8,
    pub sys: u8,
    pub comp: u8,
    pub msg_id: u32,
    pub payload: Bytes,
    /// Complete frame as it appeared on the wire.
    pub bytes: Bytes,
}

impl RawFrame {
    pub fn encode(
        version: MavlinkVersion,
        seq: u8,
        sys: u8,
        comp: u8,
        msg: &VcuMessage,
    ) -> Result<Self, ProtoError> {
        let msg_id = msg.message_id();
        let extra = crc_extra(msg_id).ok_or(ProtoError::UnknownMessage(msg_id))?;
        let payload = msg.payload(version)?;

        let mut b = BytesMut::with_capacity(V2_HEADER_LEN + payload.len() + 2);
        match version {
            MavlinkVersion::V2 => {
                b.put_u8(STX_V2);
                b.put_u8(payload.len() as u8);
                b.put_u8(0); // incompat flags
                b.put_u8(0); // compat flags
                b.put_u8(seq);
                b.put_u8(sys);
                b.put_u8(comp);
                b.put_slice(&msg_id.to_le_bytes()[..3]);
            }
            MavlinkVersion::V1 => {
                let id = u8::try_from(msg_id).map_err(|_| ProtoError::NotV1(msg_id))?;
                b.put_u8(STX_V1);
                b.put_u8(payload.len() as u8);
                b.put_u8(seq);
                b.put_u8(sys);
                b.put_u8(comp);
                b.put_u8(id);
            }
        }
        b.put_slice(&payload);
        let crc = frame_crc(&b[1..], extra);
        b.put_u16_le(crc);

        let bytes = b.freeze();
        let header_len = bytes.len() - payload.len() - 2;
        Ok(Self {
            version,
            seq,
            sys,
            comp,
            msg_id,
            payload: bytes.slice(header_len..header_len + payload.len()),
            bytes,
        })
    }

    pub fn message(&self) -> Result<VcuMessage, ProtoError> {
        VcuMessage::parse(self.version, self.msg_id, &self.payload)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecStats {
    pub frames: u64,
    pub crc_errors: u64,
    pub bad_flags: u64,
    pub skipped_bytes: u64,
    pub unchecked: u64,
}

#[derive(Debug, Default)]
pub struct MavCodec {
    stats: CodecStats,
}

impl MavCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> CodecStats {
        self.stats
    }
}

impl Decoder for MavCodec {
    type Item = RawFrame;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, ProtoError> {
        loop {
            let Some(start) = src.iter().position(|b| *b == STX_V1 || *b == STX_V2) else {
                self.stats.skipped_bytes += src.len() as u64;
                src.clear();
                return Ok(None);
            };
            if start > 0 {
                self.stats.skipped_bytes += start as u64;
                src.advance(start);
            }

            let v2 = src[0] == STX_V2;
            let header_len = if v2 { V2_HEADER_LEN } else { V1_HEADER_LEN };
            if src.len() < header_len {
                return Ok(None);
            }

            let len = src[1] as usize;
            let (incompat, seq, sys, comp, msg_id) = if v2 {
                (src[2], src[4], src[5], src[6], u32::from_le_bytes([src[7], src[8], src[9], 0]))
            } else {
                (0, src[2], src[3], src[4], src[5] as u32)
            };

            if incompat & !IFLAG_SIGNED != 0 {
                self.stats.bad_flags += 1;
                self.stats.skipped_bytes += 1;
                src.advance(1);
                continue;
            }

            let sig_len = if incompat & IFLAG_SIGNED != 0 { SIGNATURE_LEN } else { 0 };
            let crc_at = header_len + len;
            let total = crc_at + 2 + sig_len;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            match crc_extra(msg_id) {
                Some(extra) => {
                    let want = frame_crc(&src[1..crc_at], extra);
                    let got = u16::from_le_bytes([src[crc_at], src[crc_at + 1]]);
                    if want != got {
                        trace!("mav codec: crc mismatch id={} want={:04x} got={:04x}", msg_id, want, got);
                        self.stats.crc_errors += 1;
                        self.stats.skipped_bytes += 1;
                        src.advance(1);
                        continue;
                    }
                }
                None => self.stats.unchecked += 1,
            }

            let bytes = src.split_to(total).freeze();
            self.stats.frames += 1;
            return Ok(Some(RawFrame {
                version: if v2 { MavlinkVersion::V2 } else { MavlinkVersion::V1 },
                seq,
                sys,
                comp,
                msg_id,
                payload: bytes.slice(header_len..crc_at),
                bytes,
            }));
        }
    }
}

impl Encoder<RawFrame> for MavCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: RawFrame, dst: &mut BytesMut) -> Result<(), ProtoError> {
        dst.extend_from_slice(&item.bytes);
        Ok(())
    }
}
