use mavlink::common::MavMessage;
use mavlink::{MavlinkVersion, Message};

use crate::error::ProtoError;
use crate::lfs::{lfs_meta, LfsMessage};

/// Maximum MAVLink payload.
pub const MAX_PAYLOAD_LEN: usize = 255;

/// Anything the vehicle sends or understands: the common dialect plus its own messages.
#[derive(Debug, Clone, PartialEq)]
pub enum VcuMessage {
    Common(MavMessage),
    Lfs(LfsMessage),
}

impl From<MavMessage> for VcuMessage {
    fn from(m: MavMessage) -> Self {
        VcuMessage::Common(m)
    }
}

impl From<LfsMessage> for VcuMessage {
    fn from(m: LfsMessage) -> Self {
        VcuMessage::Lfs(m)
    }
}

/// CRC extra for `id`, None when the id is not part of the vehicle dialect.
pub fn crc_extra(id: u32) -> Option<u8> {
    if let Some((_, extra)) = lfs_meta(id) {
        return Some(extra);
    }
    match MavMessage::extra_crc(id) {
        0 => None,
        extra => Some(extra),
    }
}

/// v2 drops trailing zero bytes but always keeps the first one.
pub fn truncate_zeros(payload: &[u8]) -> &[u8] {
    let mut len = payload.len();
    while len > 1 && payload[len - 1] == 0 {
        len -= 1;
    }
    &payload[..len]
}

impl VcuMessage {
    pub fn message_id(&self) -> u32 {
        match self {
            VcuMessage::Common(m) => m.message_id(),
            VcuMessage::Lfs(m) => m.message_id(),
        }
    }

    pub fn message_name(&self) -> &'static str {
        match self {
            VcuMessage::Common(m) => m.message_name(),
            VcuMessage::Lfs(m) => m.message_name(),
        }
    }

    pub fn parse(version: MavlinkVersion, id: u32, payload: &[u8]) -> Result<Self, ProtoError> {
        if lfs_meta(id).is_some() {
            return LfsMessage::parse(id, payload).map(VcuMessage::Lfs);
        }
        MavMessage::parse(version, id, payload)
            .map(VcuMessage::Common)
            .map_err(|e| ProtoError::Malformed { id, reason: format!("{:?}", e) })
    }

    /// Serialized payload; v2 payloads are zero truncated.
    pub fn payload(&self, version: MavlinkVersion) -> Result<Vec<u8>, ProtoError> {
        let full = match self {
            VcuMessage::Common(m) => {
                let mut buf = [0u8; MAX_PAYLOAD_LEN];
                let n = m.ser(version, &mut buf);
                buf[..n].to_vec()
            }
            VcuMessage::Lfs(m) => m.ser().to_vec(),
        };
        if full.len() > MAX_PAYLOAD_LEN {
            return Err(ProtoError::PayloadTooLong(full.len()));
        }
        Ok(match version {
            MavlinkVersion::V2 => truncate_zeros(&full).to_vec(),
            MavlinkVersion::V1 => full,
        })
    }

    /// `(target_system, target_component)`; `(0, 0)` for broadcast messages.
    pub fn target(&self) -> (u8, u8) {
        let VcuMessage::Common(m) = self else {
            return (0, 0);
        };
        match m {
            MavMessage::COMMAND_LONG(d) => (d.target_system, d.target_component),
            MavMessage::COMMAND_INT(d) => (d.target_system, d.target_component),
            MavMessage::PARAM_REQUEST_LIST(d) => (d.target_system, d.target_component),
            MavMessage::PARAM_REQUEST_READ(d) => (d.target_system, d.target_component),
            MavMessage::PARAM_SET(d) => (d.target_system, d.target_component),
            MavMessage::LOG_REQUEST_LIST(d) => (d.target_system, d.target_component),
            MavMessage::LOG_REQUEST_DATA(d) => (d.target_system, d.target_component),
            MavMessage::LOG_ERASE(d) => (d.target_system, d.target_component),
            MavMessage::LOG_REQUEST_END(d) => (d.target_system, d.target_component),
            MavMessage::LOGGING_DATA(d) => (d.target_system, d.target_component),
            MavMessage::LOGGING_DATA_ACKED(d) => (d.target_system, d.target_component),
            MavMessage::LOGGING_ACK(d) => (d.target_system, d.target_component),
            MavMessage::FILE_TRANSFER_PROTOCOL(d) => (d.target_system, d.target_component),
            MavMessage::MISSION_REQUEST_LIST(d) => (d.target_system, d.target_component),
            MavMessage::SET_MODE(d) => (d.target_system, 0),
            _ => (0, 0),
        }
    }
}
