//! MAVLink parameter protocol on top of the parameter store.

use vcu_params::{Param, ParamError, ParamStore, ParamValue, MAX_KEY_LEN};
use vcu_proto::mavlink::common::{MavMessage, MavParamType, PARAM_VALUE_DATA};

/// Wire name of a `param_id` field: up to 16 bytes, NUL terminated when shorter.
pub fn param_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn param_id(key: &str) -> [u8; MAX_KEY_LEN] {
    let mut id = [0u8; MAX_KEY_LEN];
    let n = key.len().min(MAX_KEY_LEN);
    id[..n].copy_from_slice(&key.as_bytes()[..n]);
    id
}

/// Wire type and value of a parameter.
pub fn wire_value(value: &ParamValue) -> (MavParamType, f32) {
    match value {
        ParamValue::Number(n) if n.fract() == 0.0 => (MavParamType::MAV_PARAM_TYPE_INT32, *n as f32),
        ParamValue::Number(n) => (MavParamType::MAV_PARAM_TYPE_REAL32, *n as f32),
        ParamValue::Bool(b) => (MavParamType::MAV_PARAM_TYPE_UINT8, if *b { 1.0 } else { 0.0 }),
        ParamValue::Text(_) => (MavParamType::MAV_PARAM_TYPE_INT32, 0.0),
    }
}

pub fn param_value(params: &ParamStore, param: Param, index: u16, count: u16) -> MavMessage {
    let (param_type, value) = wire_value(&params.get(param));
    MavMessage::PARAM_VALUE(PARAM_VALUE_DATA {
        param_value: value,
        param_count: count,
        param_index: index,
        param_id: param_id(param.key()),
        param_type,
    })
}

/// PARAM_REQUEST_READ lookup: by index when `index >= 0`, else by name.
pub fn lookup(params: &ParamStore, index: i16, name: &str) -> Option<Param> {
    let defined = params.params();
    if index >= 0 {
        defined.get(index as usize).copied()
    } else {
        Param::from_key(name).filter(|p| defined.contains(p))
    }
}

/// Applies a PARAM_SET value, coerced to the declared kind of `param`.
pub fn apply(params: &ParamStore, param: Param, value: f32) -> Result<(), ParamError> {
    params.set(param, param.kind().coerce_number(f64::from(value)))
}

/// Position of `param` in the wire list and the list length.
pub fn position(params: &ParamStore, param: Param) -> (u16, u16) {
    let defined = params.params();
    let index = defined.iter().position(|p| *p == param).unwrap_or(0);
    (index as u16, defined.len() as u16)
}
