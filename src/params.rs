//! Parameter synchronization.
//!
//! Tracks the PARAM_VALUE stream that follows a "list all" request. The
//! vehicle repeats the total count on every reply; the sync is complete once
//! that many distinct names have been seen. There is no timeout or retry for
//! missing parameters: callers wanting a guarantee should watch for
//! [`EventKind::AllParametersReceived`](crate::event::EventKind) with their own
//! deadline and re-issue `request_all`.

use crate::error::{Result, SessionError};
use ahash::AHashMap;
use mavlink::common::{MavParamType, PARAM_VALUE_DATA};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const PARAM_ID_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value: f32,
    pub param_type: MavParamType,
    pub index: u16,
    pub count: u16,
}

impl Parameter {
    pub fn from_mavlink(data: &PARAM_VALUE_DATA) -> Result<Self> {
        Ok(Self {
            name: decode_param_id(&data.param_id)?,
            value: data.param_value,
            param_type: data.param_type,
            index: data.param_index,
            count: data.param_count,
        })
    }
}

/// Value handed to a parameter write; selects the wire type tag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Real(f32),
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(i64::from(v))
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(i64::from(v))
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        ParamValue::Real(v)
    }
}

impl ParamValue {
    /// Smallest wire type that holds the value. Unsigned types win over the
    /// signed type of the same width for non-negative values above the
    /// signed range.
    pub fn infer_type(&self) -> MavParamType {
        match *self {
            ParamValue::Bool(_) => MavParamType::MAV_PARAM_TYPE_UINT8,
            ParamValue::Real(_) => MavParamType::MAV_PARAM_TYPE_REAL32,
            ParamValue::Int(v) => match v {
                -128..=127 => MavParamType::MAV_PARAM_TYPE_INT8,
                0..=255 => MavParamType::MAV_PARAM_TYPE_UINT8,
                -32_768..=32_767 => MavParamType::MAV_PARAM_TYPE_INT16,
                0..=65_535 => MavParamType::MAV_PARAM_TYPE_UINT16,
                0..=4_294_967_295 => MavParamType::MAV_PARAM_TYPE_UINT32,
                -2_147_483_648..=-1 => MavParamType::MAV_PARAM_TYPE_INT32,
                _ => MavParamType::MAV_PARAM_TYPE_REAL32,
            },
        }
    }

    /// PARAM_SET always carries the value as a float.
    pub fn as_f32(&self) -> f32 {
        match *self {
            ParamValue::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
            ParamValue::Int(v) => v as f32,
            ParamValue::Real(v) => v,
        }
    }
}

/// Encodes a name into the NUL-padded 16-byte wire id.
pub fn encode_param_id(name: &str) -> Result<[u8; PARAM_ID_LEN]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > PARAM_ID_LEN {
        return Err(SessionError::InvalidParameterName(name.to_string()));
    }
    let mut id = [0u8; PARAM_ID_LEN];
    id[..bytes.len()].copy_from_slice(bytes);
    Ok(id)
}

/// Decodes a wire id, stopping at the first NUL. A full 16-byte id has no terminator.
pub fn decode_param_id(id: &[u8; PARAM_ID_LEN]) -> Result<String> {
    let end = id.iter().position(|&b| b == 0).unwrap_or(PARAM_ID_LEN);
    let name = std::str::from_utf8(&id[..end])
        .map_err(|e| SessionError::malformed("PARAM_VALUE", format!("param_id: {}", e)))?;
    if name.is_empty() {
        return Err(SessionError::malformed("PARAM_VALUE", "empty param_id"));
    }
    Ok(name.to_string())
}

#[derive(Debug, Default)]
pub struct ParameterSync {
    params: AHashMap<String, Parameter>,
    expected_total: Option<u16>,
    /// 1-based
    highest_index: Option<u16>,
    completion_emitted: bool,
}

impl ParameterSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new sync cycle. Called right before PARAM_REQUEST_LIST is sent.
    pub fn begin_sync(&mut self) {
        self.reset();
        debug!("Parameter sync started");
    }

    pub fn reset(&mut self) {
        self.params.clear();
        self.expected_total = None;
        self.highest_index = None;
        self.completion_emitted = false;
    }

    /// Records one PARAM_VALUE. Returns the full name/value map the first time
    /// the number of distinct names reaches the declared total in this cycle.
    pub fn on_param_value(&mut self, param: Parameter) -> Option<BTreeMap<String, f32>> {
        if param.count > 0 {
            self.expected_total = Some(param.count);
        }
        // Replies to a single-parameter read use index 65535
        if param.index != u16::MAX {
            let one_based = param.index.saturating_add(1);
            if self.highest_index.map_or(true, |h| one_based > h) {
                self.highest_index = Some(one_based);
            }
        }

        self.params.insert(param.name.clone(), param);

        let total = self.expected_total?;
        if self.completion_emitted || total == 0 || self.params.len() < usize::from(total) {
            return None;
        }

        self.completion_emitted = true;
        info!("Received all {} parameters", total);
        Some(self.values())
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    /// Snapshot of every received parameter, sorted by name.
    pub fn values(&self) -> BTreeMap<String, f32> {
        self.params
            .iter()
            .map(|(name, p)| (name.clone(), p.value))
            .collect()
    }

    pub fn parameters(&self) -> Vec<Parameter> {
        let mut list: Vec<Parameter> = self.params.values().cloned().collect();
        list.sort_by_key(|p| p.index);
        list
    }

    pub fn received_count(&self) -> usize {
        self.params.len()
    }

    pub fn expected_total(&self) -> Option<u16> {
        self.expected_total
    }

    pub fn highest_index(&self) -> Option<u16> {
        self.highest_index
    }

    pub fn is_complete(&self) -> bool {
        self.completion_emitted
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn value(name: &str, v: f32, index: u16, count: u16) -> Parameter {
        Parameter {
            name: name.to_string(),
            value: v,
            param_type: MavParamType::MAV_PARAM_TYPE_REAL32,
            index,
            count,
        }
    }

    #[test]
    fn test_type_inference() {
        use MavParamType::*;
        let cases: [(ParamValue, MavParamType); 12] = [
            (true.into(), MAV_PARAM_TYPE_UINT8),
            (0i32.into(), MAV_PARAM_TYPE_INT8),
            ((-128i32).into(), MAV_PARAM_TYPE_INT8),
            (200i32.into(), MAV_PARAM_TYPE_UINT8),
            ((-129i32).into(), MAV_PARAM_TYPE_INT16),
            (32_767i32.into(), MAV_PARAM_TYPE_INT16),
            (40_000i32.into(), MAV_PARAM_TYPE_UINT16),
            (1_000_000i32.into(), MAV_PARAM_TYPE_UINT32),
            (u32::MAX.into(), MAV_PARAM_TYPE_UINT32),
            ((-40_000i32).into(), MAV_PARAM_TYPE_INT32),
            (i64::from(u32::MAX).saturating_add(1).into(), MAV_PARAM_TYPE_REAL32),
            (1.5f32.into(), MAV_PARAM_TYPE_REAL32),
        ];
        for (value, expected) in cases {
            assert_eq!(value.infer_type(), expected, "value {:?}", value);
        }
    }

    #[test]
    fn test_param_id_codec() {
        let id = encode_param_id("RTL_ALT").expect("fits");
        assert_eq!(&id[..7], b"RTL_ALT");
        assert!(id[7..].iter().all(|&b| b == 0));
        assert_eq!(decode_param_id(&id).expect("decodes"), "RTL_ALT");

        let full = encode_param_id("ABCDEFGHIJKLMNOP").expect("exactly 16 bytes");
        assert_eq!(decode_param_id(&full).expect("no terminator"), "ABCDEFGHIJKLMNOP");

        assert!(encode_param_id("ABCDEFGHIJKLMNOPQ").is_err());
        assert!(encode_param_id("").is_err());
        assert!(decode_param_id(&[0u8; 16]).is_err());

        let mut bad = [0u8; 16];
        bad[0] = 0xFF;
        assert!(matches!(
            decode_param_id(&bad),
            Err(SessionError::MalformedMessage { .. })
        ));
    }

    #[test]
    fn test_completion_fires_once_with_duplicates() {
        let mut sync = ParameterSync::new();
        sync.begin_sync();

        assert!(sync.on_param_value(value("A", 1.0, 0, 3)).is_none());
        assert!(sync.on_param_value(value("B", 2.0, 1, 3)).is_none());
        // Duplicate of A does not count twice
        assert!(sync.on_param_value(value("A", 1.5, 0, 3)).is_none());
        assert_eq!(sync.received_count(), 2);

        let all = sync
            .on_param_value(value("C", 3.0, 2, 3))
            .expect("complete after third distinct name");
        assert_eq!(all.len(), 3);
        assert_eq!(all["A"], 1.5);
        assert_eq!(sync.highest_index(), Some(3));

        // Late values still upsert but never re-complete
        assert!(sync.on_param_value(value("B", 9.0, 1, 3)).is_none());
        assert_eq!(sync.get("B").map(|p| p.value), Some(9.0));
        assert!(sync.is_complete());
    }

    #[test]
    fn test_begin_sync_starts_new_cycle() {
        let mut sync = ParameterSync::new();
        assert!(sync.on_param_value(value("ONLY", 1.0, 0, 1)).is_some());

        sync.begin_sync();
        assert_eq!(sync.received_count(), 0);
        assert_eq!(sync.expected_total(), None);
        assert!(sync.on_param_value(value("ONLY", 2.0, 0, 1)).is_some());
    }

    #[test]
    fn test_single_read_reply_does_not_move_highest_index() {
        let mut sync = ParameterSync::new();
        sync.on_param_value(value("X", 1.0, u16::MAX, 500));
        assert_eq!(sync.highest_index(), None);
        assert_eq!(sync.expected_total(), Some(500));
        assert!(!sync.is_complete());
    }
}
