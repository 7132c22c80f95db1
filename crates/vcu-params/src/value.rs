use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Number,
    Bool,
    Text,
}

impl ParamKind {
    /// Converts a wire number (MAVLink PARAM_SET carries everything as f32) into this kind.
    pub fn coerce_number(self, v: f64) -> ParamValue {
        match self {
            ParamKind::Number => ParamValue::Number(v),
            ParamKind::Bool => ParamValue::Bool(v != 0.0),
            ParamKind::Text => ParamValue::Text(v.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Number(_) => ParamKind::Number,
            ParamValue::Bool(_) => ParamKind::Bool,
            ParamValue::Text(_) => ParamKind::Text,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            ParamValue::Number(v) => *v,
            ParamValue::Bool(b) => if *b { 1.0 } else { 0.0 },
            ParamValue::Text(_) => 0.0,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            ParamValue::Number(v) => *v != 0.0,
            ParamValue::Bool(b) => *b,
            ParamValue::Text(s) => !s.is_empty(),
        }
    }

    /// Parses a persisted string back into a value of the declared kind.
    pub fn parse(kind: ParamKind, s: &str) -> Option<ParamValue> {
        let s = s.trim();
        match kind {
            ParamKind::Number => s.parse::<f64>().ok().filter(|v| v.is_finite()).map(ParamValue::Number),
            ParamKind::Bool => match s {
                "true" => Some(ParamValue::Bool(true)),
                "false" => Some(ParamValue::Bool(false)),
                _ => None,
            },
            ParamKind::Text => Some(ParamValue::Text(s.to_string())),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Number(v) => write!(f, "{}", v),
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self { ParamValue::Number(v) }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self { ParamValue::Number(v as f64) }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self { ParamValue::Number(v as f64) }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self { ParamValue::Number(v as f64) }
}

impl From<u8> for ParamValue {
    fn from(v: u8) -> Self { ParamValue::Number(v as f64) }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self { ParamValue::Bool(v) }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self { ParamValue::Text(v.to_string()) }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self { ParamValue::Text(v) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundKind {
    Min,
    Max,
}

impl fmt::Display for BoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundKind::Min => f.write_str("min"),
            BoundKind::Max => f.write_str("max"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Bounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Bounds {
    pub const NONE: Bounds = Bounds { min: None, max: None };

    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }

    /// Which bound `v` violates, min checked first.
    pub fn violation(&self, v: f64) -> Option<BoundKind> {
        if self.min.is_some_and(|min| v < min) {
            return Some(BoundKind::Min);
        }
        if self.max.is_some_and(|max| v > max) {
            return Some(BoundKind::Max);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_min_checked_before_max() {
        let b = Bounds::new(Some(0.0), Some(1.0));
        assert_eq!(b.violation(-0.1), Some(BoundKind::Min));
        assert_eq!(b.violation(1.1), Some(BoundKind::Max));
        assert_eq!(b.violation(0.0), None);
        assert_eq!(b.violation(1.0), None);
        assert_eq!(Bounds::NONE.violation(1e12), None);
    }

    #[test]
    fn test_parse_persisted_strings() {
        assert_eq!(ParamValue::parse(ParamKind::Number, " 12.5\n"), Some(ParamValue::Number(12.5)));
        assert_eq!(ParamValue::parse(ParamKind::Number, "NaN"), None);
        assert_eq!(ParamValue::parse(ParamKind::Bool, "true"), Some(ParamValue::Bool(true)));
        assert_eq!(ParamValue::parse(ParamKind::Bool, "1"), None);
        assert_eq!(ParamValue::parse(ParamKind::Text, "2.6.8"), Some(ParamValue::Text("2.6.8".into())));
    }

    #[test]
    fn test_coerce_wire_number() {
        assert_eq!(ParamKind::Bool.coerce_number(1.0), ParamValue::Bool(true));
        assert_eq!(ParamKind::Bool.coerce_number(0.0), ParamValue::Bool(false));
        assert_eq!(ParamKind::Number.coerce_number(0.3), ParamValue::Number(0.3));
    }
}
