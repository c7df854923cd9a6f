//! Typed channel parameters.
//!
//! Parameter descriptors travel on the wire as tagged JSON objects
//! (`{"dataType": "number", "minValue": ..., ...}`). They are modeled here
//! as one variant per data type so that validation is total: a value either
//! fits its descriptor or is rejected with a protocol error kind.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CommandError, ErrorKind};

/// Relative tolerance for the precision-step check: a number must land on
/// a step of `precision` from `minValue` within `precision / 1000`.
const STEP_TOLERANCE_DIV: f64 = 1000.0;

/// A named, typed attribute of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dataType", rename_all = "camelCase")]
pub enum Parameter {
    #[serde(rename_all = "camelCase")]
    Number {
        min_value: f64,
        max_value: f64,
        precision: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
        value: f64,
        read_only: bool,
    },
    #[serde(rename_all = "camelCase")]
    Bool { value: bool, read_only: bool },
    #[serde(rename_all = "camelCase")]
    String { value: String, read_only: bool },
    #[serde(rename_all = "camelCase")]
    Enum {
        enum_values: Vec<String>,
        value: String,
        read_only: bool,
    },
}

impl Parameter {
    pub fn read_only(&self) -> bool {
        match self {
            Parameter::Number { read_only, .. }
            | Parameter::Bool { read_only, .. }
            | Parameter::String { read_only, .. }
            | Parameter::Enum { read_only, .. } => *read_only,
        }
    }

    /// The current value as JSON.
    pub fn value_json(&self) -> Value {
        match self {
            Parameter::Number { value, .. } => json_number(*value),
            Parameter::Bool { value, .. } => Value::Bool(*value),
            Parameter::String { value, .. } => Value::String(value.clone()),
            Parameter::Enum { value, .. } => Value::String(value.clone()),
        }
    }

    /// Check an incoming value against this descriptor without mutating it.
    ///
    /// Numbers must be JSON numbers within `[minValue, maxValue]` and on a
    /// `precision` step from `minValue`; bools must be JSON booleans (0/1
    /// are rejected); strings must be JSON strings; enum values must be one
    /// of `enumValues`.
    pub fn check_value(&self, name: &str, value: &Value) -> Result<(), CommandError> {
        match self {
            Parameter::Number {
                min_value,
                max_value,
                precision,
                ..
            } => {
                let Some(v) = value.as_f64() else {
                    return Err(CommandError::new(
                        ErrorKind::InvalidValueType,
                        format!("Parameter {name} must be a number."),
                    ));
                };
                check_number(name, v, *min_value, *max_value, *precision, true)
            }
            Parameter::Bool { .. } => match value {
                Value::Bool(_) => Ok(()),
                _ => Err(CommandError::new(
                    ErrorKind::InvalidValueType,
                    format!("Parameter {name} must be a boolean."),
                )),
            },
            Parameter::String { .. } => match value {
                Value::String(_) => Ok(()),
                _ => Err(CommandError::new(
                    ErrorKind::InvalidValueType,
                    format!("Parameter {name} must be a string."),
                )),
            },
            Parameter::Enum { enum_values, .. } => match value {
                Value::String(s) if enum_values.iter().any(|e| e == s) => Ok(()),
                _ => Err(CommandError::new(
                    ErrorKind::InvalidValueType,
                    format!("Parameter {name} must be one of {enum_values:?}."),
                )),
            },
        }
    }

    /// Like [`check_value`](Self::check_value) but for locally-originated
    /// writes (hardware, GUI): numbers are bounds-checked only, without the
    /// precision-step constraint.
    pub fn check_local_value(&self, name: &str, value: &Value) -> Result<(), CommandError> {
        match self {
            Parameter::Number {
                min_value,
                max_value,
                precision,
                ..
            } => {
                let Some(v) = value.as_f64() else {
                    return Err(CommandError::new(
                        ErrorKind::InvalidValueType,
                        format!("Parameter {name} must be a number."),
                    ));
                };
                check_number(name, v, *min_value, *max_value, *precision, false)
            }
            _ => self.check_value(name, value),
        }
    }

    /// Store a value that has already passed the corresponding check.
    pub fn store(&mut self, new: &Value) {
        match self {
            Parameter::Number { value, .. } => {
                if let Some(v) = new.as_f64() {
                    *value = v;
                }
            }
            Parameter::Bool { value, .. } => {
                if let Some(v) = new.as_bool() {
                    *value = v;
                }
            }
            Parameter::String { value, .. } | Parameter::Enum { value, .. } => {
                if let Some(v) = new.as_str() {
                    *value = v.to_string();
                }
            }
        }
    }
}

fn check_number(
    name: &str,
    v: f64,
    min: f64,
    max: f64,
    precision: f64,
    check_step: bool,
) -> Result<(), CommandError> {
    let out_of_range = || {
        CommandError::new(
            ErrorKind::ValueOutOfRange,
            format!("Parameter {name} must be a number between {min} and {max} with precision {precision}."),
        )
    };
    if v < min || v > max {
        return Err(out_of_range());
    }
    // Precision 0 (or negative) means the value is continuous.
    if check_step && precision > 0.0 {
        let snapped = ((v - min) / precision).round() * precision + min;
        if (v - snapped).abs() > precision / STEP_TOLERANCE_DIV {
            return Err(out_of_range());
        }
    }
    Ok(())
}

/// Build a JSON number, preferring the integer representation when exact.
fn json_number(v: f64) -> Value {
    if v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
        Value::from(v as i64)
    } else {
        Value::from(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gain() -> Parameter {
        Parameter::Number {
            min_value: -10.0,
            max_value: 50.0,
            precision: 0.1,
            unit: Some("dB".into()),
            value: 10.0,
            read_only: false,
        }
    }

    #[test]
    fn descriptor_roundtrip() {
        let v = serde_json::to_value(gain()).unwrap();
        assert_eq!(v["dataType"], "number");
        assert_eq!(v["minValue"], json!(-10.0));
        assert_eq!(v["unit"], "dB");
        let back: Parameter = serde_json::from_value(v).unwrap();
        assert_eq!(back, gain());
    }

    #[test]
    fn number_bounds_are_inclusive() {
        let p = gain();
        assert!(p.check_value("gain", &json!(-10.0)).is_ok());
        assert!(p.check_value("gain", &json!(50)).is_ok());
        assert!(p.check_value("gain", &json!(12.5)).is_ok());

        let err = p.check_value("gain", &json!(51)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValueOutOfRange);
        let err = p.check_value("gain", &json!(-10.05)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValueOutOfRange);
    }

    #[test]
    fn number_respects_precision_step() {
        let p = gain();
        // 12.57 is not on a 0.1 step from -10.
        let err = p.check_value("gain", &json!(12.57)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValueOutOfRange);
        // Float noise within precision/1000 of a step is accepted.
        assert!(p.check_value("gain", &json!(12.500000004)).is_ok());
    }

    #[test]
    fn number_rejects_non_numbers() {
        let err = gain().check_value("gain", &json!("12.5")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidValueType);
        let err = gain().check_value("gain", &json!(true)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidValueType);
    }

    #[test]
    fn bool_requires_json_boolean() {
        let p = Parameter::Bool {
            value: false,
            read_only: false,
        };
        assert!(p.check_value("rfEnable", &json!(true)).is_ok());
        let err = p.check_value("rfEnable", &json!(1)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidValueType);
    }

    #[test]
    fn enum_compares_exact_strings() {
        let p = Parameter::Enum {
            enum_values: vec!["low".into(), "mid".into(), "high".into()],
            value: "low".into(),
            read_only: false,
        };
        assert!(p.check_value("txPower", &json!("mid")).is_ok());
        let err = p.check_value("txPower", &json!("MID")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidValueType);
    }

    #[test]
    fn local_check_skips_precision_but_not_bounds() {
        let p = gain();
        // Off-step but in range: fine for a local hardware write.
        assert!(p.check_local_value("gain", &json!(12.57)).is_ok());
        let err = p.check_local_value("gain", &json!(99)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValueOutOfRange);
    }

    #[test]
    fn store_updates_value() {
        let mut p = gain();
        p.store(&json!(12.5));
        assert_eq!(p.value_json(), json!(12.5));

        let mut e = Parameter::Enum {
            enum_values: vec!["a".into(), "b".into()],
            value: "a".into(),
            read_only: false,
        };
        e.store(&json!("b"));
        assert_eq!(e.value_json(), json!("b"));
    }
}
