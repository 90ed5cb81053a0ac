//! # Command Argument Values
//!
//! Commands are ordered lists of [`Value`]s. Every supported argument kind is a
//! variant of one closed enum, so unsupported kinds are rejected by the type
//! checker rather than at encode time.
//!
//! ## Text Forms
//!
//! | Variant    | Bytes on the wire                              |
//! |------------|------------------------------------------------|
//! | `Null`     | empty block                                    |
//! | `Str`      | UTF-8 bytes                                    |
//! | `Bytes`    | raw bytes                                      |
//! | `Int`      | signed decimal ASCII                           |
//! | `UInt`     | unsigned decimal ASCII                         |
//! | `Float`    | shortest decimal that parses back to the value |
//! | `Bool`     | `1` or `0`                                     |
//! | `Time`     | Unix seconds (negative before the epoch)       |
//! | `Duration` | nanoseconds                                    |
//! | `Json`     | JSON text, only with the encoding fallback on  |

use std::borrow::Cow;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::{LkvError, LkvResult};

/// One command argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Str(String),
    Bytes(Vec<u8>),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    /// Absolute point in time.
    Time(SystemTime),
    Duration(Duration),
    /// Structured value handed to the JSON fallback serializer.
    Json(serde_json::Value),
}

impl Value {
    /// Wraps any serializable value for the JSON fallback serializer.
    ///
    /// # Errors
    /// Returns `LkvError::Encode` when `value` cannot be represented as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> LkvResult<Self> {
        serde_json::to_value(value)
            .map(Value::Json)
            .map_err(|err| LkvError::Encode(err.to_string()))
    }

    /// Returns the bytes this argument occupies inside its length-prefixed block.
    ///
    /// `json_fallback` enables `Value::Json`; without it that variant fails with
    /// `LkvError::Encode`.
    pub fn to_bytes(&self, json_fallback: bool) -> LkvResult<Cow<'_, [u8]>> {
        let bytes = match self {
            Value::Null => Cow::Borrowed(&[][..]),
            Value::Str(text) => Cow::Borrowed(text.as_bytes()),
            Value::Bytes(data) => Cow::Borrowed(data.as_slice()),
            Value::Int(value) => Cow::Owned(value.to_string().into_bytes()),
            Value::UInt(value) => Cow::Owned(value.to_string().into_bytes()),
            // `Display` for floats prints the shortest round-trip representation.
            Value::Float(value) => Cow::Owned(value.to_string().into_bytes()),
            Value::Bool(true) => Cow::Borrowed(&b"1"[..]),
            Value::Bool(false) => Cow::Borrowed(&b"0"[..]),
            Value::Time(at) => Cow::Owned(unix_seconds(*at).to_string().into_bytes()),
            Value::Duration(span) => Cow::Owned(span.as_nanos().to_string().into_bytes()),
            Value::Json(doc) => {
                if !json_fallback {
                    return Err(LkvError::Encode(
                        "structured argument requires the encoding fallback".to_string(),
                    ));
                }
                let text =
                    serde_json::to_vec(doc).map_err(|err| LkvError::Encode(err.to_string()))?;
                Cow::Owned(text)
            }
        };
        Ok(bytes)
    }
}

/// Whole seconds since the Unix epoch, floored like a signed clock.
fn unix_seconds(at: SystemTime) -> i64 {
    match at.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_secs() as i64,
        Err(before) => {
            let before = before.duration();
            let mut secs = before.as_secs() as i64;
            if before.subsec_nanos() > 0 {
                secs += 1;
            }
            -secs
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<&String> for Value {
    fn from(value: &String) -> Self {
        Value::Str(value.clone())
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Bytes(value.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Value {
    fn from(value: &[u8; N]) -> Self {
        Value::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

macro_rules! impl_from_signed {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::Int(value as i64)
            }
        })*
    };
}

macro_rules! impl_from_unsigned {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::UInt(value as u64)
            }
        })*
    };
}

impl_from_signed!(i8, i16, i32, i64, isize);
impl_from_unsigned!(u8, u16, u32, u64, usize);

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        // Widen through the shortest f32 text so 0.1f32 is sent as "0.1".
        let widened = value.to_string().parse::<f64>().unwrap_or(value as f64);
        Value::Float(widened)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<SystemTime> for Value {
    fn from(value: SystemTime) -> Self {
        Value::Time(value)
    }
}

impl From<Duration> for Value {
    fn from(value: Duration) -> Self {
        Value::Duration(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::Json(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: Value) -> String {
        String::from_utf8(value.to_bytes(false).unwrap().into_owned()).unwrap()
    }

    #[test]
    fn scalar_text_forms() {
        assert_eq!(text(Value::from("alpha")), "alpha");
        assert_eq!(text(Value::from(-42i32)), "-42");
        assert_eq!(text(Value::from(u64::MAX)), "18446744073709551615");
        assert_eq!(text(Value::from(true)), "1");
        assert_eq!(text(Value::from(false)), "0");
        assert_eq!(text(Value::Null), "");
        assert_eq!(text(Value::from(None::<i64>)), "");
    }

    #[test]
    fn floats_use_shortest_round_trip() {
        assert_eq!(text(Value::from(1.5f64)), "1.5");
        assert_eq!(text(Value::from(0.1f64)), "0.1");
        assert_eq!(text(Value::from(0.1f32)), "0.1");
        let sent = text(Value::from(std::f64::consts::PI));
        assert_eq!(sent.parse::<f64>().unwrap(), std::f64::consts::PI);
    }

    #[test]
    fn times_are_unix_seconds() {
        let at = UNIX_EPOCH + Duration::from_millis(1_700_000_000_900);
        assert_eq!(text(Value::from(at)), "1700000000");
        let before = UNIX_EPOCH - Duration::from_millis(1_500);
        assert_eq!(text(Value::from(before)), "-2");
    }

    #[test]
    fn durations_are_nanoseconds() {
        assert_eq!(text(Value::from(Duration::from_millis(3))), "3000000");
    }

    #[test]
    fn json_requires_fallback() {
        let value = Value::json(&vec![1, 2, 3]).unwrap();
        assert!(matches!(value.to_bytes(false), Err(LkvError::Encode(_))));
        assert_eq!(&*value.to_bytes(true).unwrap(), b"[1,2,3]");
    }
}
