//! Deterministic JSON codec for response payloads.
//!
//! Plain JSON kinds map one-to-one. Timestamps, dates and decimals are
//! written as tagged wrapper objects:
//!
//! ```json
//! {"_spec_type": "date", "val": "04/21/2021"}
//! ```
//!
//! and resolved on decode through a closed registry of extension kinds.
//!
//! ```
//! use redis_response_cache::{codec, Value};
//!
//! let value = Value::object([("success", Value::from(true))]);
//! let encoded = codec::encode(&value)?;
//! assert_eq!(encoded, r#"{"success":true}"#);
//! assert_eq!(codec::decode(&encoded)?, value);
//! # Ok::<(), redis_response_cache::SerializationError>(())
//! ```

use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate};
use serde_json::{Map as JsonMap, Number};

use crate::{error::SerializationError, value::Map, Value};

/// Key holding the extension tag inside a wrapper object.
pub const TYPE_KEY: &str = "_spec_type";
/// Key holding the canonical string inside a wrapper object.
pub const VALUE_KEY: &str = "val";

/// Canonical timestamp pattern, whole-second precision.
pub const DATETIME_FORMAT: &str = "%m/%d/%Y %I:%M:%S %p %z";
/// Canonical calendar date pattern.
pub const DATE_FORMAT: &str = "%m/%d/%Y";

/// The kinds of value that travel as tagged wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    /// [`Value::DateTime`]
    DateTime,
    /// [`Value::Date`]
    Date,
    /// [`Value::Decimal`]
    Decimal,
}

type ParseFn = fn(&str) -> Result<Value, String>;

/// Wire tag to extension kind. Decoding consults nothing else.
const REGISTRY: &[(&str, Extension)] = &[
    ("datetime", Extension::DateTime),
    ("date", Extension::Date),
    ("decimal", Extension::Decimal),
];

impl Extension {
    /// The wire tag written under [`TYPE_KEY`].
    pub fn tag(self) -> &'static str {
        match self {
            Extension::DateTime => "datetime",
            Extension::Date => "date",
            Extension::Decimal => "decimal",
        }
    }

    /// Resolves a wire tag. Unknown tags yield `None`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        REGISTRY.iter().find(|(t, _)| *t == tag).map(|(_, kind)| *kind)
    }

    fn parser(self) -> ParseFn {
        match self {
            Extension::DateTime => parse_datetime,
            Extension::Date => parse_date,
            Extension::Decimal => parse_decimal,
        }
    }

    fn parse(self, val: &str) -> Result<Value, SerializationError> {
        (self.parser())(val).map_err(|reason| {
            SerializationError::MalformedExtension {
                tag: self.tag().to_owned(),
                reason,
            }
        })
    }
}

fn parse_datetime(val: &str) -> Result<Value, String> {
    DateTime::parse_from_str(val, DATETIME_FORMAT)
        .map(Value::DateTime)
        .map_err(|e| e.to_string())
}

fn parse_date(val: &str) -> Result<Value, String> {
    NaiveDate::parse_from_str(val, DATE_FORMAT)
        .map(Value::Date)
        .map_err(|e| e.to_string())
}

fn parse_decimal(val: &str) -> Result<Value, String> {
    BigDecimal::from_str(val).map(Value::Decimal).map_err(|e| e.to_string())
}

/// Encodes a payload to its canonical string.
///
/// Fails for [`Value::Opaque`], non-finite floats, and objects that already
/// use the reserved [`TYPE_KEY`].
pub fn encode(value: &Value) -> Result<String, SerializationError> {
    Ok(serde_json::to_string(&to_json(value)?)?)
}

/// Decodes a string produced by [`encode`].
pub fn decode(encoded: &str) -> Result<Value, SerializationError> {
    let json: serde_json::Value = serde_json::from_str(encoded)?;
    from_json(json)
}

fn wrap(kind: Extension, val: String) -> serde_json::Value {
    let mut map = JsonMap::new();
    map.insert(
        TYPE_KEY.to_owned(),
        serde_json::Value::String(kind.tag().to_owned()),
    );
    map.insert(VALUE_KEY.to_owned(), serde_json::Value::String(val));
    serde_json::Value::Object(map)
}

fn to_json(value: &Value) -> Result<serde_json::Value, SerializationError> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number(Number::from(*i)),
        Value::Float(x) => serde_json::Value::Number(
            Number::from_f64(*x)
                .ok_or(SerializationError::NonFiniteNumber(*x))?,
        ),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Array(items) => serde_json::Value::Array(
            items.iter().map(to_json).collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            if map.contains_key(TYPE_KEY) {
                return Err(SerializationError::ReservedKey(TYPE_KEY));
            }
            let mut out = JsonMap::new();
            for (k, v) in map {
                out.insert(k.clone(), to_json(v)?);
            }
            serde_json::Value::Object(out)
        }
        Value::DateTime(dt) => {
            wrap(Extension::DateTime, dt.format(DATETIME_FORMAT).to_string())
        }
        Value::Date(d) => {
            wrap(Extension::Date, d.format(DATE_FORMAT).to_string())
        }
        Value::Decimal(d) => wrap(Extension::Decimal, d.to_string()),
        Value::Opaque(o) => {
            return Err(SerializationError::Unsupported {
                type_name: o.type_name().to_owned(),
            })
        }
    })
}

fn from_json(json: serde_json::Value) -> Result<Value, SerializationError> {
    Ok(match json {
        serde_json::Value::Array(items) => Value::Array(
            items.into_iter().map(from_json).collect::<Result<_, _>>()?,
        ),
        serde_json::Value::Object(map) if map.contains_key(TYPE_KEY) => {
            unwrap_extension(map)?
        }
        serde_json::Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| Ok((k, from_json(v)?)))
                .collect::<Result<Map, SerializationError>>()?,
        ),
        scalar => Value::from(scalar),
    })
}

fn unwrap_extension(
    map: JsonMap<String, serde_json::Value>,
) -> Result<Value, SerializationError> {
    let tag = match map.get(TYPE_KEY) {
        Some(serde_json::Value::String(tag)) => tag.clone(),
        other => {
            return Err(SerializationError::MalformedExtension {
                tag: other.map(ToString::to_string).unwrap_or_default(),
                reason: format!("`{TYPE_KEY}` must be a string"),
            })
        }
    };
    let val = match map.get(VALUE_KEY) {
        Some(serde_json::Value::String(val)) => val.clone(),
        Some(_) => {
            return Err(SerializationError::MalformedExtension {
                tag,
                reason: format!("`{VALUE_KEY}` must be a string"),
            })
        }
        None => {
            return Err(SerializationError::MalformedExtension {
                tag,
                reason: format!("missing `{VALUE_KEY}`"),
            })
        }
    };
    match Extension::from_tag(&tag) {
        Some(kind) => kind.parse(&val),
        None => Err(SerializationError::UnknownExtension { tag, val }),
    }
}
