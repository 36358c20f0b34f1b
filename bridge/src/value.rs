use bson::Bson;

use crate::error::{BridgeError, ErrorCode, Result};

/// How a value is going to be used in the generated SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFor {
    /// A plain SQL literal, compared against JSON_EXTRACT/JSON_VALUE output.
    Sql,

    /// A standalone JSON document passed as a string literal, e.g. the
    /// second argument of JSON_CONTAINS.
    Json,

    /// A value nested inside a JSON_OBJECT()/JSON_ARRAY() call.
    JsonNested,
}

/// Escape `\` and `'` so the result is safe inside a single-quoted SQL
/// string literal.
pub fn escape_essential_chars(from: &str) -> String {
    let mut out = String::with_capacity(from.len());

    for c in from.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }

    out
}

fn escape_double_quoted(from: &str) -> String {
    let mut out = String::with_capacity(from.len());

    for c in from.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }

    out
}

/// Format a double so that it stays a double: integral values get a
/// trailing `.0` to prevent them from reading back as integers.
pub fn double_to_string(d: f64) -> String {
    let s = format!("{}", d);

    if s.contains('.') || s.contains('e') || s.contains("inf") || s.contains("NaN") {
        s
    } else {
        format!("{}.0", s)
    }
}

pub fn get_number_as_double(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(i) => Some(*i as f64),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Double(d) => Some(*d),
        _ => None,
    }
}

pub fn get_number_as_integer(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(i) => Some(*i as i64),
        Bson::Int64(i) => Some(*i),
        Bson::Double(d) if *d == d.trunc() => Some(*d as i64),
        _ => None,
    }
}

/// JSON text of a value, as stored in the `doc` column.
pub fn bson_to_json_text(value: &Bson) -> String {
    value.clone().into_relaxed_extjson().to_string()
}

/// Render one document value for interpolation into SQL.
pub fn element_to_value(value: &Bson, value_for: ValueFor, op: &str) -> Result<String> {
    let rval = match value {
        Bson::Double(d) => double_to_string(*d),
        Bson::Int32(i) => i.to_string(),
        Bson::Int64(i) => i.to_string(),
        Bson::Boolean(b) => b.to_string(),

        Bson::String(s) => match value_for {
            ValueFor::Sql | ValueFor::Json => {
                format!("'\"{}\"'", escape_essential_chars(&escape_double_quoted(s)))
            }
            ValueFor::JsonNested => format!("\"{}\"", escape_double_quoted(s)),
        },

        Bson::Null => match value_for {
            ValueFor::JsonNested => "null".to_string(),
            _ => "'null'".to_string(),
        },

        Bson::DateTime(dt) => {
            let ms = dt.timestamp_millis();
            match value_for {
                ValueFor::Sql => ms.to_string(),
                ValueFor::Json => format!("'{{\"$date\": {}}}'", ms),
                ValueFor::JsonNested => format!("JSON_OBJECT(\"$date\", {})", ms),
            }
        }

        Bson::Timestamp(ts) => match value_for {
            ValueFor::JsonNested => format!(
                "JSON_OBJECT(\"$timestamp\", JSON_OBJECT(\"t\", {}, \"i\", {}))",
                ts.time, ts.increment
            ),
            _ => format!(
                "'{{\"$timestamp\": {{\"t\": {}, \"i\": {}}}}}'",
                ts.time, ts.increment
            ),
        },

        Bson::ObjectId(oid) => match value_for {
            ValueFor::JsonNested => format!("JSON_OBJECT(\"$oid\", \"{}\")", oid.to_hex()),
            _ => format!("'{{\"$oid\": \"{}\"}}'", oid.to_hex()),
        },

        Bson::Binary(bin) => {
            let data = bson::Bson::Binary(bin.clone()).into_relaxed_extjson().to_string();
            match value_for {
                ValueFor::JsonNested => format!("JSON_COMPACT('{}')", escape_essential_chars(&data)),
                _ => format!("'{}'", escape_essential_chars(&data)),
            }
        }

        Bson::RegularExpression(_) => {
            return Err(BridgeError::soft(
                format!("Can't have regex as arg to {}", op),
                ErrorCode::BadValue,
            ));
        }

        Bson::Document(_) | Bson::Array(_) => {
            let json = bson_to_json_text(value);
            match value_for {
                ValueFor::JsonNested => {
                    format!("JSON_COMPACT('{}')", escape_essential_chars(&json))
                }
                _ => format!("'{}'", escape_essential_chars(&json)),
            }
        }

        other => {
            let json = other.clone().into_relaxed_extjson().to_string();
            match value_for {
                ValueFor::JsonNested => {
                    format!("JSON_COMPACT('{}')", escape_essential_chars(&json))
                }
                _ => format!("'{}'", escape_essential_chars(&json)),
            }
        }
    };

    Ok(rval)
}
