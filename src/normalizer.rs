//! Turns raw device payloads into `(type, value, unit)` tuples.
//!
//! Devices publish one of two shapes. The *standard* shape carries an explicit
//! `{"type": .., "value": .., "unit": ..}` record. The *key-value* shape is a flat
//! object where every numeric-bearing field is its own signal. Each object of a
//! payload is classified on its own, so a single array may mix both.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedReading {
    pub kind: String,
    pub value: f64,
    pub unit: String,
}

/// Classification of one payload object.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadItem<'a> {
    Standard {
        kind: String,
        value: &'a Value,
        unit: String,
    },
    KeyValue(&'a Map<String, Value>),
}

impl<'a> PayloadItem<'a> {
    /// A truthy `type` together with a present `value` (null included) marks the
    /// standard shape; anything else is scanned field by field.
    pub fn classify(object: &'a Map<String, Value>) -> Self {
        match (object.get("type"), object.get("value")) {
            (Some(kind), Some(value)) if is_truthy(kind) => PayloadItem::Standard {
                kind: scalar_text(kind),
                value,
                unit: object
                    .get("unit")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            _ => PayloadItem::KeyValue(object),
        }
    }

    fn readings(self) -> Vec<NormalizedReading> {
        match self {
            PayloadItem::Standard { kind, value, unit } => vec![NormalizedReading {
                kind,
                value: parse_float(value),
                unit,
            }],
            PayloadItem::KeyValue(fields) => fields
                .iter()
                .filter_map(|(key, raw)| {
                    parse_telemetry_value(raw).map(|value| NormalizedReading {
                        kind: key.to_lowercase(),
                        value,
                        unit: String::new(),
                    })
                })
                .collect(),
        }
    }
}

/// Extracts every reading from a decoded payload. Non-object items are skipped.
pub fn normalize(payload: &Value) -> Vec<NormalizedReading> {
    let items: &[Value] = match payload {
        Value::Array(items) => items,
        single => std::slice::from_ref(single),
    };

    items
        .iter()
        .filter_map(Value::as_object)
        .flat_map(|object| PayloadItem::classify(object).readings())
        .collect()
}

/// Numeric interpretation of a single key-value field, if it has one.
pub fn parse_telemetry_value(raw: &Value) -> Option<f64> {
    match raw {
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            if s.contains(':') {
                if let Some(hours) = parse_clock(s) {
                    return Some(hours);
                }
            }
            parse_leading_float(s)
        }
        _ => None,
    }
}

/// `H:M` or `H:M:S` as decimal hours. Each component is read by its integer
/// prefix, so `"13:30 PM"` is 13.5 and `"-1:30"` is -0.5.
fn parse_clock(s: &str) -> Option<f64> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() > 3 {
        return None;
    }
    let hours = parse_leading_int(parts.first()?)?;
    let minutes = parse_leading_int(parts.get(1)?)?;
    let seconds = parts.get(2).and_then(|s| parse_leading_int(s)).unwrap_or(0);

    Some(hours as f64 + minutes as f64 / 60.0 + seconds as f64 / 3600.0)
}

/// Optional sign followed by at least one digit, after leading whitespace.
fn parse_leading_int(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let sign_len = usize::from(s.starts_with(['+', '-']));
    let digits = s[sign_len..].bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    s[..sign_len + digits].parse().ok()
}

fn parse_float(raw: &Value) -> f64 {
    match raw {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => parse_leading_float(s).unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

/// Parses the longest decimal prefix of `s` (`"12.5 V"` gives 12.5). Only plain
/// decimal notation with an optional exponent is accepted, never `inf` or `nan`.
pub fn parse_leading_float(s: &str) -> Option<f64> {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;

    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end += 1;
    }
    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut digits = end - int_start;

    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        digits += frac_end - frac_start;
        if digits > 0 {
            end = frac_end;
        }
    }
    if digits == 0 {
        return None;
    }

    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'+') | Some(b'-')) {
            exp_end += 1;
        }
        let exp_digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits_start {
            end = exp_end;
        }
    }

    s[..end].parse::<f64>().ok()
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
