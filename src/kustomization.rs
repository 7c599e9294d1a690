//! Kustomization normalization
//!
//! Users write kustomizations as YAML; the platform hands them back as JSON
//! objects. Both are reduced to one canonical YAML rendering (sorted keys,
//! whole floats as integers) so that formatting differences never show up as
//! drift, while the user's original text is kept whenever it still means the
//! same thing.

use std::collections::BTreeMap;

use serde_json::{Number, Value};

use akp_common::yaml::{parse_yaml, to_yaml};
use akp_common::Error;

fn normalize(value: Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                Value::Number(Number::from(f as i64))
            }
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.into_iter().map(|(k, v)| (k, normalize(v))).collect();
            Value::Object(sorted.into_iter().collect())
        }
        other => other,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Parse user-supplied kustomization text into the value sent to the
/// platform. Blank text means no kustomization.
pub fn parse(text: &str) -> Result<Option<Value>, Error> {
    let value = parse_yaml(text)
        .map_err(|e| Error::validation_for_field("agent", "kustomization", e.to_string()))?;
    if is_empty(&value) {
        return Ok(None);
    }
    if !value.is_object() {
        return Err(Error::validation_for_field(
            "agent",
            "kustomization",
            "kustomization must be a YAML mapping",
        ));
    }
    Ok(Some(normalize(value)))
}

/// Canonical YAML for a parsed value
pub fn canonical_value(value: &Value) -> Result<String, Error> {
    if is_empty(value) {
        return Ok(String::new());
    }
    // The platform may also return the document as a string
    let value = match value {
        Value::String(text) => parse(text)?.unwrap_or(Value::Null),
        other => normalize(other.clone()),
    };
    if is_empty(&value) {
        return Ok(String::new());
    }
    to_yaml(&value).map_err(|e| Error::serialization_for_kind("kustomization", e.to_string()))
}

/// Canonical YAML for user text
pub fn canonicalize(text: &str) -> Result<String, Error> {
    match parse(text)? {
        Some(value) => canonical_value(&value),
        None => Ok(String::new()),
    }
}

/// Decide what to store after reading the agent back.
///
/// Keeps `declared` verbatim when it is equivalent to what the platform
/// reports; otherwise stores the platform's canonical rendering so the
/// difference surfaces as drift.
pub fn reconcile(
    declared: Option<&str>,
    observed: Option<&Value>,
) -> Result<Option<String>, Error> {
    let observed_canonical = match observed {
        Some(value) => canonical_value(value)?,
        None => String::new(),
    };
    let declared_canonical = match declared {
        Some(text) => canonicalize(text)?,
        None => String::new(),
    };

    if declared_canonical == observed_canonical {
        return Ok(declared.map(str::to_string));
    }
    if observed_canonical.is_empty() {
        Ok(None)
    } else {
        Ok(Some(observed_canonical))
    }
}
