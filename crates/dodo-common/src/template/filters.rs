//! Filters available to app resource templates
//!
//! - `default`: fallback for undefined or null values
//! - `required`: fail rendering when a value is undefined
//! - `base64_encode` / `base64_decode`: for Secret data
//! - `quote`: emit a value as a double-quoted YAML scalar (keys, passwords)
//! - `label`: turn an arbitrary string into a DNS label

use base64::{engine::general_purpose::STANDARD, Engine};
use minijinja::{Error, ErrorKind, Value};

/// `${value | default("fallback")}`
///
/// Empty strings are kept; only undefined and null fall back.
pub fn default_filter(value: Value, fallback: Value) -> Value {
    if value.is_undefined() || value.is_none() {
        fallback
    } else {
        value
    }
}

/// `${value | required}`
pub fn required(value: Value) -> Result<Value, Error> {
    if value.is_undefined() || value.is_none() {
        Err(Error::new(
            ErrorKind::UndefinedError,
            "required value is undefined",
        ))
    } else {
        Ok(value)
    }
}

/// `${value | base64_encode}`
pub fn base64_encode(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}

/// `${value | base64_decode}`
pub fn base64_decode(value: &str) -> Result<String, Error> {
    let bytes = STANDARD.decode(value).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("base64 decode error: {}", e),
        )
    })?;
    String::from_utf8(bytes).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("base64 decode produced invalid UTF-8: {}", e),
        )
    })
}

/// `${value | quote}`
///
/// JSON string syntax is a subset of YAML double-quoted scalars, so PEM keys
/// with embedded newlines survive the trip.
pub fn quote(value: Value) -> Result<String, Error> {
    let text = if let Some(s) = value.as_str() {
        s.to_string()
    } else {
        value.to_string()
    };
    serde_json::to_string(&text).map_err(|e| {
        Error::new(ErrorKind::InvalidOperation, format!("quote failed: {}", e))
    })
}

/// `${value | label}`
pub fn label(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').chars().take(63).collect()
}
