//! Payload transforms applied by the relay stage
//!
//! A transform is a pure strategy: the same input always yields the same
//! output, and every byte sequence produces either a payload or a
//! [`DecodeError`]. Transforms never panic on input.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Label prepended by the default processing stage
pub const DEFAULT_LABEL: &str = "IA_1 processou: ";

/// Pure payload transformation injected into a relay stage
pub trait Transform: Send + Sync {
    /// Produce the outbound payload for an inbound payload
    fn apply(&self, payload: &[u8]) -> Result<Vec<u8>, DecodeError>;

    /// Name used in logs
    fn name(&self) -> &str;
}

/// How inbound payloads are interpreted before transformation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    /// Payload must be valid UTF-8 text
    #[default]
    Utf8,
    /// Payload is treated as raw bytes
    Binary,
}

impl PayloadEncoding {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "utf8" | "utf-8" | "text" => Some(PayloadEncoding::Utf8),
            "binary" | "bytes" | "raw" => Some(PayloadEncoding::Binary),
            _ => None,
        }
    }
}

impl fmt::Display for PayloadEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadEncoding::Utf8 => write!(f, "utf8"),
            PayloadEncoding::Binary => write!(f, "binary"),
        }
    }
}

/// Prefix a fixed label and forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixTransform {
    label: String,
    encoding: PayloadEncoding,
}

impl PrefixTransform {
    pub fn new(label: impl Into<String>, encoding: PayloadEncoding) -> Self {
        Self {
            label: label.into(),
            encoding,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn encoding(&self) -> PayloadEncoding {
        self.encoding
    }
}

impl Default for PrefixTransform {
    fn default() -> Self {
        Self::new(DEFAULT_LABEL, PayloadEncoding::Utf8)
    }
}

impl Transform for PrefixTransform {
    fn apply(&self, payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
        if self.encoding == PayloadEncoding::Utf8 {
            std::str::from_utf8(payload).map_err(|e| DecodeError::InvalidUtf8 {
                valid_up_to: e.valid_up_to(),
            })?;
        }

        let mut out = Vec::with_capacity(self.label.len() + payload.len());
        out.extend_from_slice(self.label.as_bytes());
        out.extend_from_slice(payload);
        Ok(out)
    }

    fn name(&self) -> &str {
        "prefix"
    }
}

/// Adapter turning a closure into a [`Transform`]
pub struct FnTransform<F> {
    name: String,
    f: F,
}

impl<F> FnTransform<F>
where
    F: Fn(&[u8]) -> Result<Vec<u8>, DecodeError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Transform for FnTransform<F>
where
    F: Fn(&[u8]) -> Result<Vec<u8>, DecodeError> + Send + Sync,
{
    fn apply(&self, payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
        (self.f)(payload)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> fmt::Debug for FnTransform<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTransform")
            .field("name", &self.name)
            .finish()
    }
}
