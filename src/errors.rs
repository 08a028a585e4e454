//! Error types shared by the decoding, caching and scanning layers.
//!
//! Application boundaries (archive loading, configuration, the CLI) use
//! `anyhow`; these typed errors exist where callers need to branch on the
//! failure or tag it with the unit it belongs to.

use thiserror::Error;

/// Failure while decoding a class file or a method's instruction stream.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("unexpected end of input at byte {offset} (needed {needed} more)")]
    Truncated { offset: usize, needed: usize },

    #[error("bad class-file magic 0x{0:08X}")]
    BadMagic(u32),

    #[error("unknown constant-pool tag {tag} at slot {index}")]
    UnknownConstantTag { tag: u8, index: u16 },

    #[error("literal index {index} outside table of {len} slots")]
    LiteralOutOfBounds { index: u16, len: usize },

    #[error("literal {index} is not a {expected}")]
    UnexpectedLiteral { index: u16, expected: &'static str },

    #[error("unknown opcode 0x{opcode:02X} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },

    #[error("invalid modified UTF-8 in constant {index}")]
    InvalidUtf8 { index: u16 },
}

/// Failure while releasing a cached handle's resource.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReleaseError {
    #[error("handle {0} was already released")]
    AlreadyReleased(String),

    #[error("release listener failed for {name}: {message}")]
    Listener { name: String, message: String },
}

/// Per-unit scan failure. Scoped to the unit; other units keep scanning.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    #[error("{unit}: handle could not be materialized")]
    HandleUnavailable { unit: String },

    #[error("{unit}: method {method} has no code")]
    MissingCode { unit: String, method: String },

    #[error("{unit}: {source}")]
    Decode {
        unit: String,
        #[source]
        source: DecodeError,
    },
}

impl ScanError {
    pub fn unit(&self) -> &str {
        match self {
            ScanError::HandleUnavailable { unit }
            | ScanError::MissingCode { unit, .. }
            | ScanError::Decode { unit, .. } => unit,
        }
    }
}

/// Turns a panic payload into a printable message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_error_carries_unit_name() {
        let err = ScanError::Decode {
            unit: "com.example.App".to_string(),
            source: DecodeError::LiteralOutOfBounds { index: 40, len: 12 },
        };
        assert_eq!(err.unit(), "com.example.App");
        assert!(err.to_string().contains("literal index 40"));
    }

    #[test]
    fn panic_message_handles_both_payload_kinds() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(format!("owned {}", 1));
        assert_eq!(panic_message(boxed.as_ref()), "owned 1");
    }
}
