use crate::grammar::Version;

/// Error returned when a byte stream violates the wire grammar of the
/// active protocol version.
///
/// Always fatal to the current invocation. The codec never retries and
/// never produces a partial value.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unexpected end of input, {needed} more byte(s) required")]
    Truncated { needed: usize },
    #[error("Unknown tag 0x{tag:02x} for {version:?}")]
    UnknownTag { tag: u8, version: Version },
    #[error("Expected {expected} but found tag 0x{tag:02x}")]
    UnexpectedTag { expected: &'static str, tag: u8 },
    #[error("Reference to unassigned slot {index}")]
    DanglingRef { index: usize },
    #[error("Reference to undefined class {index}")]
    UnknownClassDef { index: usize },
    #[error("Reference to undefined type name {index}")]
    UnknownTypeRef { index: usize },
    #[error("Invalid UTF-8 in string data")]
    InvalidUtf8,
    #[error("Invalid length {length}")]
    InvalidLength { length: i64 },
    #[error("Version marker {actual:?} does not match configured {expected:?}")]
    VersionMismatch { expected: [u8; 2], actual: [u8; 2] },
    #[error("Object field name is not a string")]
    FieldNameNotString,
    #[error("Malformed fault record: {reason}")]
    MalformedFault { reason: &'static str },
    #[error("{count} trailing byte(s) after complete frame")]
    TrailingBytes { count: usize },
}
