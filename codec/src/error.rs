//! Error type for the structured value codec.

#[derive(Debug, Clone, PartialEq)]
pub enum CodecErrorKind {
    /// The buffer ended before a complete value was read.
    UnexpectedEnd,
    /// A tag byte did not match any known variant.
    UnknownTag,
    /// A length-prefixed string was not valid UTF-8.
    InvalidUtf8,
    /// Trailing bytes remained after decoding one top-level value.
    TrailingData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodecError {
    pub message: String,
    pub kind: CodecErrorKind,
}

impl CodecError {
    pub fn new(message: impl Into<String>, kind: CodecErrorKind) -> Self {
        CodecError {
            message: message.into(),
            kind,
        }
    }
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CodecError: {} - {:?}", self.message, self.kind)
    }
}

impl std::error::Error for CodecError {}
