/// Errors produced while encoding or decoding item messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A declared length runs past the end of the input.
    #[error("truncated input: need {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// The tag at the cursor is not the one expected.
    #[error("tag mismatch: expected 0x{expected:02x}, found 0x{found:02x}")]
    TagMismatch { expected: u8, found: u8 },

    /// The type code is unknown or has no codec rules.
    #[error("unsupported item type {0}")]
    UnsupportedType(i64),

    /// The content length is not valid for the tag.
    #[error("invalid length {len} for tag 0x{tag:02x}")]
    InvalidLength { tag: u8, len: usize },

    /// Long-form length uses more than four length bytes.
    #[error("length field too large ({0} length bytes)")]
    LengthTooLarge(u8),

    /// Indefinite-length form (`0x80`) is not allowed.
    #[error("indefinite length form is not supported")]
    IndefiniteLength,

    /// Content is too large to express in a four-byte length.
    #[error("content length {0} exceeds the 32-bit length limit")]
    LengthOverflow(usize),

    /// REAL content carries an unknown encoding header.
    #[error("unsupported real encoding header 0x{0:02x}")]
    UnsupportedReal(u8),

    /// STRING content is not valid UTF-8.
    #[error("invalid utf-8 in string: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// The type, key and value sequences disagree on the item count.
    #[error("sequence count mismatch: {types} types, {keys} keys, {values} values")]
    SequenceCountMismatch {
        types: usize,
        keys: usize,
        values: usize,
    },

    /// A sequence ended with unread content.
    #[error("sequence has {0} unconsumed bytes")]
    SequenceNotConsumed(usize),

    /// Bytes follow the outer message container.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// An item's declared type does not match its value.
    #[error("item {key:?} declares type {declared} but holds a {actual} value")]
    ValueTypeMismatch {
        key: String,
        declared: &'static str,
        actual: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, CodecError>;
