//! Tag/length/value codec and the three-sequence item message format.
//!
//! Scalars are encoded with a one-byte tag, a DER-style length (short form
//! below 128, long form above) and the value bytes. A message is one outer
//! SEQUENCE holding three inner sequences, in order:
//!
//! ```text
//! SEQUENCE {
//!     SEQUENCE { INTEGER type, ... }     -- one per item
//!     SEQUENCE { UTF8String key, ... }   -- one per item
//!     SEQUENCE { value, ... }            -- encoding chosen by the type
//! }
//! ```
//!
//! Every sequence length is written as a fixed five-byte long form
//! (`0x84` + 4 bytes big-endian) and patched once the content is known.

pub mod error;
pub mod item;
pub mod tlv;

pub use error::{CodecError, Result};
pub use item::{
    decode_items, decode_manifest, encode_items, items_to_map, DataItem, DataType, DataValue,
    Manifest,
};
pub use tlv::{Decoder, Encoder, SequenceMark};
