use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CodecError, Result};

/// Universal tags understood by the codec.
pub mod tag {
    pub const BOOLEAN: u8 = 0x01;
    pub const INTEGER: u8 = 0x02;
    pub const OCTET_STRING: u8 = 0x04;
    pub const REAL: u8 = 0x09;
    pub const UTF8_STRING: u8 = 0x0C;
    /// SEQUENCE (0x10) with the constructed bit (0x20) set.
    pub const SEQUENCE: u8 = 0x30;
}

/// Header byte preceding the 8-byte IEEE-754 pattern in REAL content.
pub const REAL_BINARY64: u8 = 0x03;

/// Sequence lengths are always written in this 5-byte long form.
const SEQUENCE_LENGTH_FORM: u8 = 0x84;
const SEQUENCE_LENGTH_SIZE: usize = 5;

/// Most length bytes a long-form length may declare.
const MAX_LENGTH_BYTES: u8 = 4;

/// Position of an open sequence's length placeholder.
#[derive(Debug)]
#[must_use = "an open sequence must be closed with `Encoder::end_sequence`"]
pub struct SequenceMark {
    len_pos: usize,
}

/// Append-only TLV writer over an owned growable buffer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the encoder, returning the encoded bytes.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    /// Write a DER length: short form below 128, minimal long form above.
    pub fn put_length(&mut self, len: usize) -> Result<()> {
        if len < 0x80 {
            self.buf.put_u8(len as u8);
            return Ok(());
        }
        let len32 = u32::try_from(len).map_err(|_| CodecError::LengthOverflow(len))?;
        let bytes = len32.to_be_bytes();
        let skip = (len32.leading_zeros() / 8) as usize;
        self.buf.put_u8(0x80 | (bytes.len() - skip) as u8);
        self.buf.put_slice(&bytes[skip..]);
        Ok(())
    }

    /// Minimal big-endian two's complement.
    pub fn put_integer(&mut self, value: i64) {
        let bytes = value.to_be_bytes();
        let mut start = 0;
        while start < bytes.len() - 1 {
            let (lead, next) = (bytes[start], bytes[start + 1]);
            let redundant =
                (lead == 0x00 && next & 0x80 == 0) || (lead == 0xFF && next & 0x80 != 0);
            if !redundant {
                break;
            }
            start += 1;
        }
        let content = &bytes[start..];
        self.buf.put_u8(tag::INTEGER);
        self.buf.put_u8(content.len() as u8);
        self.buf.put_slice(content);
    }

    pub fn put_boolean(&mut self, value: bool) {
        self.buf.put_u8(tag::BOOLEAN);
        self.buf.put_u8(1);
        self.buf.put_u8(if value { 0xFF } else { 0x00 });
    }

    /// Zero (of either sign) is written with empty content.
    pub fn put_real(&mut self, value: f64) {
        self.buf.put_u8(tag::REAL);
        if value == 0.0 {
            self.buf.put_u8(0);
            return;
        }
        self.buf.put_u8(9);
        self.buf.put_u8(REAL_BINARY64);
        self.buf.put_u64(value.to_bits());
    }

    pub fn put_utf8(&mut self, value: &str) -> Result<()> {
        self.put_element(tag::UTF8_STRING, value.as_bytes())
    }

    pub fn put_octets(&mut self, value: &[u8]) -> Result<()> {
        self.put_element(tag::OCTET_STRING, value)
    }

    fn put_element(&mut self, tag: u8, content: &[u8]) -> Result<()> {
        self.buf.reserve(content.len() + 6);
        self.buf.put_u8(tag);
        self.put_length(content.len())?;
        self.buf.put_slice(content);
        Ok(())
    }

    /// Open a sequence, reserving a fixed-size length to patch later.
    pub fn begin_sequence(&mut self) -> SequenceMark {
        self.buf.put_u8(tag::SEQUENCE);
        let len_pos = self.buf.len();
        self.buf.put_u8(SEQUENCE_LENGTH_FORM);
        self.buf.put_u32(0);
        SequenceMark { len_pos }
    }

    /// Close a sequence, back-filling its length.
    pub fn end_sequence(&mut self, mark: SequenceMark) -> Result<()> {
        let content_len = self.buf.len() - mark.len_pos - SEQUENCE_LENGTH_SIZE;
        let len32 =
            u32::try_from(content_len).map_err(|_| CodecError::LengthOverflow(content_len))?;
        self.buf[mark.len_pos + 1..mark.len_pos + SEQUENCE_LENGTH_SIZE]
            .copy_from_slice(&len32.to_be_bytes());
        Ok(())
    }
}

/// Forward-only TLV reader over a borrowed buffer.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    /// Tag at the cursor without consuming it.
    pub fn peek_tag(&self) -> Option<u8> {
        self.buf.first().copied()
    }

    /// Fail unless every byte has been consumed.
    pub fn finish(self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::SequenceNotConsumed(n)),
        }
    }

    pub fn integer(&mut self) -> Result<i64> {
        let content = self.element(tag::INTEGER)?;
        if content.is_empty() || content.len() > 8 {
            return Err(CodecError::InvalidLength {
                tag: tag::INTEGER,
                len: content.len(),
            });
        }
        let mut value: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
        for &byte in content {
            value = (value << 8) | i64::from(byte);
        }
        Ok(value)
    }

    /// Any nonzero content byte decodes as `true`.
    pub fn boolean(&mut self) -> Result<bool> {
        let content = self.element(tag::BOOLEAN)?;
        match content {
            [byte] => Ok(*byte != 0),
            _ => Err(CodecError::InvalidLength {
                tag: tag::BOOLEAN,
                len: content.len(),
            }),
        }
    }

    pub fn real(&mut self) -> Result<f64> {
        let content = self.element(tag::REAL)?;
        let Some((&header, mut bits)) = content.split_first() else {
            return Ok(0.0);
        };
        if header != REAL_BINARY64 {
            return Err(CodecError::UnsupportedReal(header));
        }
        if bits.len() != 8 {
            return Err(CodecError::InvalidLength {
                tag: tag::REAL,
                len: content.len(),
            });
        }
        Ok(f64::from_bits(bits.get_u64()))
    }

    pub fn utf8(&mut self) -> Result<&'a str> {
        let content = self.element(tag::UTF8_STRING)?;
        Ok(std::str::from_utf8(content)?)
    }

    pub fn octets(&mut self) -> Result<&'a [u8]> {
        self.element(tag::OCTET_STRING)
    }

    /// Enter a sequence, returning a decoder over exactly its content.
    pub fn sequence(&mut self) -> Result<Decoder<'a>> {
        self.element(tag::SEQUENCE).map(Decoder::new)
    }

    /// Skip one element of any tag.
    pub fn skip_element(&mut self) -> Result<()> {
        self.read_u8()?;
        let len = self.read_length()?;
        self.take(len).map(|_| ())
    }

    /// Read a tag, require it to be `expected`, and return the content.
    pub fn element(&mut self, expected: u8) -> Result<&'a [u8]> {
        let found = self.read_u8()?;
        if found != expected {
            return Err(CodecError::TagMismatch { expected, found });
        }
        let len = self.read_length()?;
        self.take(len)
    }

    pub fn read_length(&mut self) -> Result<usize> {
        let first = self.read_u8()?;
        if first & 0x80 == 0 {
            return Ok(usize::from(first));
        }
        let count = first & 0x7F;
        if count == 0 {
            return Err(CodecError::IndefiniteLength);
        }
        if count > MAX_LENGTH_BYTES {
            return Err(CodecError::LengthTooLarge(count));
        }
        let bytes = self.take(usize::from(count))?;
        Ok(bytes
            .iter()
            .fold(0usize, |len, &byte| (len << 8) | usize::from(byte)))
    }

    fn read_u8(&mut self) -> Result<u8> {
        if !self.buf.has_remaining() {
            return Err(CodecError::Truncated {
                needed: 1,
                remaining: 0,
            });
        }
        Ok(self.buf.get_u8())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.buf.len() {
            return Err(CodecError::Truncated {
                needed: len,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded_integer(value: i64) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.put_integer(value);
        enc.finish().to_vec()
    }

    #[test]
    fn test_integer_minimal_encoding() {
        let cases: &[(i64, &[u8])] = &[
            (0, &[0x02, 0x01, 0x00]),
            (1, &[0x02, 0x01, 0x01]),
            (127, &[0x02, 0x01, 0x7F]),
            (128, &[0x02, 0x02, 0x00, 0x80]),
            (256, &[0x02, 0x02, 0x01, 0x00]),
            (-1, &[0x02, 0x01, 0xFF]),
            (-128, &[0x02, 0x01, 0x80]),
            (-129, &[0x02, 0x02, 0xFF, 0x7F]),
            (-256, &[0x02, 0x02, 0xFF, 0x00]),
            (
                i64::MAX,
                &[0x02, 0x08, 0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF],
            ),
            (
                i64::MIN,
                &[0x02, 0x08, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            ),
        ];
        for (value, expected) in cases {
            assert_eq!(&encoded_integer(*value), expected, "value {value}");
        }
    }

    #[test]
    fn test_integer_extremes_decode() {
        for value in [i64::MIN, i64::MIN + 1, -1, 0, 1, i64::MAX - 1, i64::MAX] {
            let bytes = encoded_integer(value);
            let mut dec = Decoder::new(&bytes);
            assert_eq!(dec.integer().unwrap(), value);
            dec.finish().unwrap();
        }
    }

    #[test]
    fn test_integer_rejects_bad_lengths() {
        let mut dec = Decoder::new(&[0x02, 0x00]);
        assert!(matches!(
            dec.integer(),
            Err(CodecError::InvalidLength { len: 0, .. })
        ));

        let nine = [0x02, 0x09, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let mut dec = Decoder::new(&nine);
        assert!(matches!(
            dec.integer(),
            Err(CodecError::InvalidLength { len: 9, .. })
        ));
    }

    #[test]
    fn test_boolean_nonzero_is_true() {
        let mut enc = Encoder::new();
        enc.put_boolean(true);
        enc.put_boolean(false);
        assert_eq!(
            enc.finish().as_ref(),
            &[0x01, 0x01, 0xFF, 0x01, 0x01, 0x00]
        );

        let mut dec = Decoder::new(&[0x01, 0x01, 0x01, 0x01, 0x01, 0x00]);
        assert!(dec.boolean().unwrap());
        assert!(!dec.boolean().unwrap());

        let mut dec = Decoder::new(&[0x01, 0x02, 0xFF, 0xFF]);
        assert!(matches!(
            dec.boolean(),
            Err(CodecError::InvalidLength { len: 2, .. })
        ));
    }

    #[test]
    fn test_real_encoding() {
        let mut enc = Encoder::new();
        enc.put_real(0.0);
        enc.put_real(-0.0);
        enc.put_real(23.5);
        let bytes = enc.finish();

        let mut expected = vec![0x09, 0x00, 0x09, 0x00, 0x09, 0x09, REAL_BINARY64];
        expected.extend_from_slice(&23.5f64.to_bits().to_be_bytes());
        assert_eq!(bytes.as_ref(), expected.as_slice());

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.real().unwrap(), 0.0);
        assert_eq!(dec.real().unwrap(), 0.0);
        assert_eq!(dec.real().unwrap(), 23.5);
    }

    #[test]
    fn test_real_rejects_unknown_header() {
        let mut content = vec![0x09, 0x09, 0x80];
        content.extend_from_slice(&1.5f64.to_bits().to_be_bytes());
        let mut dec = Decoder::new(&content);
        assert!(matches!(dec.real(), Err(CodecError::UnsupportedReal(0x80))));

        let mut dec = Decoder::new(&[0x09, 0x02, REAL_BINARY64, 0x00]);
        assert!(matches!(
            dec.real(),
            Err(CodecError::InvalidLength { len: 2, .. })
        ));
    }

    #[test]
    fn test_length_form_boundaries() {
        let cases: &[(usize, &[u8])] = &[
            (0, &[0x00]),
            (127, &[0x7F]),
            (128, &[0x81, 0x80]),
            (255, &[0x81, 0xFF]),
            (256, &[0x82, 0x01, 0x00]),
            (65_536, &[0x83, 0x01, 0x00, 0x00]),
        ];
        for (len, header) in cases {
            let payload = vec![0xA5u8; *len];
            let mut enc = Encoder::new();
            enc.put_octets(&payload).unwrap();
            let bytes = enc.finish();

            assert_eq!(bytes[0], tag::OCTET_STRING);
            assert_eq!(&bytes[1..1 + header.len()], *header, "len {len}");
            assert_eq!(bytes.len(), 1 + header.len() + len);

            let mut dec = Decoder::new(&bytes);
            assert_eq!(dec.octets().unwrap(), payload.as_slice());
            dec.finish().unwrap();
        }
    }

    #[test]
    fn test_length_limits() {
        let mut dec = Decoder::new(&[0x04, 0x85, 0, 0, 0, 0, 1]);
        assert!(matches!(dec.octets(), Err(CodecError::LengthTooLarge(5))));

        let mut dec = Decoder::new(&[0x04, 0x80]);
        assert!(matches!(dec.octets(), Err(CodecError::IndefiniteLength)));
    }

    #[test]
    fn test_truncated_and_mismatched_input() {
        let mut dec = Decoder::new(&[0x04, 0x05, 1, 2]);
        assert!(matches!(
            dec.octets(),
            Err(CodecError::Truncated {
                needed: 5,
                remaining: 2
            })
        ));

        let mut dec = Decoder::new(&[]);
        assert!(matches!(dec.integer(), Err(CodecError::Truncated { .. })));

        let mut dec = Decoder::new(&[0x01, 0x01, 0xFF]);
        assert!(matches!(
            dec.integer(),
            Err(CodecError::TagMismatch {
                expected: tag::INTEGER,
                found: tag::BOOLEAN
            })
        ));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut dec = Decoder::new(&[0x0C, 0x02, 0xC3, 0x28]);
        assert!(matches!(dec.utf8(), Err(CodecError::InvalidUtf8(_))));
    }

    #[test]
    fn test_sequence_uses_patched_fixed_length() {
        let mut enc = Encoder::new();
        let outer = enc.begin_sequence();
        enc.put_integer(5);
        let inner = enc.begin_sequence();
        enc.end_sequence(inner).unwrap();
        enc.end_sequence(outer).unwrap();
        let bytes = enc.finish();

        assert_eq!(
            bytes.as_ref(),
            &[
                0x30, 0x84, 0x00, 0x00, 0x00, 0x09, // outer, 9 content bytes
                0x02, 0x01, 0x05, // INTEGER 5
                0x30, 0x84, 0x00, 0x00, 0x00, 0x00, // empty inner
            ]
        );

        let mut dec = Decoder::new(&bytes);
        let mut outer = dec.sequence().unwrap();
        dec.finish().unwrap();
        assert_eq!(outer.integer().unwrap(), 5);
        let inner = outer.sequence().unwrap();
        assert!(inner.is_empty());
        outer.finish().unwrap();
    }

    #[test]
    fn test_sequence_accepts_short_form_length() {
        let bytes = [0x30, 0x03, 0x02, 0x01, 0x07];
        let mut dec = Decoder::new(&bytes);
        let mut seq = dec.sequence().unwrap();
        assert_eq!(seq.integer().unwrap(), 7);
        seq.finish().unwrap();
    }

    #[test]
    fn test_unconsumed_sequence_reported() {
        let bytes = [0x30, 0x06, 0x02, 0x01, 0x07, 0x02, 0x01, 0x08];
        let mut dec = Decoder::new(&bytes);
        let mut seq = dec.sequence().unwrap();
        seq.integer().unwrap();
        assert!(matches!(
            seq.finish(),
            Err(CodecError::SequenceNotConsumed(3))
        ));
    }
}
