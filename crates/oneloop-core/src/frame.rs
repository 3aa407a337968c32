//! Frame boundary detection for stream sockets.
//!
//! Three framing modes: fixed-length records, delimiter-terminated
//! records, and header-carried length fields with varint, little-endian
//! or big-endian codings. The decoder is pure: it inspects a byte window
//! and reports the total length of the frame at the head, or that more
//! bytes are needed. The runtime drives it per read and delivers one
//! callback per complete frame.

use crate::error::{FrameError, LoopError, Result};

/// Longest supported delimiter.
pub const MAX_DELIMITER_BYTES: usize = 8;

/// Default cap on a single frame.
pub const DEFAULT_PACKAGE_MAX_LENGTH: usize = 1 << 21; // 2 MiB

/// Longest varint encoding of a u64.
pub const MAX_VARINT_BYTES: usize = 10;

/// How a length field is encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthCoding {
    /// Base-128, least-significant group first, MSB is the continuation bit.
    Varint,
    LittleEndian,
    BigEndian,
}

/// Frame boundary rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameMode {
    /// Every frame is exactly this many bytes.
    FixedLength(usize),
    /// Frames end with this byte sequence; the delimiter is part of the frame.
    Delimiter {
        bytes: [u8; MAX_DELIMITER_BYTES],
        len: usize,
    },
    /// A header field carries the body length.
    LengthField {
        /// Header length for fixed codings; for varint the header shrinks
        /// or grows with the encoded width relative to `length_field_bytes`.
        body_offset: usize,
        length_field_offset: usize,
        length_field_bytes: usize,
        coding: LengthCoding,
        /// Added to the computed total, may be negative.
        length_adjustment: i32,
    },
}

impl FrameMode {
    /// Delimiter mode from a byte slice, at most [`MAX_DELIMITER_BYTES`].
    pub fn delimiter(delim: &[u8]) -> Result<Self> {
        if delim.is_empty() || delim.len() > MAX_DELIMITER_BYTES {
            return Err(LoopError::BadFrameConfig("delimiter must be 1..=8 bytes"));
        }
        let mut bytes = [0u8; MAX_DELIMITER_BYTES];
        bytes[..delim.len()].copy_from_slice(delim);
        Ok(Self::Delimiter {
            bytes,
            len: delim.len(),
        })
    }
}

/// Configured frame decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDecoder {
    mode: FrameMode,
    max_len: usize,
}

impl FrameDecoder {
    pub fn new(mode: FrameMode, max_len: usize) -> Result<Self> {
        if max_len == 0 {
            return Err(LoopError::BadFrameConfig("max length must be nonzero"));
        }
        match &mode {
            FrameMode::FixedLength(n) => {
                if *n == 0 || *n > max_len {
                    return Err(LoopError::BadFrameConfig(
                        "fixed length must be 1..=max length",
                    ));
                }
            }
            FrameMode::Delimiter { len, .. } => {
                if *len == 0 || *len > MAX_DELIMITER_BYTES {
                    return Err(LoopError::BadFrameConfig("delimiter must be 1..=8 bytes"));
                }
            }
            FrameMode::LengthField {
                body_offset,
                length_field_offset,
                length_field_bytes,
                coding,
                ..
            } => {
                let max_field = match coding {
                    LengthCoding::Varint => MAX_VARINT_BYTES,
                    _ => 8,
                };
                if *length_field_bytes == 0 || *length_field_bytes > max_field {
                    return Err(LoopError::BadFrameConfig("bad length field width"));
                }
                if length_field_offset + length_field_bytes > *body_offset {
                    return Err(LoopError::BadFrameConfig(
                        "length field must fit inside the header",
                    ));
                }
            }
        }
        Ok(Self { mode, max_len })
    }

    pub fn with_default_max(mode: FrameMode) -> Result<Self> {
        Self::new(mode, DEFAULT_PACKAGE_MAX_LENGTH)
    }

    #[inline]
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    #[inline]
    pub fn mode(&self) -> &FrameMode {
        &self.mode
    }

    /// A reasonable starting read-buffer size for this mode.
    pub fn initial_buffer_size(&self) -> usize {
        match self.mode {
            FrameMode::FixedLength(n) => n,
            _ => self.max_len.min(8 * 1024),
        }
    }

    /// Total length of the frame at the head of `buf`.
    ///
    /// `Ok(Some(n))` means the frame spans the first `n` bytes once `n`
    /// are buffered (the caller checks completeness). `Ok(None)` means
    /// the length cannot be determined yet. Errors are fatal for the
    /// connection.
    pub fn frame_len(&self, buf: &[u8]) -> std::result::Result<Option<usize>, FrameError> {
        match &self.mode {
            FrameMode::FixedLength(n) => Ok(Some(*n)),
            FrameMode::Delimiter { bytes, len } => {
                let delim = &bytes[..*len];
                if buf.len() >= *len {
                    if let Some(pos) = buf.windows(*len).position(|w| w == delim) {
                        return Ok(Some(pos + *len));
                    }
                }
                if buf.len() >= self.max_len {
                    return Err(FrameError::Oversize {
                        len: buf.len(),
                        max: self.max_len,
                    });
                }
                Ok(None)
            }
            FrameMode::LengthField {
                body_offset,
                length_field_offset,
                length_field_bytes,
                coding,
                length_adjustment,
            } => {
                let field = match buf.get(*length_field_offset..) {
                    Some(f) => f,
                    None => return Ok(None),
                };
                let (value, header_len) = match coding {
                    LengthCoding::Varint => {
                        let (v, width) = match decode_varint(field)? {
                            Some(dec) => dec,
                            None => return Ok(None),
                        };
                        (v, *body_offset + width - *length_field_bytes)
                    }
                    LengthCoding::LittleEndian | LengthCoding::BigEndian => {
                        if field.len() < *length_field_bytes {
                            return Ok(None);
                        }
                        let mut v: u64 = 0;
                        match coding {
                            LengthCoding::LittleEndian => {
                                for (i, b) in field[..*length_field_bytes].iter().enumerate() {
                                    v |= (*b as u64) << (8 * i);
                                }
                            }
                            _ => {
                                for b in &field[..*length_field_bytes] {
                                    v = (v << 8) | *b as u64;
                                }
                            }
                        }
                        (v, *body_offset)
                    }
                };
                let total = header_len as i64 + value as i64 + *length_adjustment as i64;
                if total < header_len as i64 || total <= 0 {
                    return Err(FrameError::Malformed);
                }
                let total = total as usize;
                if total > self.max_len {
                    return Err(FrameError::Oversize {
                        len: total,
                        max: self.max_len,
                    });
                }
                Ok(Some(total))
            }
        }
    }
}

/// Decode a varint from the front of `buf`.
///
/// Returns the value and its encoded width, or `None` when the encoding
/// is not yet complete in `buf`.
pub fn decode_varint(buf: &[u8]) -> std::result::Result<Option<(u64, usize)>, FrameError> {
    let mut value: u64 = 0;
    for (i, b) in buf.iter().enumerate() {
        if i >= MAX_VARINT_BYTES {
            return Err(FrameError::Malformed);
        }
        value |= ((b & 0x7f) as u64) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= MAX_VARINT_BYTES {
        return Err(FrameError::Malformed);
    }
    Ok(None)
}

/// Encode `value` as a varint into `out`, returning the width.
pub fn encode_varint(mut value: u64, out: &mut [u8; MAX_VARINT_BYTES]) -> usize {
    let mut i = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out[i] = byte;
            return i + 1;
        }
        out[i] = byte | 0x80;
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn be_decoder(body_offset: usize, field_bytes: usize, adj: i32) -> FrameDecoder {
        FrameDecoder::with_default_max(FrameMode::LengthField {
            body_offset,
            length_field_offset: 0,
            length_field_bytes: field_bytes,
            coding: LengthCoding::BigEndian,
            length_adjustment: adj,
        })
        .unwrap()
    }

    #[test]
    fn test_fixed_length() {
        let dec = FrameDecoder::with_default_max(FrameMode::FixedLength(4)).unwrap();
        assert_eq!(dec.frame_len(b"ab").unwrap(), Some(4));
        assert_eq!(dec.frame_len(b"abcdef").unwrap(), Some(4));
    }

    #[test]
    fn test_fixed_length_rejects_oversize_config() {
        assert!(FrameDecoder::new(FrameMode::FixedLength(100), 10).is_err());
        assert!(FrameDecoder::with_default_max(FrameMode::FixedLength(0)).is_err());
    }

    #[test]
    fn test_delimiter_crlf() {
        let dec =
            FrameDecoder::with_default_max(FrameMode::delimiter(b"\r\n").unwrap()).unwrap();
        let mut buf = b"PING\r\nPONG\r\nPAR".to_vec();
        assert_eq!(dec.frame_len(&buf).unwrap(), Some(6));
        assert_eq!(&buf[..6], b"PING\r\n");
        buf.drain(..6);
        assert_eq!(dec.frame_len(&buf).unwrap(), Some(6));
        assert_eq!(&buf[..6], b"PONG\r\n");
        buf.drain(..6);
        assert_eq!(dec.frame_len(&buf).unwrap(), None);
        assert_eq!(buf, b"PAR");
    }

    #[test]
    fn test_delimiter_overflow_without_match() {
        let dec = FrameDecoder::new(FrameMode::delimiter(b"\n").unwrap(), 8).unwrap();
        let buf = vec![b'x'; 8];
        assert!(matches!(
            dec.frame_len(&buf),
            Err(FrameError::Oversize { len: 8, max: 8 })
        ));
    }

    #[test]
    fn test_delimiter_too_long_rejected() {
        assert!(FrameMode::delimiter(b"123456789").is_err());
        assert!(FrameMode::delimiter(b"").is_err());
    }

    #[test]
    fn test_big_endian_length_field() {
        // 2-byte BE header carrying the body length, then the body.
        let dec = be_decoder(2, 2, 0);
        let wire = [0x00, 0x05, b'h', b'e', b'l', b'l', b'o'];
        assert_eq!(dec.frame_len(&wire).unwrap(), Some(7));
        assert_eq!(&wire[2..7], b"hello");
        // Header not complete yet.
        assert_eq!(dec.frame_len(&wire[..1]).unwrap(), None);
    }

    #[test]
    fn test_little_endian_length_field() {
        let dec = FrameDecoder::with_default_max(FrameMode::LengthField {
            body_offset: 4,
            length_field_offset: 0,
            length_field_bytes: 4,
            coding: LengthCoding::LittleEndian,
            length_adjustment: 0,
        })
        .unwrap();
        let wire = [0x05, 0x00, 0x00, 0x00, b'h', b'e', b'l', b'l', b'o'];
        assert_eq!(dec.frame_len(&wire).unwrap(), Some(9));
    }

    #[test]
    fn test_length_adjustment() {
        // Length field counts header + body; adjustment cancels the header.
        let dec = be_decoder(2, 2, -2);
        let wire = [0x00, 0x07, b'h', b'e', b'l', b'l', b'o'];
        assert_eq!(dec.frame_len(&wire).unwrap(), Some(7));
    }

    #[test]
    fn test_negative_total_is_malformed() {
        let dec = be_decoder(2, 2, -10);
        let wire = [0x00, 0x02, 0, 0];
        assert!(matches!(dec.frame_len(&wire), Err(FrameError::Malformed)));
    }

    #[test]
    fn test_oversize_declared_length() {
        let dec = FrameDecoder::new(
            FrameMode::LengthField {
                body_offset: 2,
                length_field_offset: 0,
                length_field_bytes: 2,
                coding: LengthCoding::BigEndian,
                length_adjustment: 0,
            },
            64,
        )
        .unwrap();
        let wire = [0xff, 0xff];
        assert!(matches!(
            dec.frame_len(&wire),
            Err(FrameError::Oversize { .. })
        ));
    }

    #[test]
    fn test_varint_widths() {
        let mut out = [0u8; MAX_VARINT_BYTES];
        assert_eq!(encode_varint(0, &mut out), 1);
        assert_eq!(out[0], 0x00);
        assert_eq!(encode_varint(127, &mut out), 1);
        assert_eq!(out[0], 0x7f);
        assert_eq!(encode_varint(128, &mut out), 2);
        assert_eq!(&out[..2], &[0x80, 0x01]);
        assert_eq!(encode_varint(16384, &mut out), 3);
        assert_eq!(&out[..3], &[0x80, 0x80, 0x01]);
    }

    #[test]
    fn test_varint_roundtrip() {
        let mut out = [0u8; MAX_VARINT_BYTES];
        for v in [0u64, 1, 127, 128, 300, 16383, 16384, u32::MAX as u64, u64::MAX] {
            let n = encode_varint(v, &mut out);
            assert_eq!(decode_varint(&out[..n]).unwrap(), Some((v, n)));
        }
    }

    #[test]
    fn test_varint_incomplete() {
        assert_eq!(decode_varint(&[0x80]).unwrap(), None);
        assert_eq!(decode_varint(&[]).unwrap(), None);
    }

    #[test]
    fn test_varint_runaway_is_malformed() {
        let buf = [0x80u8; MAX_VARINT_BYTES + 1];
        assert!(decode_varint(&buf).is_err());
    }

    #[test]
    fn test_varint_length_field_header_math() {
        // Nominal 4-byte length slot; a 2-byte varint shrinks the header.
        let dec = FrameDecoder::with_default_max(FrameMode::LengthField {
            body_offset: 4,
            length_field_offset: 0,
            length_field_bytes: 4,
            coding: LengthCoding::Varint,
            length_adjustment: 0,
        })
        .unwrap();
        let mut wire = vec![0u8; 2];
        let mut out = [0u8; MAX_VARINT_BYTES];
        let n = encode_varint(200, &mut out);
        assert_eq!(n, 2);
        wire[..2].copy_from_slice(&out[..2]);
        // header = body_offset + varint width - nominal width = 4 + 2 - 4
        assert_eq!(dec.frame_len(&wire).unwrap(), Some(2 + 200));
    }

    #[test]
    fn test_length_field_config_validation() {
        assert!(FrameDecoder::with_default_max(FrameMode::LengthField {
            body_offset: 2,
            length_field_offset: 2,
            length_field_bytes: 2,
            coding: LengthCoding::BigEndian,
            length_adjustment: 0,
        })
        .is_err());
    }
}
