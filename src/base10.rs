//! Digit encoding for `FIDO:/` QR payloads.
//!
//! QR codes have a special, more compact encoding mode for strings of ASCII
//! digits, so caBLE packs binary CBOR into decimal: each group of 7 bytes is
//! interpreted as a little-endian integer and written as exactly 17 digits.
//! A trailing partial group uses a fixed digit count per byte count.

use std::fmt;

/// Number of digits encoding a partial group, indexed by byte count.
const PARTIAL_GROUP_DIGITS: [usize; 8] = [0, 3, 5, 8, 10, 13, 15, 17];

const GROUP_BYTES: usize = 7;
const GROUP_DIGITS: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The string contains a character other than an ASCII digit.
    InvalidDigit,
    /// The trailing partial group has a digit count which no byte count
    /// produces.
    InvalidLength,
    /// A group's numeric value does not fit in its output byte count.
    OutOfRange,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InvalidDigit => write!(f, "invalid digit in encoded string"),
            DecodeError::InvalidLength => write!(f, "invalid encoded string length"),
            DecodeError::OutOfRange => write!(f, "digit group out of range"),
        }
    }
}

fn decode_group(digits: &str, num_bytes: usize) -> Result<[u8; 8], DecodeError> {
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DecodeError::InvalidDigit);
    }
    let v: u64 = digits.parse().map_err(|_| DecodeError::InvalidDigit)?;
    if num_bytes < 8 && v >= 1u64 << (8 * num_bytes) {
        return Err(DecodeError::OutOfRange);
    }
    Ok(v.to_le_bytes())
}

/// Decodes a digit string into bytes.
pub fn decode(encoded: &str) -> Result<Vec<u8>, DecodeError> {
    let mut o = Vec::with_capacity((encoded.len() / GROUP_DIGITS + 1) * GROUP_BYTES);
    let mut i = encoded;

    while i.len() >= GROUP_DIGITS {
        let bytes = decode_group(&i[..GROUP_DIGITS], GROUP_BYTES)?;
        o.extend_from_slice(&bytes[..GROUP_BYTES]);
        i = &i[GROUP_DIGITS..];
    }

    if !i.is_empty() {
        let num_bytes = PARTIAL_GROUP_DIGITS
            .iter()
            .position(|d| *d == i.len())
            .ok_or(DecodeError::InvalidLength)?;
        let bytes = decode_group(i, num_bytes)?;
        o.extend_from_slice(&bytes[..num_bytes]);
    }

    Ok(o)
}

/// Encodes bytes as a digit string, the inverse of [decode].
pub fn encode(data: &[u8]) -> String {
    let mut o = String::with_capacity((data.len() / GROUP_BYTES + 1) * GROUP_DIGITS);

    for group in data.chunks(GROUP_BYTES) {
        let mut b = [0; 8];
        b[..group.len()].copy_from_slice(group);
        let v = u64::from_le_bytes(b);
        let digits = PARTIAL_GROUP_DIGITS[group.len()];
        o.push_str(&format!("{:0width$}", v, width = digits));
    }

    o
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_single_byte() {
        assert_eq!(decode("001").unwrap(), vec![1]);
        assert_eq!(decode("255").unwrap(), vec![255]);
    }

    #[test]
    fn decode_full_group() {
        // 1 encoded little-endian over 7 bytes
        assert_eq!(
            decode("00000000000000001").unwrap(),
            vec![1, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn round_trip() {
        let cases: &[&[u8]] = &[
            &[],
            &[0],
            &[255],
            &[1, 2],
            &[1, 2, 3, 4, 5, 6, 7],
            &[1, 2, 3, 4, 5, 6, 7, 8],
            &[0xff; 23],
        ];
        for c in cases {
            let e = encode(c);
            assert_eq!(&decode(&e).unwrap(), c, "case {:02x?} -> {:?}", c, e);
        }
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(decode("00a").unwrap_err(), DecodeError::InvalidDigit);
        // 1, 2, 4 trailing digits are not produced by any byte count
        assert_eq!(decode("1").unwrap_err(), DecodeError::InvalidLength);
        assert_eq!(decode("12").unwrap_err(), DecodeError::InvalidLength);
        assert_eq!(decode("1234").unwrap_err(), DecodeError::InvalidLength);
        // 3 digits must fit in one byte
        assert_eq!(decode("256").unwrap_err(), DecodeError::OutOfRange);
        // a full group must fit in 7 bytes
        assert_eq!(
            decode("99999999999999999").unwrap_err(),
            DecodeError::OutOfRange
        );
    }
}
