//! Canonical byte encoding shared by blocks, transactions and storage records.
//!
//! Integers are little-endian. Lengths and counts use a canonical MSB base-128
//! VLQ where every byte except the last has the high bit set and each
//! continuation adds one, so no value has two encodings.

use super::hash::{Hash, SubnetworkId, HASH_SIZE, SUBNETWORK_ID_SIZE};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected end of input (needed {needed} bytes at offset {offset})")]
    UnexpectedEof { offset: usize, needed: usize },
    #[error("vlq value overflows u64")]
    VlqOverflow,
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
    #[error("invalid value: {0}")]
    Invalid(String),
}

pub trait Encodable {
    fn encode(&self, buf: &mut Vec<u8>);

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

pub trait Decodable: Sized {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError>;

    /// Decode a complete record; leftover bytes are an error.
    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(bytes);
        let value = Self::decode(&mut reader)?;
        reader.finish()?;
        Ok(value)
    }
}

// ─── VLQ ─────────────────────────────────────────────────────────────

pub fn write_vlq(buf: &mut Vec<u8>, mut n: u64) {
    let mut tmp = [0u8; 10];
    let mut len = 0;
    loop {
        let high_bit = if len == 0 { 0x00 } else { 0x80 };
        tmp[len] = (n & 0x7f) as u8 | high_bit;
        len += 1;
        if n <= 0x7f {
            break;
        }
        n = (n >> 7) - 1;
    }
    tmp[..len].reverse();
    buf.extend_from_slice(&tmp[..len]);
}

pub fn vlq_size(mut n: u64) -> usize {
    let mut size = 1;
    while n > 0x7f {
        n = (n >> 7) - 1;
        size += 1;
    }
    size
}

pub fn write_var_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_vlq(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

// ─── Reader ──────────────────────────────────────────────────────────

pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn finish(&self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof { offset: self.pos, needed: n });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(CodecError::Invalid(format!("bool byte {}", b))),
        }
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash, CodecError> {
        Ok(Hash(self.read_array::<HASH_SIZE>()?))
    }

    pub fn read_subnetwork_id(&mut self) -> Result<SubnetworkId, CodecError> {
        Ok(SubnetworkId(self.read_array::<SUBNETWORK_ID_SIZE>()?))
    }

    pub fn read_vlq(&mut self) -> Result<u64, CodecError> {
        let mut n: u64 = 0;
        loop {
            let byte = self.read_u8()?;
            if n > (u64::MAX >> 7) {
                return Err(CodecError::VlqOverflow);
            }
            n = (n << 7) | u64::from(byte & 0x7f);
            if byte & 0x80 == 0 {
                return Ok(n);
            }
            n = n.checked_add(1).ok_or(CodecError::VlqOverflow)?;
        }
    }

    /// VLQ count, bounded by the bytes left so a corrupt length cannot
    /// trigger a huge allocation.
    pub fn read_count(&mut self) -> Result<usize, CodecError> {
        let n = self.read_vlq()?;
        if n > self.remaining() as u64 {
            return Err(CodecError::Invalid(format!("count {} exceeds remaining input", n)));
        }
        Ok(n as usize)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_count()?;
        Ok(self.read_bytes(len)?.to_vec())
    }
}

// ─── Compact fee data ────────────────────────────────────────────────

/// Per-block fees, one u64-LE per transaction in block order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactFeeData(Vec<u8>);

impl CompactFeeData {
    pub fn from_fees(fees: &[u64]) -> Self {
        let mut buf = Vec::with_capacity(fees.len() * 8);
        for fee in fees {
            buf.extend_from_slice(&fee.to_le_bytes());
        }
        CompactFeeData(buf)
    }

    pub fn from_raw(bytes: Vec<u8>) -> Result<Self, CodecError> {
        if bytes.len() % 8 != 0 {
            return Err(CodecError::Invalid(format!("fee data length {} not a multiple of 8", bytes.len())));
        }
        Ok(CompactFeeData(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len() / 8
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.0.chunks_exact(8).map(|c| {
            let mut b = [0u8; 8];
            b.copy_from_slice(c);
            u64::from_le_bytes(b)
        })
    }
}

// ─── Amount compression ──────────────────────────────────────────────

/// Compresses an amount by factoring out trailing decimal zeros. Round values
/// (the common case for outputs) map to small integers that VLQ-encode short.
pub fn compress_amount(amount: u64) -> u64 {
    if amount == 0 {
        return 0;
    }
    let mut n = amount;
    let mut exponent = 0u64;
    while n % 10 == 0 && exponent < 9 {
        n /= 10;
        exponent += 1;
    }
    if exponent < 9 {
        let last_digit = n % 10;
        n /= 10;
        1 + (n * 9 + last_digit - 1) * 10 + exponent
    } else {
        10 + (n - 1) * 10
    }
}

pub fn decompress_amount(x: u64) -> u64 {
    if x == 0 {
        return 0;
    }
    let mut x = x - 1;
    let exponent = x % 10;
    x /= 10;
    let mut n = if exponent < 9 {
        let last_digit = x % 9 + 1;
        x /= 9;
        x * 10 + last_digit
    } else {
        x + 1
    };
    for _ in 0..exponent {
        n *= 10;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlq_known_encodings() {
        let cases: &[(u64, &[u8])] = &[
            (0, &[0x00]),
            (127, &[0x7f]),
            (128, &[0x80, 0x00]),
            (255, &[0x80, 0x7f]),
            (16511, &[0xff, 0x7f]),
            (16512, &[0x80, 0x80, 0x00]),
        ];
        for (n, expected) in cases {
            let mut buf = Vec::new();
            write_vlq(&mut buf, *n);
            assert_eq!(&buf[..], *expected, "encoding {}", n);
            assert_eq!(vlq_size(*n), expected.len());
            let mut r = Reader::new(&buf);
            assert_eq!(r.read_vlq().unwrap(), *n);
        }
    }

    #[test]
    fn test_vlq_max_value() {
        let mut buf = Vec::new();
        write_vlq(&mut buf, u64::MAX);
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_vlq().unwrap(), u64::MAX);
        assert!(r.finish().is_ok());
    }

    #[test]
    fn test_reader_eof() {
        let mut r = Reader::new(&[1, 2, 3]);
        assert!(matches!(r.read_u64(), Err(CodecError::UnexpectedEof { .. })));
    }

    #[test]
    fn test_read_count_rejects_oversized() {
        let mut buf = Vec::new();
        write_vlq(&mut buf, 1_000_000);
        let mut r = Reader::new(&buf);
        assert!(r.read_count().is_err());
    }

    #[test]
    fn test_fee_data() {
        let fees = CompactFeeData::from_fees(&[0, 150, u64::MAX]);
        assert_eq!(fees.len(), 3);
        assert_eq!(fees.iter().collect::<Vec<_>>(), vec![0, 150, u64::MAX]);
        assert!(CompactFeeData::from_raw(vec![0; 7]).is_err());
    }

    #[test]
    fn test_amount_compression() {
        assert_eq!(compress_amount(0), 0);
        assert_eq!(compress_amount(1), 1);
        assert_eq!(compress_amount(100_000_000), 9);
        assert_eq!(compress_amount(50 * 100_000_000), 50);
        for amount in [1u64, 7, 10, 999, 1_000_000_000, 21_000_000 * 100_000_000, 123_456_789] {
            assert_eq!(decompress_amount(compress_amount(amount)), amount);
        }
    }
}
