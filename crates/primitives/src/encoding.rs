use exploder_consensus::Hash256;

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32_le(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64_le(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    /// Compact size, always in the narrowest form.
    pub fn write_varint(&mut self, value: u64) {
        if value < 0xfd {
            self.write_u8(value as u8);
        } else if value <= 0xffff {
            self.write_u8(0xfd);
            self.write_u16_le(value as u16);
        } else if value <= 0xffff_ffff {
            self.write_u8(0xfe);
            self.write_u32_le(value as u32);
        } else {
            self.write_u8(0xff);
            self.write_u64_le(value);
        }
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn write_var_str(&mut self, value: &str) {
        self.write_var_bytes(value.as_bytes());
    }

    pub fn write_hash(&mut self, hash: &Hash256) {
        self.buf.extend_from_slice(hash);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    TruncatedInput,
    NonCanonicalVarInt,
    SizeTooLarge,
    InvalidData(&'static str),
    TrailingBytes,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::TruncatedInput => write!(f, "truncated input"),
            DecodeError::NonCanonicalVarInt => write!(f, "non-canonical compact size"),
            DecodeError::SizeTooLarge => write!(f, "length prefix exceeds remaining input"),
            DecodeError::InvalidData(message) => write!(f, "{message}"),
            DecodeError::TrailingBytes => write!(f, "trailing bytes after decode"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Forward-only cursor over a finite buffer.
pub struct Decoder<'a> {
    input: &'a [u8],
    cursor: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, cursor: 0 }
    }

    /// Starts at `offset`, clamped to the end of `input`.
    pub fn at(input: &'a [u8], offset: usize) -> Self {
        Self {
            input,
            cursor: offset.min(input.len()),
        }
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.input.len()
    }

    pub fn remaining(&self) -> usize {
        self.input.len().saturating_sub(self.cursor)
    }

    pub fn is_empty(&self) -> bool {
        self.cursor >= self.input.len()
    }

    pub fn has_remaining(&self, len: usize) -> bool {
        self.remaining() >= len
    }

    /// Bytes in `[start, end)` of the underlying buffer, regardless of the cursor.
    pub fn slice(&self, start: usize, end: usize) -> Result<&'a [u8], DecodeError> {
        if start > end || end > self.input.len() {
            return Err(DecodeError::TruncatedInput);
        }
        Ok(&self.input[start..end])
    }

    pub fn skip(&mut self, len: usize) -> Result<(), DecodeError> {
        self.read_slice(len).map(|_| ())
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::TruncatedInput);
        }
        let start = self.cursor;
        self.cursor += len;
        Ok(&self.input[start..start + len])
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_slice(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.read_fixed::<2>()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_fixed::<4>()?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, DecodeError> {
        Ok(self.read_u32_le()? as i32)
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_fixed::<8>()?))
    }

    pub fn read_i64_le(&mut self) -> Result<i64, DecodeError> {
        Ok(self.read_u64_le()? as i64)
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let bytes = self.read_slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, DecodeError> {
        Ok(self.read_slice(len)?.to_vec())
    }

    /// 32 raw bytes in wire order; `hex::hash256_to_hex` gives the reversed display form.
    pub fn read_hash32(&mut self) -> Result<Hash256, DecodeError> {
        self.read_fixed::<32>()
    }

    /// Compact size as found in block files: any width is accepted.
    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        match self.read_u8()? {
            prefix @ 0..=0xfc => Ok(u64::from(prefix)),
            0xfd => Ok(u64::from(self.read_u16_le()?)),
            0xfe => Ok(u64::from(self.read_u32_le()?)),
            _ => self.read_u64_le(),
        }
    }

    /// Compact size that must use the narrowest encoding.
    pub fn read_varint_canonical(&mut self) -> Result<u64, DecodeError> {
        let start = self.cursor;
        let value = self.read_varint()?;
        let width = self.cursor - start;
        let minimal = match value {
            0..=0xfc => 1,
            0xfd..=0xffff => 3,
            0x1_0000..=0xffff_ffff => 5,
            _ => 9,
        };
        if width != minimal {
            return Err(DecodeError::NonCanonicalVarInt);
        }
        Ok(value)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_varint()?;
        let len = usize::try_from(len).map_err(|_| DecodeError::SizeTooLarge)?;
        if len > self.remaining() {
            return Err(DecodeError::TruncatedInput);
        }
        self.read_bytes(len)
    }

    pub fn read_var_str(&mut self) -> Result<String, DecodeError> {
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes).map_err(|_| DecodeError::InvalidData("invalid utf8 string"))
    }
}

pub trait Encodable {
    fn consensus_encode(&self, encoder: &mut Encoder);
}

pub trait Decodable: Sized {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError>;
}

pub fn encode<T: Encodable>(value: &T) -> Vec<u8> {
    let mut encoder = Encoder::new();
    value.consensus_encode(&mut encoder);
    encoder.into_inner()
}

pub fn decode<T: Decodable>(bytes: &[u8]) -> Result<T, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let value = T::consensus_decode(&mut decoder)?;
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_integers() {
        let bytes = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09];
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decoder.read_u8().unwrap(), 0x01);
        assert_eq!(decoder.read_u16_le().unwrap(), 0x0302);
        assert_eq!(decoder.read_u32_le().unwrap(), 0x0706_0504);
        assert_eq!(decoder.read_u32_le(), Err(DecodeError::TruncatedInput));
        // A failed read leaves the cursor in place.
        assert_eq!(decoder.position(), 7);
        assert!(decoder.has_remaining(2));
        assert!(!decoder.has_remaining(3));
    }

    #[test]
    fn varint_widths_and_minimal_encoding() {
        let cases: [(u64, usize); 8] = [
            (0, 1),
            (252, 1),
            (253, 3),
            (65_535, 3),
            (65_536, 5),
            (u32::MAX as u64, 5),
            (u32::MAX as u64 + 1, 9),
            (u64::MAX, 9),
        ];
        for (value, width) in cases {
            let mut encoder = Encoder::new();
            encoder.write_varint(value);
            let bytes = encoder.into_inner();
            assert_eq!(bytes.len(), width, "width of {value}");
            let mut decoder = Decoder::new(&bytes);
            assert_eq!(decoder.read_varint_canonical().unwrap(), value);
            assert!(decoder.is_empty());
        }
    }

    #[test]
    fn lenient_varint_accepts_wide_forms() {
        let bytes = [0xfd, 0x05, 0x00];
        assert_eq!(Decoder::new(&bytes).read_varint().unwrap(), 5);
        assert_eq!(
            Decoder::new(&bytes).read_varint_canonical(),
            Err(DecodeError::NonCanonicalVarInt)
        );
    }

    #[test]
    fn var_bytes_rejects_oversized_prefix() {
        let bytes = [0x05, 0xaa, 0xbb];
        assert_eq!(
            Decoder::new(&bytes).read_var_bytes(),
            Err(DecodeError::TruncatedInput)
        );
    }

    #[test]
    fn slice_reads_without_moving_cursor() {
        let bytes = [1u8, 2, 3, 4];
        let mut decoder = Decoder::at(&bytes, 1);
        assert_eq!(decoder.read_u8().unwrap(), 2);
        assert_eq!(decoder.slice(0, 3).unwrap(), &[1, 2, 3]);
        assert_eq!(decoder.position(), 2);
        assert!(decoder.slice(2, 5).is_err());
    }
}
