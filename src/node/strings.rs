//! Length-prefixed string lists for the host boundary.
//!
//! Layout: `u32` big-endian count, then for each string a `u32` big-endian
//! byte length followed by that many UTF-8 bytes. Decoding never reads past
//! the end of the input.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StringListError {
    #[error("frame truncated: {needed} bytes needed at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("string {index} is not valid UTF-8")]
    InvalidUtf8 { index: usize },

    #[error("{0} trailing bytes after the last string")]
    TrailingBytes(usize),

    #[error("{0} bytes do not fit a u32 length prefix")]
    TooLong(usize),
}

/// Encode strings into one frame.
pub fn encode_list<S: AsRef<str>>(items: &[S]) -> Result<Vec<u8>, StringListError> {
    let count = u32::try_from(items.len()).map_err(|_| StringListError::TooLong(items.len()))?;
    let body: usize = items.iter().map(|s| 4 + s.as_ref().len()).sum();

    let mut out = Vec::with_capacity(4 + body);
    out.extend_from_slice(&count.to_be_bytes());
    for item in items {
        let bytes = item.as_ref().as_bytes();
        let len = u32::try_from(bytes.len()).map_err(|_| StringListError::TooLong(bytes.len()))?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(bytes);
    }
    Ok(out)
}

/// Frame holding no strings.
pub fn empty_list() -> Vec<u8> {
    0u32.to_be_bytes().to_vec()
}

/// Decode a frame produced by [`encode_list`].
pub fn decode_list(bytes: &[u8]) -> Result<Vec<String>, StringListError> {
    let mut reader = Reader { bytes, offset: 0 };
    let count = reader.read_u32()? as usize;

    // Every entry takes at least four bytes, so the count cannot force a
    // larger allocation than the input justifies.
    let mut items = Vec::with_capacity(count.min(bytes.len() / 4));
    for index in 0..count {
        let len = reader.read_u32()? as usize;
        let raw = reader.take(len)?;
        let item =
            std::str::from_utf8(raw).map_err(|_| StringListError::InvalidUtf8 { index })?;
        items.push(item.to_string());
    }

    match bytes.len() - reader.offset {
        0 => Ok(items),
        rest => Err(StringListError::TrailingBytes(rest)),
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, needed: usize) -> Result<&'a [u8], StringListError> {
        let end = self
            .offset
            .checked_add(needed)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(StringListError::Truncated {
                offset: self.offset,
                needed,
            })?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, StringListError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }
}
