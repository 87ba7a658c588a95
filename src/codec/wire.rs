use super::error::CodecError;

/// Length prefix reserved for "no value" in optional byte strings.
pub(crate) const ABSENT: u32 = u32::MAX;

pub(crate) fn put_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn len_u32(len: usize) -> Result<u32, CodecError> {
    match u32::try_from(len) {
        Ok(len) if len != ABSENT => Ok(len),
        _ => Err(CodecError::LengthOverflow { len }),
    }
}

pub(crate) fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), CodecError> {
    put_u32(buf, len_u32(bytes.len())?);
    buf.extend_from_slice(bytes);
    Ok(())
}

pub(crate) fn put_optional_bytes(
    buf: &mut Vec<u8>,
    bytes: Option<&[u8]>,
) -> Result<(), CodecError> {
    match bytes {
        Some(bytes) => put_bytes(buf, bytes),
        None => {
            put_u32(buf, ABSENT);
            Ok(())
        }
    }
}

/// Forward-only cursor over a received message.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], CodecError> {
        if needed > self.remaining() {
            return Err(CodecError::Truncated {
                needed,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, CodecError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    pub(crate) fn bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.u32()?;
        if len == ABSENT {
            return Err(CodecError::InvalidField {
                field: "length",
                reason: "absent marker in a required field".to_string(),
            });
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    pub(crate) fn optional_bytes(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        let len = self.u32()?;
        if len == ABSENT {
            return Ok(None);
        }
        Ok(Some(self.take(len as usize)?.to_vec()))
    }

    pub(crate) fn finish(self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            trailing => Err(CodecError::TrailingBytes { trailing }),
        }
    }
}
