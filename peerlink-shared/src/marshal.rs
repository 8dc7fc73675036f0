use bytes::{Buf, BytesMut};

use crate::error::{Error, Result};

/// Size in bytes a value occupies on the wire.
pub trait MarshalSize {
    fn marshal_size(&self) -> usize;
}

/// Serialize a value into caller-provided storage.
pub trait Marshal: MarshalSize {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize>;

    fn marshal(&self) -> Result<BytesMut> {
        let l = self.marshal_size();
        let mut buf = BytesMut::with_capacity(l);
        buf.resize(l, 0);
        let n = self.marshal_to(&mut buf)?;
        if n != l {
            return Err(Error::Other(format!(
                "marshal_to output size {n}, but expected {l}"
            )));
        }
        Ok(buf)
    }
}

/// Deserialize a value, advancing the buffer past the consumed bytes.
pub trait Unmarshal: MarshalSize {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf;
}

/// Number of bytes needed to pad `len` up to a 4-byte boundary.
pub fn padding_size(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_size() {
        assert_eq!(padding_size(0), 0);
        assert_eq!(padding_size(1), 3);
        assert_eq!(padding_size(2), 2);
        assert_eq!(padding_size(3), 1);
        assert_eq!(padding_size(4), 0);
        assert_eq!(padding_size(5), 3);
    }
}
