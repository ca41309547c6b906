use std::error::Error;

pub type CodecError = Box<dyn Error + Send + Sync + 'static>;

/// Anything that can be stored in a fixed-size slot.
///
/// `encode` must be deterministic and `decode(encode(x))` must give back an
/// equal value. The store frames the bytes itself, so encodings may contain
/// any byte values, including trailing zeros.
pub trait BlockItem: Sized {
    fn encode(&self) -> Result<Vec<u8>, CodecError>;

    fn decode(bytes: &[u8]) -> Result<Self, CodecError>;
}

impl BlockItem for Vec<u8> {
    #[inline]
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(self.clone())
    }

    #[inline]
    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bytes.to_vec())
    }
}

impl BlockItem for String {
    #[inline]
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(self.as_bytes().to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}
