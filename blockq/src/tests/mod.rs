use std::io;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tempfile::TempDir;

use crate::core::StoreConfig;
use crate::item::{BlockItem, CodecError};


pub(crate) fn config_in(dir: &TempDir) -> StoreConfig {
    StoreConfig::builder()
        .data_dir(dir.path())
        .build()
        .expect("test config")
}

/// `[id: u64][len: u32][data]`, data filled with `id % 250`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TestMessage {
    pub id: u64,
    pub data: Vec<u8>,
}

impl TestMessage {
    pub fn new(id: u64, size: usize) -> Self {
        TestMessage {
            id,
            data: vec![(id % 250) as u8; size],
        }
    }
}

impl BlockItem for TestMessage {
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut bytes = Vec::with_capacity(12 + self.data.len());
        bytes.write_u64::<LittleEndian>(self.id)?;
        bytes.write_u32::<LittleEndian>(u32::try_from(self.data.len())?)?;
        bytes.extend_from_slice(&self.data);
        Ok(bytes)
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = io::Cursor::new(bytes);
        let (id, len) = match (
            cursor.read_u64::<LittleEndian>(),
            cursor.read_u32::<LittleEndian>(),
        ) {
            (Ok(id), Ok(len)) => (id, len as usize),
            _ => return Err("message shorter than its header".into()),
        };
        let data = &bytes[cursor.position() as usize..];
        if data.len() != len {
            return Err(format!("expected {} data bytes, got {}", len, data.len()).into());
        }
        Ok(TestMessage {
            id,
            data: data.to_vec(),
        })
    }
}
