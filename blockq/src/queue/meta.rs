//! Queue control block.
//!
//! Encoded as little-endian `u32`s:
//! `size | item_size | count | count x (position, memory_index)`.

use std::collections::HashSet;
use std::io;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::item::{BlockItem, CodecError};

pub const META_HEADER_LEN: usize = 12;
pub const META_ENTRY_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueItemMeta {
    /// Dense FIFO order key, rewritten as items ahead of it leave.
    pub position: u32,
    /// Slot in the item store. Fixed for the entry's lifetime.
    pub memory_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMeta {
    pub size: u32,
    pub item_size: u32,
    pub items: Vec<QueueItemMeta>,
}

impl QueueMeta {
    pub fn new(size: u32, item_size: u32) -> QueueMeta {
        QueueMeta {
            size,
            item_size,
            items: Vec::new(),
        }
    }

    /// Largest encoding a queue of `size` entries can produce.
    #[inline]
    pub fn max_encoded_len(size: usize) -> usize {
        META_HEADER_LEN + META_ENTRY_LEN * size
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Next free position and lowest free memory index, or `None` when the
    /// queue is full.
    pub fn next_free(&self) -> Option<QueueItemMeta> {
        // positions are dense, so the next one is always the current length
        let position = u32::try_from(self.items.len()).ok()?;
        if position >= self.size {
            return None;
        }
        let mut used: Vec<u32> = self.items.iter().map(|m| m.memory_index).collect();
        used.sort_unstable();
        let mut memory_index = 0u32;
        for index in used {
            if index != memory_index {
                break;
            }
            memory_index += 1;
        }
        if memory_index >= self.size {
            return None;
        }
        Some(QueueItemMeta {
            position,
            memory_index,
        })
    }

    /// Entry holding the lowest position.
    pub fn front(&self) -> Option<QueueItemMeta> {
        self.items.iter().min_by_key(|m| m.position).copied()
    }

    /// Removes the front entry and closes the gap it leaves.
    pub fn pop_front(&mut self) -> Option<QueueItemMeta> {
        let front = self.front()?;
        self.remove(front);
        Some(front)
    }

    /// Removes `entry`, shifting every later position down by one.
    pub fn remove(&mut self, entry: QueueItemMeta) {
        let before = self.items.len();
        self.items.retain(|m| m.memory_index != entry.memory_index);
        if self.items.len() == before {
            return;
        }
        for m in self.items.iter_mut() {
            if m.position > entry.position {
                m.position -= 1;
            }
        }
    }

    /// Entries sorted by position.
    pub fn ordered(&self) -> Vec<QueueItemMeta> {
        let mut items = self.items.clone();
        items.sort_by_key(|m| m.position);
        items
    }

    fn check(&self) -> Result<(), String> {
        if self.items.len() > self.size as usize {
            return Err(format!(
                "{} entries exceed queue size {}",
                self.items.len(),
                self.size
            ));
        }
        let mut positions = HashSet::with_capacity(self.items.len());
        let mut indices = HashSet::with_capacity(self.items.len());
        // unique positions below len() are exactly 0..len()
        let dense_bound = self.items.len() as u32;
        for entry in &self.items {
            for (value, bound, seen, what) in [
                (entry.position, dense_bound, &mut positions, "position"),
                (entry.memory_index, self.size, &mut indices, "memory index"),
            ] {
                if value >= bound {
                    return Err(format!("{} {} out of range", what, value));
                }
                if !seen.insert(value) {
                    return Err(format!("duplicate {} {}", what, value));
                }
            }
        }
        Ok(())
    }
}

/// Reads the next field, reporting a short buffer as truncation.
#[inline]
fn next_u32(cursor: &mut io::Cursor<&[u8]>) -> Result<u32, CodecError> {
    let at = cursor.position();
    cursor.read_u32::<LittleEndian>().map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => format!("truncated at byte {}", at).into(),
        _ => e.into(),
    })
}

impl BlockItem for QueueMeta {
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let count = u32::try_from(self.items.len())?;
        let mut buf = Vec::with_capacity(META_HEADER_LEN + META_ENTRY_LEN * self.items.len());
        buf.write_u32::<LittleEndian>(self.size)?;
        buf.write_u32::<LittleEndian>(self.item_size)?;
        buf.write_u32::<LittleEndian>(count)?;
        for entry in &self.items {
            buf.write_u32::<LittleEndian>(entry.position)?;
            buf.write_u32::<LittleEndian>(entry.memory_index)?;
        }
        Ok(buf)
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = io::Cursor::new(bytes);
        let size = next_u32(&mut cursor)?;
        let item_size = next_u32(&mut cursor)?;
        let count = next_u32(&mut cursor)?;
        if count > size {
            return Err(format!("{} entries exceed queue size {}", count, size).into());
        }
        let room = bytes.len().saturating_sub(META_HEADER_LEN) / META_ENTRY_LEN;
        let mut items = Vec::with_capacity((count as usize).min(room));
        for _ in 0..count {
            items.push(QueueItemMeta {
                position: next_u32(&mut cursor)?,
                memory_index: next_u32(&mut cursor)?,
            });
        }
        let consumed = cursor.position() as usize;
        if consumed != bytes.len() {
            return Err(format!("{} trailing bytes", bytes.len() - consumed).into());
        }
        let meta = QueueMeta {
            size,
            item_size,
            items,
        };
        meta.check()?;
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(position: u32, memory_index: u32) -> QueueItemMeta {
        QueueItemMeta {
            position,
            memory_index,
        }
    }

    #[test]
    fn next_free_picks_lowest_ids() {
        let mut meta = QueueMeta::new(4, 16);
        assert_eq!(meta.next_free(), Some(entry(0, 0)));

        meta.items = vec![entry(0, 2), entry(1, 0)];
        assert_eq!(meta.next_free(), Some(entry(2, 1)));
    }

    #[test]
    fn next_free_is_none_when_full() {
        let mut meta = QueueMeta::new(2, 16);
        meta.items = vec![entry(0, 1), entry(1, 0)];
        assert_eq!(meta.next_free(), None);
    }

    #[test]
    fn pop_front_compacts_positions() {
        let mut meta = QueueMeta::new(3, 16);
        meta.items = vec![entry(2, 0), entry(0, 1), entry(1, 2)];

        assert_eq!(meta.pop_front(), Some(entry(0, 1)));
        assert_eq!(meta.ordered(), vec![entry(0, 2), entry(1, 0)]);
        assert_eq!(meta.pop_front(), Some(entry(0, 2)));
        assert_eq!(meta.pop_front(), Some(entry(0, 0)));
        assert_eq!(meta.pop_front(), None);
    }

    #[test]
    fn encoding_is_bounded_by_size() -> Result<(), CodecError> {
        let mut meta = QueueMeta::new(3, 64);
        meta.items = vec![entry(0, 1), entry(1, 0), entry(2, 2)];
        let bytes = meta.encode()?;
        assert_eq!(bytes.len(), QueueMeta::max_encoded_len(3));
        assert_eq!(QueueMeta::decode(&bytes)?, meta);
        Ok(())
    }

    #[test]
    fn decode_rejects_inconsistent_entries() -> Result<(), CodecError> {
        let mut meta = QueueMeta::new(2, 8);
        meta.items = vec![entry(0, 0), entry(0, 1)];
        assert!(QueueMeta::decode(&meta.encode()?).is_err());

        meta.items = vec![entry(0, 5)];
        assert!(QueueMeta::decode(&meta.encode()?).is_err());

        let bytes = QueueMeta::new(2, 8).encode()?;
        assert!(QueueMeta::decode(&bytes[..10]).is_err());
        Ok(())
    }

    #[test]
    fn short_buffer_reports_truncation() -> Result<(), CodecError> {
        let mut meta = QueueMeta::new(4, 8);
        meta.items = vec![entry(0, 3), entry(1, 1)];
        let bytes = meta.encode()?;

        let err = QueueMeta::decode(&bytes[..3]).unwrap_err();
        assert_eq!(err.to_string(), "truncated at byte 0");
        let err = QueueMeta::decode(&bytes[..bytes.len() - 2]).unwrap_err();
        assert_eq!(err.to_string(), "truncated at byte 24");
        Ok(())
    }

    #[test]
    fn next_free_fills_memory_gaps_in_order() {
        let mut meta = QueueMeta::new(5, 8);
        meta.items = vec![entry(0, 4), entry(1, 0), entry(2, 2)];
        assert_eq!(meta.next_free(), Some(entry(3, 1)));

        meta.items.push(entry(3, 1));
        assert_eq!(meta.next_free(), Some(entry(4, 3)));
    }
}
