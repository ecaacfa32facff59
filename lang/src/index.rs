use std::{fs, io, path::Path};

use crate::bytecode::{CompiledScript, FORMAT_VERSION};

/// Magic bytes opening an `index.sbi` file.
pub const INDEX_MAGIC: [u8; 4] = *b"SBIX";

/// Default file name for the published index.
pub const INDEX_FILE_NAME: &str = "index.sbi";

#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    #[error("script id {id} is claimed by both \"{first}\" and \"{second}\"")]
    DuplicateId {
        id: u32,
        first: String,
        second: String,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum IndexDecodeError {
    #[error("index is truncated")]
    Truncated,
    #[error("not an index file (bad magic)")]
    BadMagic,
    #[error("unsupported index version {0}")]
    UnsupportedVersion(u16),
    #[error("index entries are not sorted by id")]
    Unsorted,
}

/// One record in the index: where a script's code section lives.
///
/// `offset` and `length` are relative to the start of that script's own
/// artifact file, so a consumer can seek straight past the header and
/// constant pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: u32,
    pub offset: u32,
    pub length: u32,
}

impl IndexEntry {
    const ENCODED_LEN: usize = 12;
}

/// The artifact index: entries sorted ascending by script id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Index {
    entries: Vec<IndexEntry>,
}

impl Index {
    /// Collects one entry per compiled script, sorted by id.
    ///
    /// Two scripts claiming the same id is an error; the message names
    /// both so the collision can be fixed at its source.
    pub fn build(scripts: &[CompiledScript]) -> Result<Self, IndexError> {
        let mut order: Vec<&CompiledScript> = scripts.iter().collect();
        order.sort_by_key(|s| s.id);
        for pair in order.windows(2) {
            if pair[0].id == pair[1].id {
                return Err(IndexError::DuplicateId {
                    id: pair[0].id,
                    first: pair[0].name.clone(),
                    second: pair[1].name.clone(),
                });
            }
        }
        let entries = order
            .iter()
            .map(|s| IndexEntry {
                id: s.id,
                offset: s.code_offset() as u32,
                length: s.code.len() as u32,
            })
            .collect();
        Ok(Index { entries })
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn get(&self, id: u32) -> Option<&IndexEntry> {
        let at = self.entries.binary_search_by_key(&id, |e| e.id).ok()?;
        Some(&self.entries[at])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serializes the index: magic, version, entry count, then the
    /// entries as little-endian `{id, offset, length}` triples.
    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(10 + self.entries.len() * IndexEntry::ENCODED_LEN);
        out.extend_from_slice(&INDEX_MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            out.extend_from_slice(&entry.id.to_le_bytes());
            out.extend_from_slice(&entry.offset.to_le_bytes());
            out.extend_from_slice(&entry.length.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, IndexDecodeError> {
        if bytes.len() < 10 {
            return Err(IndexDecodeError::Truncated);
        }
        let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if magic != INDEX_MAGIC {
            return Err(IndexDecodeError::BadMagic);
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != FORMAT_VERSION {
            return Err(IndexDecodeError::UnsupportedVersion(version));
        }
        let count = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
        let body = &bytes[10..];
        if body.len() < count * IndexEntry::ENCODED_LEN {
            return Err(IndexDecodeError::Truncated);
        }
        let mut entries = Vec::with_capacity(count);
        for chunk in body.chunks_exact(IndexEntry::ENCODED_LEN).take(count) {
            entries.push(IndexEntry {
                id: u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                offset: u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
                length: u32::from_le_bytes([chunk[8], chunk[9], chunk[10], chunk[11]]),
            });
        }
        if entries.windows(2).any(|pair| pair[0].id >= pair[1].id) {
            return Err(IndexDecodeError::Unsorted);
        }
        Ok(Index { entries })
    }

    /// Publishes the index at `path` atomically: the encoded bytes go to
    /// a sibling `.tmp` file first, then a rename swaps it into place, so
    /// a reader never observes a half-written index.
    pub fn write_atomic(&self, path: &Path) -> io::Result<()> {
        let mut staged = path.as_os_str().to_owned();
        staged.push(".tmp");
        fs::write(&staged, self.encode())?;
        fs::rename(&staged, path)
    }
}
