//! Append-only table files: the persistent chunk packs.
//!
//! Layout:
//!
//! ```text
//! [magic 8B]
//! [record]*          record = u32 uncompressed_len | u32 compressed_len
//!                             | zstd(stored chunk bytes)
//! [index]            index  = (hash 20B | u64 offset | u32 compressed_len
//!                             | u32 uncompressed_len)*
//! [footer 44B]       footer = u64 index_offset | u32 chunk_count
//!                             | identity 20B | magic 8B
//! ```
//!
//! The identity is the hash of the index section and doubles as the file
//! name. Chunks are never rewritten; compaction copies live chunks into new
//! files and swaps the manifest's table-file list.

use crate::chunk::Chunk;
use crate::hash::{Hash, HASH_LEN};
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::StoreError;

const MAGIC: &[u8; 8] = b"TRBTBLF1";
const FOOTER_LEN: u64 = 8 + 4 + HASH_LEN as u64 + 8;
const ZSTD_LEVEL: i32 = 1;

#[derive(Clone, Copy, Debug)]
struct IndexEntry {
    offset: u64,
    compressed_len: u32,
    uncompressed_len: u32,
}

/// Write a set of chunks into a new table file in `dir`. The file is
/// written under a temporary name, fsynced, then renamed to its identity.
/// Returns the identity and the record count.
pub fn write_table_file(dir: &Path, chunks: &[Chunk]) -> Result<(String, u32), StoreError> {
    let tmp = dir.join(format!("incoming-{}.tmp", std::process::id()));
    let mut body = Vec::new();
    body.extend_from_slice(MAGIC);

    let mut index = Vec::new();
    for chunk in chunks {
        let stored = chunk.stored_bytes();
        let compressed = zstd::bulk::compress(&stored, ZSTD_LEVEL)?;
        let offset = body.len() as u64;
        body.extend_from_slice(&(stored.len() as u32).to_le_bytes());
        body.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        body.extend_from_slice(&compressed);

        index.extend_from_slice(chunk.hash().as_bytes());
        index.extend_from_slice(&offset.to_le_bytes());
        index.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        index.extend_from_slice(&(stored.len() as u32).to_le_bytes());
    }

    let index_offset = body.len() as u64;
    let identity = Hash::of(&index);
    body.extend_from_slice(&index);
    body.extend_from_slice(&index_offset.to_le_bytes());
    body.extend_from_slice(&(chunks.len() as u32).to_le_bytes());
    body.extend_from_slice(identity.as_bytes());
    body.extend_from_slice(MAGIC);

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    let id = identity.to_hex();
    fs::rename(&tmp, dir.join(&id))?;
    tracing::debug!(table_file = %id, chunks = chunks.len(), "wrote table file");
    Ok((id, chunks.len() as u32))
}

/// Read handle over one table file. The index is loaded once; records are
/// read on demand.
pub struct TableFileReader {
    path: PathBuf,
    id: String,
    index: HashMap<Hash, IndexEntry>,
    file: Mutex<fs::File>,
}

impl TableFileReader {
    /// Open a table file, verifying its footer. A missing or corrupt footer
    /// means a partial write and surfaces as `CorruptTableFile`.
    pub fn open(dir: &Path, id: &str) -> Result<TableFileReader, StoreError> {
        let path = dir.join(id);
        let mut file = fs::File::open(&path)?;
        let len = file.metadata()?.len();
        if len < MAGIC.len() as u64 + FOOTER_LEN {
            return Err(StoreError::CorruptTableFile(id.to_string(), "truncated".into()));
        }

        file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
        let mut footer = [0u8; FOOTER_LEN as usize];
        file.read_exact(&mut footer)?;
        if &footer[footer.len() - 8..] != MAGIC {
            return Err(StoreError::CorruptTableFile(
                id.to_string(),
                "bad footer magic".into(),
            ));
        }
        let index_offset = u64::from_le_bytes(footer[0..8].try_into().unwrap());
        let chunk_count = u32::from_le_bytes(footer[8..12].try_into().unwrap());

        let data_end = len - FOOTER_LEN;
        if index_offset > data_end {
            return Err(StoreError::CorruptTableFile(
                id.to_string(),
                "index offset out of range".into(),
            ));
        }
        let index_len = data_end - index_offset;
        const ENTRY_LEN: u64 = HASH_LEN as u64 + 8 + 4 + 4;
        if index_len != chunk_count as u64 * ENTRY_LEN {
            return Err(StoreError::CorruptTableFile(
                id.to_string(),
                "index length mismatch".into(),
            ));
        }

        file.seek(SeekFrom::Start(index_offset))?;
        let mut index_bytes = vec![0u8; index_len as usize];
        file.read_exact(&mut index_bytes)?;

        let identity = Hash::of(&index_bytes);
        if footer[12..12 + HASH_LEN] != identity.0 {
            return Err(StoreError::CorruptTableFile(
                id.to_string(),
                "identity mismatch".into(),
            ));
        }

        let mut index = HashMap::with_capacity(chunk_count as usize);
        for entry in index_bytes.chunks_exact(ENTRY_LEN as usize) {
            let mut h = [0u8; HASH_LEN];
            h.copy_from_slice(&entry[..HASH_LEN]);
            let offset = u64::from_le_bytes(entry[HASH_LEN..HASH_LEN + 8].try_into().unwrap());
            let compressed_len =
                u32::from_le_bytes(entry[HASH_LEN + 8..HASH_LEN + 12].try_into().unwrap());
            let uncompressed_len =
                u32::from_le_bytes(entry[HASH_LEN + 12..HASH_LEN + 16].try_into().unwrap());
            index.insert(
                Hash(h),
                IndexEntry {
                    offset,
                    compressed_len,
                    uncompressed_len,
                },
            );
        }

        Ok(TableFileReader {
            path,
            id: id.to_string(),
            index,
            file: Mutex::new(file),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn has(&self, hash: &Hash) -> bool {
        self.index.contains_key(hash)
    }

    pub fn chunk_count(&self) -> u32 {
        self.index.len() as u32
    }

    /// All chunk hashes recorded in this file.
    pub fn hashes(&self) -> impl Iterator<Item = &Hash> {
        self.index.keys()
    }

    /// Read one chunk, decompress it and verify the content hash.
    pub fn get(&self, hash: &Hash) -> Result<Option<Chunk>, StoreError> {
        let entry = match self.index.get(hash) {
            Some(e) => *e,
            None => return Ok(None),
        };
        let mut compressed = vec![0u8; entry.compressed_len as usize];
        {
            let mut file = self
                .file
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // Skip the two length prefixes ahead of the compressed bytes.
            file.seek(SeekFrom::Start(entry.offset + 8))?;
            file.read_exact(&mut compressed)?;
        }
        let stored = zstd::bulk::decompress(&compressed, entry.uncompressed_len as usize)
            .map_err(|e| StoreError::CorruptChunk(*hash, e.to_string()))?;
        let chunk = Chunk::from_stored(&stored)
            .ok_or_else(|| StoreError::CorruptChunk(*hash, "unknown chunk type".into()))?;
        if chunk.hash() != *hash {
            return Err(StoreError::CorruptChunk(
                *hash,
                format!("content hashes to {} in {}", chunk.hash(), self.path.display()),
            ));
        }
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkType;
    use tempfile::tempdir;

    fn chunks() -> Vec<Chunk> {
        (0..64u32)
            .map(|i| Chunk::new(ChunkType::Blob, format!("payload number {i}").into_bytes()))
            .collect()
    }

    #[test]
    fn write_and_read_back() {
        let dir = tempdir().unwrap();
        let chunks = chunks();
        let (id, count) = write_table_file(dir.path(), &chunks).unwrap();
        assert_eq!(count, 64);

        let reader = TableFileReader::open(dir.path(), &id).unwrap();
        assert_eq!(reader.chunk_count(), 64);
        for chunk in &chunks {
            let got = reader.get(&chunk.hash()).unwrap().unwrap();
            assert_eq!(&got, chunk);
        }
        assert!(reader
            .get(&Hash::of(b"not stored"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn partial_write_is_detected() {
        let dir = tempdir().unwrap();
        let (id, _) = write_table_file(dir.path(), &chunks()).unwrap();

        // Chop the footer off, as if the process died mid-write.
        let path = dir.path().join(&id);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();

        assert!(matches!(
            TableFileReader::open(dir.path(), &id),
            Err(StoreError::CorruptTableFile(_, _))
        ));
    }
}
