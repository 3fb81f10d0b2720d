//! Chunks: immutable, content-addressed byte blobs with a type tag.

use crate::hash::Hash;

/// How a chunk's payload should be decoded. Stored as the first byte of
/// the chunk, ahead of the payload, and covered by the content hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChunkType {
    /// Prolly tree node (leaf or internal).
    Node = 1,
    /// Raw segment of an out-of-line value.
    Blob = 2,
    /// Ordered list of blob segments making up one large value.
    BlobList = 3,
    /// Table schema.
    Schema = 4,
    /// Table: schema + index roots + artifacts.
    Table = 5,
    /// Root value: the top-level per-database state object.
    Root = 6,
    /// Commit.
    Commit = 7,
    /// Per-branch working set.
    WorkingSet = 8,
    /// Annotated tag metadata.
    Tag = 9,
}

impl ChunkType {
    pub fn from_byte(b: u8) -> Option<ChunkType> {
        Some(match b {
            1 => ChunkType::Node,
            2 => ChunkType::Blob,
            3 => ChunkType::BlobList,
            4 => ChunkType::Schema,
            5 => ChunkType::Table,
            6 => ChunkType::Root,
            7 => ChunkType::Commit,
            8 => ChunkType::WorkingSet,
            9 => ChunkType::Tag,
            _ => return None,
        })
    }
}

/// An immutable byte sequence plus its content hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    ty: ChunkType,
    payload: Vec<u8>,
    hash: Hash,
}

impl Chunk {
    /// Build a chunk from a type tag and payload, computing its hash.
    pub fn new(ty: ChunkType, payload: Vec<u8>) -> Chunk {
        let mut stored = Vec::with_capacity(payload.len() + 1);
        stored.push(ty as u8);
        stored.extend_from_slice(&payload);
        let hash = Hash::of(&stored);
        Chunk { ty, payload, hash }
    }

    /// Reconstruct a chunk from its stored bytes (tag byte + payload).
    /// Returns `None` when the tag byte is unknown or the bytes are empty.
    pub fn from_stored(bytes: &[u8]) -> Option<Chunk> {
        let (&tag, payload) = bytes.split_first()?;
        let ty = ChunkType::from_byte(tag)?;
        Some(Chunk::new(ty, payload.to_vec()))
    }

    /// The on-disk/wire representation: tag byte followed by the payload.
    pub fn stored_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 1);
        out.push(self.ty as u8);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn ty(&self) -> ChunkType {
        self.ty
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn len(&self) -> usize {
        self.payload.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}
