//! The tuple codec.
//!
//! Tuples encode as `(schema_id: u32, field_count: u16, field...)` with a
//! per-field tag byte. The encoding is deterministic, so equal tuples are
//! byte-identical and share chunks. Values above an inline threshold are
//! split on content-defined boundaries into `Blob` chunks named by a
//! `BlobList` chunk, and the tuple stores the list hash out of line.

use crate::chunk::{Chunk, ChunkType};
use crate::hash::{Hash, HASH_LEN};
use crate::store::ChunkStore;
use borsh::{BorshDeserialize, BorshSerialize};
use std::cmp::Ordering;

use super::{Value, ValueError};

const TAG_NULL: u8 = 0;
const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_INT: u8 = 3;
const TAG_UINT: u8 = 4;
const TAG_FLOAT: u8 = 5;
const TAG_DECIMAL: u8 = 6;
const TAG_TEXT: u8 = 7;
const TAG_BYTES: u8 = 8;
const TAG_TIMESTAMP: u8 = 9;
const TAG_OUT_TEXT: u8 = 10;
const TAG_OUT_BYTES: u8 = 11;

/// Largest value stored inline in a row tuple.
const INLINE_MAX: usize = 2048;
/// Largest value allowed in an index key.
const KEY_FIELD_MAX: usize = 1024;

const BLOB_MIN_SIZE: u32 = 4 * 1024;
const BLOB_AVG_SIZE: u32 = 16 * 1024;
const BLOB_MAX_SIZE: u32 = 64 * 1024;

/// Encode an index key tuple. Key fields must be inline; oversized fields
/// fail with `KeyTooLong`.
pub fn encode_key(schema_id: u32, values: &[Value]) -> Result<Vec<u8>, ValueError> {
    let mut out = Vec::with_capacity(16 + values.len() * 9);
    out.extend_from_slice(&schema_id.to_le_bytes());
    out.extend_from_slice(&(values.len() as u16).to_le_bytes());
    for value in values {
        match value {
            Value::Text(s) if s.len() > KEY_FIELD_MAX => {
                return Err(ValueError::KeyTooLong(s.len()))
            }
            Value::Bytes(b) if b.len() > KEY_FIELD_MAX => {
                return Err(ValueError::KeyTooLong(b.len()))
            }
            _ => encode_inline(&mut out, value),
        }
    }
    Ok(out)
}

/// Encode a row (value) tuple, spilling large text/bytes fields out of
/// line through `store`.
pub fn encode_row(
    store: &dyn ChunkStore,
    schema_id: u32,
    values: &[Value],
) -> Result<Vec<u8>, ValueError> {
    let mut out = Vec::with_capacity(16 + values.len() * 9);
    out.extend_from_slice(&schema_id.to_le_bytes());
    out.extend_from_slice(&(values.len() as u16).to_le_bytes());
    for value in values {
        match value {
            Value::Text(s) if s.len() > INLINE_MAX => {
                let (hash, len) = write_blob(store, s.as_bytes())?;
                out.push(TAG_OUT_TEXT);
                out.extend_from_slice(hash.as_bytes());
                out.extend_from_slice(&len.to_le_bytes());
            }
            Value::Bytes(b) if b.len() > INLINE_MAX => {
                let (hash, len) = write_blob(store, b)?;
                out.push(TAG_OUT_BYTES);
                out.extend_from_slice(hash.as_bytes());
                out.extend_from_slice(&len.to_le_bytes());
            }
            _ => encode_inline(&mut out, value),
        }
    }
    Ok(out)
}

fn encode_inline(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(false) => out.push(TAG_FALSE),
        Value::Bool(true) => out.push(TAG_TRUE),
        Value::Int(i) => {
            out.push(TAG_INT);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Value::Uint(u) => {
            out.push(TAG_UINT);
            out.extend_from_slice(&u.to_le_bytes());
        }
        Value::Float(f) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&f.to_bits().to_le_bytes());
        }
        Value::Decimal(d) => {
            out.push(TAG_DECIMAL);
            out.extend_from_slice(&(d.len() as u32).to_le_bytes());
            out.extend_from_slice(d.as_bytes());
        }
        Value::Text(s) => {
            out.push(TAG_TEXT);
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            out.push(TAG_BYTES);
            out.extend_from_slice(&(b.len() as u32).to_le_bytes());
            out.extend_from_slice(b);
        }
        Value::Timestamp(millis) => {
            out.push(TAG_TIMESTAMP);
            out.extend_from_slice(&millis.to_le_bytes());
        }
    }
}

/// Decode a key tuple. Key tuples never hold out-of-line fields.
pub fn decode_key(bytes: &[u8]) -> Result<(u32, Vec<Value>), ValueError> {
    let mut fields = FieldWalker::new(bytes)?;
    let mut values = Vec::with_capacity(fields.count as usize);
    while let Some(field) = fields.next_field()? {
        match field {
            Field::Inline(v) => values.push(v),
            Field::OutOfLine { .. } => {
                return Err(ValueError::Corrupt("out-of-line field in key tuple".into()))
            }
        }
    }
    Ok((fields.schema_id, values))
}

/// Decode a row tuple, materializing out-of-line fields through `store`.
pub fn decode_row(store: &dyn ChunkStore, bytes: &[u8]) -> Result<(u32, Vec<Value>), ValueError> {
    let mut fields = FieldWalker::new(bytes)?;
    let mut values = Vec::with_capacity(fields.count as usize);
    while let Some(field) = fields.next_field()? {
        match field {
            Field::Inline(v) => values.push(v),
            Field::OutOfLine { hash, text, .. } => {
                let bytes = read_blob(store, &hash)?;
                values.push(if text {
                    Value::Text(String::from_utf8(bytes).map_err(|_| {
                        ValueError::Corrupt("out-of-line text is not utf-8".into())
                    })?)
                } else {
                    Value::Bytes(bytes)
                });
            }
        }
    }
    Ok((fields.schema_id, values))
}

/// The schema id recorded in a tuple.
pub fn tuple_schema_id(bytes: &[u8]) -> Result<u32, ValueError> {
    Ok(FieldWalker::new(bytes)?.schema_id)
}

/// Hashes of `BlobList` chunks referenced by out-of-line fields.
pub fn blob_refs_in_tuple(bytes: &[u8]) -> Result<Vec<Hash>, ValueError> {
    let mut fields = FieldWalker::new(bytes)?;
    let mut refs = Vec::new();
    while let Some(field) = fields.next_field()? {
        if let Field::OutOfLine { hash, .. } = field {
            refs.push(hash);
        }
    }
    Ok(refs)
}

/// Field-wise comparison of two encoded tuples, ignoring the schema id so
/// that rows written under different schema generations of the same table
/// still order consistently. Falls back to byte order on corrupt input.
pub fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
    match compare_encoded_inner(a, b) {
        Ok(ord) => ord,
        Err(_) => a.cmp(b),
    }
}

fn compare_encoded_inner(a: &[u8], b: &[u8]) -> Result<Ordering, ValueError> {
    let mut wa = FieldWalker::new(a)?;
    let mut wb = FieldWalker::new(b)?;
    loop {
        match (wa.next_field()?, wb.next_field()?) {
            (None, None) => return Ok(Ordering::Equal),
            (None, Some(_)) => return Ok(Ordering::Less),
            (Some(_), None) => return Ok(Ordering::Greater),
            (Some(fa), Some(fb)) => {
                let ord = compare_fields(&fa, &fb);
                if ord != Ordering::Equal {
                    return Ok(ord);
                }
            }
        }
    }
}

fn compare_fields(a: &Field, b: &Field) -> Ordering {
    match (a, b) {
        (Field::Inline(va), Field::Inline(vb)) => va.compare(vb),
        // Out-of-line fields order by content hash; they are excluded from
        // index keys, so this only tie-breaks artifact scans.
        (Field::OutOfLine { hash: ha, .. }, Field::OutOfLine { hash: hb, .. }) => ha.cmp(hb),
        (Field::Inline(v), Field::OutOfLine { .. }) => {
            if v.is_null() {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (Field::OutOfLine { .. }, Field::Inline(v)) => {
            if v.is_null() {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
    }
}

enum Field {
    Inline(Value),
    OutOfLine { hash: Hash, len: u64, text: bool },
}

struct FieldWalker<'a> {
    bytes: &'a [u8],
    pos: usize,
    schema_id: u32,
    count: u16,
    seen: u16,
}

impl<'a> FieldWalker<'a> {
    fn new(bytes: &'a [u8]) -> Result<FieldWalker<'a>, ValueError> {
        if bytes.len() < 6 {
            return Err(ValueError::Corrupt("tuple shorter than header".into()));
        }
        let schema_id = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let count = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        Ok(FieldWalker {
            bytes,
            pos: 6,
            schema_id,
            count,
            seen: 0,
        })
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ValueError> {
        if self.pos + n > self.bytes.len() {
            return Err(ValueError::Corrupt("tuple truncated".into()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn next_field(&mut self) -> Result<Option<Field>, ValueError> {
        if self.seen == self.count {
            return Ok(None);
        }
        self.seen += 1;
        let tag = self.take(1)?[0];
        let field = match tag {
            TAG_NULL => Field::Inline(Value::Null),
            TAG_FALSE => Field::Inline(Value::Bool(false)),
            TAG_TRUE => Field::Inline(Value::Bool(true)),
            TAG_INT => Field::Inline(Value::Int(i64::from_le_bytes(
                self.take(8)?.try_into().unwrap(),
            ))),
            TAG_UINT => Field::Inline(Value::Uint(u64::from_le_bytes(
                self.take(8)?.try_into().unwrap(),
            ))),
            TAG_FLOAT => Field::Inline(Value::Float(f64::from_bits(u64::from_le_bytes(
                self.take(8)?.try_into().unwrap(),
            )))),
            TAG_DECIMAL | TAG_TEXT => {
                let len = u32::from_le_bytes(self.take(4)?.try_into().unwrap()) as usize;
                let s = std::str::from_utf8(self.take(len)?)
                    .map_err(|_| ValueError::Corrupt("non-utf8 text field".into()))?
                    .to_string();
                Field::Inline(if tag == TAG_DECIMAL {
                    Value::Decimal(s)
                } else {
                    Value::Text(s)
                })
            }
            TAG_BYTES => {
                let len = u32::from_le_bytes(self.take(4)?.try_into().unwrap()) as usize;
                Field::Inline(Value::Bytes(self.take(len)?.to_vec()))
            }
            TAG_TIMESTAMP => Field::Inline(Value::Timestamp(i64::from_le_bytes(
                self.take(8)?.try_into().unwrap(),
            ))),
            TAG_OUT_TEXT | TAG_OUT_BYTES => {
                let mut h = [0u8; HASH_LEN];
                h.copy_from_slice(self.take(HASH_LEN)?);
                let len = u64::from_le_bytes(self.take(8)?.try_into().unwrap());
                Field::OutOfLine {
                    hash: Hash(h),
                    len,
                    text: tag == TAG_OUT_TEXT,
                }
            }
            other => return Err(ValueError::Corrupt(format!("unknown field tag {other}"))),
        };
        Ok(Some(field))
    }
}

/// An encoded tuple ordered field-wise, for use as a map key.
#[derive(Clone, Debug)]
pub struct TupleKey(pub Vec<u8>);

impl PartialEq for TupleKey {
    fn eq(&self, other: &Self) -> bool {
        compare_encoded(&self.0, &other.0) == Ordering::Equal
    }
}
impl Eq for TupleKey {}
impl PartialOrd for TupleKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TupleKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_encoded(&self.0, &other.0)
    }
}

#[derive(BorshSerialize, BorshDeserialize)]
struct BlobList {
    total_len: u64,
    segments: Vec<(Hash, u32)>,
}

/// Split `data` on content-defined boundaries, store each segment as a
/// `Blob` chunk, and return the hash of the `BlobList` chunk naming them.
pub fn write_blob(store: &dyn ChunkStore, data: &[u8]) -> Result<(Hash, u64), ValueError> {
    let chunker = fastcdc::v2020::FastCDC::new(data, BLOB_MIN_SIZE, BLOB_AVG_SIZE, BLOB_MAX_SIZE);
    let mut segments = Vec::new();
    for cut in chunker {
        let segment = &data[cut.offset..cut.offset + cut.length];
        let chunk = Chunk::new(ChunkType::Blob, segment.to_vec());
        segments.push((chunk.hash(), cut.length as u32));
        store.put(chunk)?;
    }
    let list = BlobList {
        total_len: data.len() as u64,
        segments,
    };
    let chunk = Chunk::new(ChunkType::BlobList, borsh::to_vec(&list).expect("borsh"));
    let hash = chunk.hash();
    store.put(chunk)?;
    Ok((hash, data.len() as u64))
}

/// Reassemble an out-of-line value from its `BlobList`.
pub fn read_blob(store: &dyn ChunkStore, hash: &Hash) -> Result<Vec<u8>, ValueError> {
    let chunk = store.get(hash)?;
    if chunk.ty() != ChunkType::BlobList {
        return Err(ValueError::Corrupt(format!(
            "expected blob list at {hash}, found {:?}",
            chunk.ty()
        )));
    }
    let list = BlobList::try_from_slice(chunk.payload())
        .map_err(|e| ValueError::Corrupt(e.to_string()))?;
    let mut out = Vec::with_capacity(list.total_len as usize);
    for (segment_hash, _) in &list.segments {
        let segment = store.get(segment_hash)?;
        out.extend_from_slice(segment.payload());
    }
    if out.len() as u64 != list.total_len {
        return Err(ValueError::Corrupt(format!(
            "blob {hash} reassembled to {} bytes, expected {}",
            out.len(),
            list.total_len
        )));
    }
    Ok(out)
}

/// Segment hashes of a blob list, for reachability walks.
pub fn blob_list_refs(payload: &[u8]) -> Result<Vec<Hash>, ValueError> {
    let list =
        BlobList::try_from_slice(payload).map_err(|e| ValueError::Corrupt(e.to_string()))?;
    Ok(list.segments.into_iter().map(|(h, _)| h).collect())
}
