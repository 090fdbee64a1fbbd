//! Auxiliary indexes: the minute-bucket time index and the inverted
//! postings over tag and pid.
//!
//! Postings stay exact until the combined entry count crosses a ceiling;
//! past that they degrade to every-Nth-ordinal sampling for the remainder
//! of the build (pathological reports can carry >10⁵ distinct tags). A
//! sampled index still records the first occurrence of every key, so key
//! absence remains conclusive — but sampled lists are only a scan hint,
//! never a candidate set.

use crate::error::CacheError;
use std::collections::HashMap;
use std::fs::File;
use std::hash::Hash;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

pub const TIME_INDEX_MAGIC: [u8; 4] = *b"BSTI";
pub const POSTINGS_MAGIC: [u8; 4] = *b"BSIV";
pub const INDEX_VERSION: u32 = 1;

/// Combined ordinal-entry ceiling before a postings index degrades.
pub const MAX_EXACT_ENTRIES: usize = 1 << 20;
/// Sampling stride once degraded.
pub const SAMPLE_STRIDE: u64 = 8;

/// Epoch milliseconds → minute bucket.
pub fn bucket_of(ts_epoch_ms: i64) -> u64 {
    (ts_epoch_ms.max(0) as u64) / 60_000
}

// ---------------------------------------------------------------------------
// time index
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct TimeIndexBuilder {
    entries: Vec<(u64, u64)>,
}

impl TimeIndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the first ordinal seen for a new minute bucket. Callers must
    /// keep buckets strictly increasing; later sections that jump backwards
    /// in time are simply not re-indexed (scans remain correct because the
    /// row-level predicate is always applied).
    pub fn push(&mut self, bucket: u64, ordinal: u64) {
        debug_assert!(self.entries.last().is_none_or(|&(b, _)| b < bucket));
        self.entries.push((bucket, ordinal));
    }

    pub fn last_bucket(&self) -> Option<u64> {
        self.entries.last().map(|&(b, _)| b)
    }

    pub fn write(&self, path: &Path) -> Result<(), CacheError> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(&TIME_INDEX_MAGIC)?;
        out.write_all(&INDEX_VERSION.to_le_bytes())?;
        out.write_all(&(self.entries.len() as u64).to_le_bytes())?;
        for &(bucket, ordinal) in &self.entries {
            out.write_all(&bucket.to_le_bytes())?;
            out.write_all(&ordinal.to_le_bytes())?;
        }
        out.flush()?;
        Ok(())
    }
}

/// Sorted `(bucket, first ordinal)` pairs with O(log n) seek.
#[derive(Debug)]
pub struct TimeIndex {
    entries: Vec<(u64, u64)>,
}

impl TimeIndex {
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let data = std::fs::read(path)?;
        let mut pos = 0usize;
        expect_magic(&data, &mut pos, &TIME_INDEX_MAGIC, "time index")?;
        let count = read_u64(&data, &mut pos)? as usize;
        if data.len() != pos + count * 16 {
            return Err(CacheError::Corrupt("time index length mismatch".into()));
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let bucket = read_u64(&data, &mut pos)?;
            let ordinal = read_u64(&data, &mut pos)?;
            entries.push((bucket, ordinal));
        }
        Ok(Self { entries })
    }

    /// Ordinal of the first entry whose bucket is ≥ the target bucket.
    /// `None` means every indexed bucket is older than the target.
    pub fn seek(&self, bucket: u64) -> Option<u64> {
        let idx = self.entries.partition_point(|&(b, _)| b < bucket);
        self.entries.get(idx).map(|&(_, ordinal)| ordinal)
    }

    /// Conservative scan lower bound for a time-from filter: the start of
    /// the target's own bucket, since rows inside it precede the target.
    /// `None` means no indexed row can reach the target time.
    pub fn lower_bound(&self, ts_epoch_ms: i64) -> Option<u64> {
        self.seek(bucket_of(ts_epoch_ms))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// inverted postings
// ---------------------------------------------------------------------------

/// Key codec for a postings file.
pub trait PostingKey: Eq + Hash + Clone {
    fn encode(&self, out: &mut Vec<u8>);
    fn decode(data: &[u8], pos: &mut usize) -> Result<Self, CacheError>;
}

impl PostingKey for String {
    fn encode(&self, out: &mut Vec<u8>) {
        let bytes = &self.as_bytes()[..self.len().min(u16::MAX as usize)];
        out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
        out.extend_from_slice(bytes);
    }

    fn decode(data: &[u8], pos: &mut usize) -> Result<Self, CacheError> {
        let len = read_u16(data, pos)? as usize;
        let end = pos
            .checked_add(len)
            .filter(|&e| e <= data.len())
            .ok_or_else(|| CacheError::Corrupt("postings key overruns file".into()))?;
        let s = String::from_utf8_lossy(&data[*pos..end]).into_owned();
        *pos = end;
        Ok(s)
    }
}

impl PostingKey for i32 {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn decode(data: &[u8], pos: &mut usize) -> Result<Self, CacheError> {
        let end = pos
            .checked_add(4)
            .filter(|&e| e <= data.len())
            .ok_or_else(|| CacheError::Corrupt("postings key overruns file".into()))?;
        let v = i32::from_le_bytes(data[*pos..end].try_into().expect("4-byte slice"));
        *pos = end;
        Ok(v)
    }
}

#[derive(Debug, Default)]
struct PostingList {
    /// Total occurrences observed, sampled or not.
    occurrences: u64,
    ordinals: Vec<u64>,
}

/// In-memory builder; one per indexed attribute.
pub struct PostingsBuilder<K: PostingKey> {
    map: HashMap<K, PostingList>,
    stored: usize,
    sampled: bool,
    name: &'static str,
}

impl<K: PostingKey> PostingsBuilder<K> {
    pub fn new(name: &'static str) -> Self {
        Self {
            map: HashMap::new(),
            stored: 0,
            sampled: false,
            name,
        }
    }

    pub fn push(&mut self, key: K, ordinal: u64) {
        let list = self.map.entry(key).or_default();
        if self.sampled {
            if list.occurrences % SAMPLE_STRIDE == 0 {
                list.ordinals.push(ordinal);
                self.stored += 1;
            }
            list.occurrences += 1;
            return;
        }

        list.ordinals.push(ordinal);
        list.occurrences += 1;
        self.stored += 1;
        if self.stored > MAX_EXACT_ENTRIES {
            self.degrade();
        }
    }

    /// Thin every list to the sampling stride and stay sampled from here on.
    fn degrade(&mut self) {
        let before = self.stored;
        let mut stored = 0usize;
        for list in self.map.values_mut() {
            let mut i = 0u64;
            list.ordinals.retain(|_| {
                let keep = i % SAMPLE_STRIDE == 0;
                i += 1;
                keep
            });
            // Continue the cadence from the retained prefix.
            list.occurrences = i;
            stored += list.ordinals.len();
        }
        self.stored = stored;
        self.sampled = true;
        debug!(
            index = self.name,
            before, after = stored, stride = SAMPLE_STRIDE, "postings degraded to sampling"
        );
    }

    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    pub fn write(&self, path: &Path) -> Result<(), CacheError> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(&POSTINGS_MAGIC)?;
        out.write_all(&INDEX_VERSION.to_le_bytes())?;
        out.write_all(&[self.sampled as u8])?;
        out.write_all(&(SAMPLE_STRIDE as u32).to_le_bytes())?;
        out.write_all(&(self.map.len() as u64).to_le_bytes())?;
        let mut key_buf = Vec::new();
        for (key, list) in &self.map {
            key_buf.clear();
            key.encode(&mut key_buf);
            out.write_all(&key_buf)?;
            out.write_all(&(list.ordinals.len() as u64).to_le_bytes())?;
            for &ordinal in &list.ordinals {
                out.write_all(&ordinal.to_le_bytes())?;
            }
        }
        out.flush()?;
        Ok(())
    }
}

/// Loaded postings. Lists are sorted ascending (build order).
#[derive(Debug)]
pub struct Postings<K: PostingKey> {
    map: HashMap<K, Vec<u64>>,
    sampled: bool,
}

impl<K: PostingKey> Postings<K> {
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let data = std::fs::read(path)?;
        let mut pos = 0usize;
        expect_magic(&data, &mut pos, &POSTINGS_MAGIC, "postings")?;
        let sampled = read_u8(&data, &mut pos)? != 0;
        let _stride = read_u32(&data, &mut pos)?;
        let key_count = read_u64(&data, &mut pos)? as usize;

        let mut map = HashMap::with_capacity(key_count);
        for _ in 0..key_count {
            let key = K::decode(&data, &mut pos)?;
            let len = read_u64(&data, &mut pos)? as usize;
            let mut ordinals = Vec::with_capacity(len);
            for _ in 0..len {
                ordinals.push(read_u64(&data, &mut pos)?);
            }
            map.insert(key, ordinals);
        }
        if pos != data.len() {
            return Err(CacheError::Corrupt("postings trailing bytes".into()));
        }
        Ok(Self { map, sampled })
    }

    pub fn is_exact(&self) -> bool {
        !self.sampled
    }

    pub fn get(&self, key: &K) -> Option<&[u64]> {
        self.map.get(key).map(|v| v.as_slice())
    }
}

/// Intersect two ascending ordinal lists.
pub fn intersect(a: &[u64], b: &[u64]) -> Vec<u64> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

/// Merge ascending ordinal lists into one sorted, deduplicated list.
pub fn union(lists: &[&[u64]]) -> Vec<u64> {
    let mut out: Vec<u64> = Vec::new();
    for list in lists {
        out.extend_from_slice(list);
    }
    out.sort_unstable();
    out.dedup();
    out
}

// ---------------------------------------------------------------------------
// little-endian helpers
// ---------------------------------------------------------------------------

fn expect_magic(
    data: &[u8],
    pos: &mut usize,
    magic: &[u8; 4],
    what: &str,
) -> Result<(), CacheError> {
    if data.len() < *pos + 8 || &data[*pos..*pos + 4] != magic {
        return Err(CacheError::Corrupt(format!("bad {what} magic")));
    }
    *pos += 4;
    let version = read_u32(data, pos)?;
    if version != INDEX_VERSION {
        return Err(CacheError::Stale(format!(
            "{what} version {version}, expected {INDEX_VERSION}"
        )));
    }
    Ok(())
}

fn read_u8(data: &[u8], pos: &mut usize) -> Result<u8, CacheError> {
    let v = *data
        .get(*pos)
        .ok_or_else(|| CacheError::Corrupt("index file truncated".into()))?;
    *pos += 1;
    Ok(v)
}

fn read_u16(data: &[u8], pos: &mut usize) -> Result<u16, CacheError> {
    let end = *pos + 2;
    if end > data.len() {
        return Err(CacheError::Corrupt("index file truncated".into()));
    }
    let v = u16::from_le_bytes(data[*pos..end].try_into().expect("2-byte slice"));
    *pos = end;
    Ok(v)
}

fn read_u32(data: &[u8], pos: &mut usize) -> Result<u32, CacheError> {
    let end = *pos + 4;
    if end > data.len() {
        return Err(CacheError::Corrupt("index file truncated".into()));
    }
    let v = u32::from_le_bytes(data[*pos..end].try_into().expect("4-byte slice"));
    *pos = end;
    Ok(v)
}

fn read_u64(data: &[u8], pos: &mut usize) -> Result<u64, CacheError> {
    let end = *pos + 8;
    if end > data.len() {
        return Err(CacheError::Corrupt("index file truncated".into()));
    }
    let v = u64::from_le_bytes(data[*pos..end].try_into().expect("8-byte slice"));
    *pos = end;
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_index_seeks_first_bucket_at_or_after() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("time_index.bin");
        let mut b = TimeIndexBuilder::new();
        b.push(100, 0);
        b.push(101, 40);
        b.push(105, 90);
        b.write(&path).unwrap();

        let idx = TimeIndex::load(&path).unwrap();
        assert_eq!(idx.seek(100), Some(0));
        assert_eq!(idx.seek(101), Some(40));
        assert_eq!(idx.seek(102), Some(90));
        assert_eq!(idx.seek(105), Some(90));
        assert_eq!(idx.seek(106), None);
        assert_eq!(idx.lower_bound(100 * 60_000 + 30_000), Some(0));
        assert_eq!(idx.lower_bound(200 * 60_000), None);
    }

    #[test]
    fn postings_round_trip_for_tags_and_pids() {
        let dir = tempfile::tempdir().unwrap();

        let mut tags = PostingsBuilder::<String>::new("tag");
        tags.push("ActivityManager".into(), 0);
        tags.push("Net".into(), 1);
        tags.push("ActivityManager".into(), 5);
        let tag_path = dir.path().join("inv_tag.bin");
        tags.write(&tag_path).unwrap();

        let mut pids = PostingsBuilder::<i32>::new("pid");
        pids.push(1000, 0);
        pids.push(1001, 1);
        pids.push(1000, 5);
        let pid_path = dir.path().join("inv_pid.bin");
        pids.write(&pid_path).unwrap();

        let tags = Postings::<String>::load(&tag_path).unwrap();
        assert!(tags.is_exact());
        assert_eq!(tags.get(&"ActivityManager".to_string()), Some(&[0u64, 5][..]));
        assert_eq!(tags.get(&"Missing".to_string()), None);

        let pids = Postings::<i32>::load(&pid_path).unwrap();
        assert_eq!(pids.get(&1000), Some(&[0u64, 5][..]));
    }

    #[test]
    fn postings_degrade_past_the_ceiling() {
        let mut b = PostingsBuilder::<i32>::new("pid");
        for ordinal in 0..=(MAX_EXACT_ENTRIES as u64) {
            b.push((ordinal % 4) as i32, ordinal);
        }
        assert!(b.is_sampled());
        // First occurrence of every key survives thinning.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inv_pid.bin");
        b.write(&path).unwrap();
        let loaded = Postings::<i32>::load(&path).unwrap();
        assert!(!loaded.is_exact());
        for pid in 0..4 {
            let list = loaded.get(&pid).unwrap();
            assert_eq!(list[0], pid as u64);
        }
    }

    #[test]
    fn sampled_builder_keeps_every_nth() {
        let mut b = PostingsBuilder::<i32>::new("pid");
        for ordinal in 0..=(MAX_EXACT_ENTRIES as u64) {
            b.push(7, ordinal);
        }
        assert!(b.is_sampled());
        for extra in 0..100u64 {
            b.push(7, MAX_EXACT_ENTRIES as u64 + 1 + extra);
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.bin");
        b.write(&path).unwrap();
        let loaded = Postings::<i32>::load(&path).unwrap();
        let list = loaded.get(&7).unwrap();
        // Strictly increasing with stride gaps.
        assert!(list.windows(2).all(|w| w[0] < w[1]));
        assert!(list.len() < MAX_EXACT_ENTRIES);
    }

    #[test]
    fn intersect_and_union_are_ordered() {
        assert_eq!(intersect(&[1, 3, 5, 9], &[3, 4, 5, 10]), vec![3, 5]);
        assert_eq!(intersect(&[1, 2], &[]), Vec::<u64>::new());
        assert_eq!(union(&[&[5, 9], &[1, 9, 12]]), vec![1, 5, 9, 12]);
    }

    #[test]
    fn corrupt_postings_fail_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inv_tag.bin");
        std::fs::write(&path, b"not an index").unwrap();
        assert!(matches!(
            Postings::<String>::load(&path),
            Err(CacheError::Corrupt(_))
        ));
    }
}
