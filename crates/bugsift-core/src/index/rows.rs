//! The canonical row store.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! header   magic "BSRW" | version u32 | reserved u64          (16 bytes)
//! records  { len u32 | payload | len u32 } ...
//! dir      record file offset, u64 per record
//! footer   dir_offset u64 | count u64 | magic "BSRF" | version u32
//! ```
//!
//! The doubled length frame lets a scan walk records in either direction;
//! the directory gives O(1) ordinal seeks once the store is sealed. The
//! payload keeps the message last so metadata reads never touch it.

use crate::error::CacheError;
use crate::types::{Level, LogRow};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const ROWS_MAGIC: [u8; 4] = *b"BSRW";
pub const FOOTER_MAGIC: [u8; 4] = *b"BSRF";
pub const ROWS_VERSION: u32 = 1;

const HEADER_BYTES: u64 = 16;
const FOOTER_BYTES: u64 = 24;
const FIXED_PAYLOAD_BYTES: usize = 33;

/// Timestamp sentinel for "normalisation failed".
const NO_TS: i64 = i64::MIN;

/// Everything except the message: enough to evaluate level/pid/tid/tag/time
/// predicates and to aggregate stats.
#[derive(Debug, Clone, PartialEq)]
pub struct RowMeta {
    pub byte_offset: u64,
    pub ts_epoch_ms: Option<i64>,
    pub level: Level,
    pub pid: i32,
    pub tid: i32,
    pub ts_raw: String,
    pub tag: String,
}

/// Append-only writer; `finish` seals the store with directory and footer.
pub struct RowWriter {
    out: BufWriter<File>,
    offsets: Vec<u64>,
    pos: u64,
}

impl RowWriter {
    pub fn create(path: &Path) -> Result<Self, CacheError> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        out.write_all(&ROWS_MAGIC)?;
        out.write_all(&ROWS_VERSION.to_le_bytes())?;
        out.write_all(&0u64.to_le_bytes())?;
        Ok(Self {
            out,
            offsets: Vec::new(),
            pos: HEADER_BYTES,
        })
    }

    /// Append a row; returns its record ordinal.
    pub fn append(&mut self, row: &LogRow) -> Result<u64, CacheError> {
        let payload = encode_payload(row);
        let frame_len = payload.len() as u32;

        self.offsets.push(self.pos);
        self.out.write_all(&frame_len.to_le_bytes())?;
        self.out.write_all(&payload)?;
        self.out.write_all(&frame_len.to_le_bytes())?;
        self.pos += 8 + payload.len() as u64;

        Ok(self.offsets.len() as u64 - 1)
    }

    pub fn count(&self) -> u64 {
        self.offsets.len() as u64
    }

    /// Seal the store. Returns the record count.
    pub fn finish(mut self) -> Result<u64, CacheError> {
        let dir_offset = self.pos;
        for off in &self.offsets {
            self.out.write_all(&off.to_le_bytes())?;
        }
        self.out.write_all(&dir_offset.to_le_bytes())?;
        self.out
            .write_all(&(self.offsets.len() as u64).to_le_bytes())?;
        self.out.write_all(&FOOTER_MAGIC)?;
        self.out.write_all(&ROWS_VERSION.to_le_bytes())?;
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(self.offsets.len() as u64)
    }
}

/// Random-access reader over a sealed store.
#[derive(Debug)]
pub struct RowReader {
    file: File,
    count: u64,
    dir_offset: u64,
}

impl RowReader {
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < HEADER_BYTES + FOOTER_BYTES {
            return Err(CacheError::Corrupt("row store truncated".into()));
        }

        let mut header = [0u8; 8];
        file.read_exact(&mut header)?;
        if header[0..4] != ROWS_MAGIC {
            return Err(CacheError::Corrupt("bad row store magic".into()));
        }
        let version = u32::from_le_bytes(header[4..8].try_into().expect("4-byte slice"));
        if version != ROWS_VERSION {
            return Err(CacheError::Stale(format!(
                "row store version {version}, expected {ROWS_VERSION}"
            )));
        }

        file.seek(SeekFrom::End(-(FOOTER_BYTES as i64)))?;
        let mut footer = [0u8; FOOTER_BYTES as usize];
        file.read_exact(&mut footer)?;
        if footer[16..20] != FOOTER_MAGIC {
            return Err(CacheError::Corrupt("bad row store footer".into()));
        }
        let dir_offset = u64::from_le_bytes(footer[0..8].try_into().expect("8-byte slice"));
        let count = u64::from_le_bytes(footer[8..16].try_into().expect("8-byte slice"));

        let dir_end = dir_offset
            .checked_add(count.checked_mul(8).ok_or_else(corrupt_dir)?)
            .ok_or_else(corrupt_dir)?;
        if dir_offset < HEADER_BYTES || dir_end != len - FOOTER_BYTES {
            return Err(corrupt_dir());
        }

        Ok(Self {
            file,
            count,
            dir_offset,
        })
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Read a full row by ordinal.
    pub fn get(&mut self, ordinal: u64) -> Result<LogRow, CacheError> {
        let payload = self.read_payload(ordinal)?;
        decode_row(&payload)
    }

    /// Read everything but the message, for predicate checks and stats.
    pub fn get_meta(&mut self, ordinal: u64) -> Result<RowMeta, CacheError> {
        let payload = self.read_payload(ordinal)?;
        decode_meta(&payload)
    }

    fn read_payload(&mut self, ordinal: u64) -> Result<Vec<u8>, CacheError> {
        if ordinal >= self.count {
            return Err(CacheError::Corrupt(format!(
                "ordinal {ordinal} out of range ({} records)",
                self.count
            )));
        }
        self.file
            .seek(SeekFrom::Start(self.dir_offset + ordinal * 8))?;
        let mut buf8 = [0u8; 8];
        self.file.read_exact(&mut buf8)?;
        let rec_off = u64::from_le_bytes(buf8);
        if rec_off < HEADER_BYTES || rec_off >= self.dir_offset {
            return Err(CacheError::Corrupt(format!(
                "record offset {rec_off} outside data region"
            )));
        }

        self.file.seek(SeekFrom::Start(rec_off))?;
        let mut buf4 = [0u8; 4];
        self.file.read_exact(&mut buf4)?;
        let frame_len = u32::from_le_bytes(buf4) as usize;
        if frame_len < FIXED_PAYLOAD_BYTES || rec_off + 8 + frame_len as u64 > self.dir_offset {
            return Err(CacheError::Corrupt(format!("bad frame length {frame_len}")));
        }

        let mut payload = vec![0u8; frame_len + 4];
        self.file.read_exact(&mut payload)?;
        let trailing =
            u32::from_le_bytes(payload[frame_len..].try_into().expect("4-byte slice")) as usize;
        if trailing != frame_len {
            return Err(CacheError::Corrupt(
                "frame length mismatch between head and tail".into(),
            ));
        }
        payload.truncate(frame_len);
        Ok(payload)
    }
}

fn corrupt_dir() -> CacheError {
    CacheError::Corrupt("row store directory out of bounds".into())
}

fn encode_payload(row: &LogRow) -> Vec<u8> {
    let ts_raw = &row.ts_raw.as_bytes()[..row.ts_raw.len().min(u16::MAX as usize)];
    let tag = &row.tag.as_bytes()[..row.tag.len().min(u16::MAX as usize)];
    let msg = row.msg.as_bytes();

    let mut out = Vec::with_capacity(FIXED_PAYLOAD_BYTES + ts_raw.len() + tag.len() + msg.len());
    out.extend_from_slice(&row.byte_offset.to_le_bytes());
    out.extend_from_slice(&row.ts_epoch_ms.unwrap_or(NO_TS).to_le_bytes());
    out.push(row.level.as_byte());
    out.extend_from_slice(&(row.pid as u32).to_le_bytes());
    out.extend_from_slice(&(row.tid as u32).to_le_bytes());
    out.extend_from_slice(&(ts_raw.len() as u16).to_le_bytes());
    out.extend_from_slice(&(tag.len() as u16).to_le_bytes());
    out.extend_from_slice(&(msg.len() as u32).to_le_bytes());
    out.extend_from_slice(ts_raw);
    out.extend_from_slice(tag);
    out.extend_from_slice(msg);
    out
}

struct PayloadHead {
    byte_offset: u64,
    ts_epoch_ms: Option<i64>,
    level: Level,
    pid: i32,
    tid: i32,
    ts_raw_len: usize,
    tag_len: usize,
    msg_len: usize,
}

fn decode_head(payload: &[u8]) -> Result<PayloadHead, CacheError> {
    if payload.len() < FIXED_PAYLOAD_BYTES {
        return Err(CacheError::Corrupt("payload shorter than fixed head".into()));
    }
    let byte_offset = u64::from_le_bytes(payload[0..8].try_into().expect("8-byte slice"));
    let ts = i64::from_le_bytes(payload[8..16].try_into().expect("8-byte slice"));
    let level = Level::from_byte(payload[16])
        .ok_or_else(|| CacheError::Corrupt(format!("invalid level byte {}", payload[16])))?;
    let pid = u32::from_le_bytes(payload[17..21].try_into().expect("4-byte slice")) as i32;
    let tid = u32::from_le_bytes(payload[21..25].try_into().expect("4-byte slice")) as i32;
    let ts_raw_len = u16::from_le_bytes(payload[25..27].try_into().expect("2-byte slice")) as usize;
    let tag_len = u16::from_le_bytes(payload[27..29].try_into().expect("2-byte slice")) as usize;
    let msg_len = u32::from_le_bytes(payload[29..33].try_into().expect("4-byte slice")) as usize;

    if FIXED_PAYLOAD_BYTES + ts_raw_len + tag_len + msg_len != payload.len() {
        return Err(CacheError::Corrupt("payload length fields disagree".into()));
    }
    Ok(PayloadHead {
        byte_offset,
        ts_epoch_ms: (ts != NO_TS).then_some(ts),
        level,
        pid,
        tid,
        ts_raw_len,
        tag_len,
        msg_len,
    })
}

fn decode_meta(payload: &[u8]) -> Result<RowMeta, CacheError> {
    let head = decode_head(payload)?;
    let ts_raw_end = FIXED_PAYLOAD_BYTES + head.ts_raw_len;
    let tag_end = ts_raw_end + head.tag_len;
    Ok(RowMeta {
        byte_offset: head.byte_offset,
        ts_epoch_ms: head.ts_epoch_ms,
        level: head.level,
        pid: head.pid,
        tid: head.tid,
        ts_raw: String::from_utf8_lossy(&payload[FIXED_PAYLOAD_BYTES..ts_raw_end]).into_owned(),
        tag: String::from_utf8_lossy(&payload[ts_raw_end..tag_end]).into_owned(),
    })
}

fn decode_row(payload: &[u8]) -> Result<LogRow, CacheError> {
    let head = decode_head(payload)?;
    let ts_raw_end = FIXED_PAYLOAD_BYTES + head.ts_raw_len;
    let tag_end = ts_raw_end + head.tag_len;
    let msg_end = tag_end + head.msg_len;
    Ok(LogRow {
        byte_offset: head.byte_offset,
        ts_raw: String::from_utf8_lossy(&payload[FIXED_PAYLOAD_BYTES..ts_raw_end]).into_owned(),
        ts_epoch_ms: head.ts_epoch_ms,
        level: head.level,
        pid: head.pid,
        tid: head.tid,
        tag: String::from_utf8_lossy(&payload[ts_raw_end..tag_end]).into_owned(),
        msg: String::from_utf8_lossy(&payload[tag_end..msg_end]).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(i: u64) -> LogRow {
        LogRow {
            byte_offset: i * 100,
            ts_raw: format!("08-24 14:22:{:02}.000", i % 60),
            ts_epoch_ms: Some(1_724_480_000_000 + i as i64),
            level: if i % 2 == 0 { Level::I } else { Level::E },
            tag: format!("Tag{}", i % 3),
            pid: 1000 + i as i32,
            tid: 2000 + i as i32,
            msg: format!("message number {i}"),
        }
    }

    fn build_store(dir: &Path, n: u64) -> std::path::PathBuf {
        let path = dir.join("rows");
        let mut w = RowWriter::create(&path).unwrap();
        for i in 0..n {
            assert_eq!(w.append(&sample_row(i)).unwrap(), i);
        }
        assert_eq!(w.finish().unwrap(), n);
        path
    }

    #[test]
    fn round_trips_rows_by_ordinal() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_store(dir.path(), 50);
        let mut r = RowReader::open(&path).unwrap();
        assert_eq!(r.len(), 50);
        for i in [0u64, 1, 25, 49] {
            assert_eq!(r.get(i).unwrap(), sample_row(i));
        }
        // Arbitrary-order access works too.
        assert_eq!(r.get(10).unwrap(), sample_row(10));
        assert_eq!(r.get(3).unwrap(), sample_row(3));
    }

    #[test]
    fn meta_skips_message_but_keeps_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_store(dir.path(), 5);
        let mut r = RowReader::open(&path).unwrap();
        let meta = r.get_meta(2).unwrap();
        let full = sample_row(2);
        assert_eq!(meta.byte_offset, full.byte_offset);
        assert_eq!(meta.ts_epoch_ms, full.ts_epoch_ms);
        assert_eq!(meta.level, full.level);
        assert_eq!(meta.pid, full.pid);
        assert_eq!(meta.tag, full.tag);
        assert_eq!(meta.ts_raw, full.ts_raw);
    }

    #[test]
    fn absent_timestamp_survives_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows");
        let mut w = RowWriter::create(&path).unwrap();
        let mut row = sample_row(0);
        row.ts_epoch_ms = None;
        w.append(&row).unwrap();
        w.finish().unwrap();
        let mut r = RowReader::open(&path).unwrap();
        assert_eq!(r.get(0).unwrap().ts_epoch_ms, None);
    }

    #[test]
    fn out_of_range_ordinal_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_store(dir.path(), 3);
        let mut r = RowReader::open(&path).unwrap();
        assert!(r.get(3).is_err());
    }

    #[test]
    fn truncated_store_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_store(dir.path(), 10);
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 9]).unwrap();
        assert!(matches!(
            RowReader::open(&path),
            Err(CacheError::Corrupt(_))
        ));
    }

    #[test]
    fn flipped_magic_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_store(dir.path(), 1);
        let mut data = std::fs::read(&path).unwrap();
        data[0] = b'X';
        std::fs::write(&path, &data).unwrap();
        assert!(matches!(
            RowReader::open(&path),
            Err(CacheError::Corrupt(_))
        ));
    }

    #[test]
    fn empty_store_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_store(dir.path(), 0);
        let r = RowReader::open(&path).unwrap();
        assert!(r.is_empty());
    }
}
