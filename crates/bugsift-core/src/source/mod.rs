//! Opening a bugreport path and streaming its logical text.
//!
//! Zip archives are detected by extension or leading magic and spilled to an
//! anonymous temp file first (zip entries are not seekable); flat files are
//! read in place. Either way the consumer sees one thing: lines with their
//! logical byte offsets, from a fixed-size buffered reader.

pub mod sections;

use crate::error::IngestError;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;
use zip::read::ZipArchive;

const READ_BUFFER_SIZE: usize = 64 * 1024;

const ZIP_MAGIC: [u8; 4] = [b'P', b'K', 0x03, 0x04];

/// An opened bugreport: a line stream over the logical (decompressed) text.
#[derive(Debug)]
pub struct BugreportSource {
    reader: BufReader<File>,
    /// Logical size in bytes, for progress percentages.
    total_bytes: u64,
    offset: u64,
    line_buf: Vec<u8>,
}

impl BugreportSource {
    /// Open a flat text dump or an archive containing one.
    pub fn open(path: &Path) -> Result<Self, IngestError> {
        let meta = std::fs::metadata(path)
            .map_err(|_| IngestError::BugreportNotFound(path.to_path_buf()))?;
        if !meta.is_file() {
            return Err(IngestError::BugreportNotFound(path.to_path_buf()));
        }

        if looks_like_zip(path)? {
            Self::open_archive(path)
        } else {
            let file = File::open(path)?;
            Ok(Self::from_file(file, meta.len()))
        }
    }

    fn open_archive(path: &Path) -> Result<Self, IngestError> {
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(file)?;

        let entry_index = select_bugreport_entry(&mut archive).ok_or_else(|| {
            IngestError::UnsupportedFormat("archive contains no bugreport*.txt entry".into())
        })?;

        // Zip entries only implement Read; spill to an unlinked temp file so
        // the rest of the pipeline gets a plain seekable stream.
        let mut entry = archive.by_index(entry_index)?;
        debug!(entry = entry.name(), size = entry.size(), "selected archive entry");
        let mut spill = tempfile::tempfile()?;
        let total = std::io::copy(&mut entry, &mut spill)?;
        spill.seek(SeekFrom::Start(0))?;
        Ok(Self::from_file(spill, total))
    }

    fn from_file(file: File, total_bytes: u64) -> Self {
        Self {
            reader: BufReader::with_capacity(READ_BUFFER_SIZE, file),
            total_bytes,
            offset: 0,
            line_buf: Vec::with_capacity(256),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Rewind to the start of the logical stream. Used after the anchor
    /// pre-sample so the real pass sees every line again.
    pub fn rewind(&mut self) -> Result<(), IngestError> {
        self.reader.seek(SeekFrom::Start(0))?;
        self.offset = 0;
        Ok(())
    }

    /// Read the next line. Yields `(byte_offset, text)` where the offset is
    /// the position of the line's first byte in the logical stream; offsets
    /// are strictly increasing. Invalid UTF-8 is replaced, never fatal.
    pub fn next_line(&mut self) -> Result<Option<(u64, String)>, IngestError> {
        self.line_buf.clear();
        let read = self.reader.read_until(b'\n', &mut self.line_buf)?;
        if read == 0 {
            return Ok(None);
        }
        let start = self.offset;
        self.offset += read as u64;

        let mut end = self.line_buf.len();
        if end > 0 && self.line_buf[end - 1] == b'\n' {
            end -= 1;
        }
        if end > 0 && self.line_buf[end - 1] == b'\r' {
            end -= 1;
        }
        let text = String::from_utf8_lossy(&self.line_buf[..end]).into_owned();
        Ok(Some((start, text)))
    }
}

fn looks_like_zip(path: &Path) -> Result<bool, IngestError> {
    if path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
    {
        return Ok(true);
    }
    let mut head = [0u8; 4];
    let mut file = File::open(path)?;
    match file.read_exact(&mut head) {
        Ok(()) => Ok(head == ZIP_MAGIC),
        Err(_) => Ok(false),
    }
}

/// First entry whose file name matches `bugreport*.txt`, case-insensitive.
fn select_bugreport_entry(archive: &mut ZipArchive<File>) -> Option<usize> {
    for i in 0..archive.len() {
        let entry = archive.by_index(i).ok()?;
        let name = entry.name().rsplit('/').next().unwrap_or("").to_ascii_lowercase();
        if name.starts_with("bugreport") && name.ends_with(".txt") {
            return Some(i);
        }
    }
    None
}
