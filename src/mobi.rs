//! EXTH metadata surgery on Kindle containers.
//!
//! `ebook-convert` output carries placeholder identity records. Kindle
//! firmware only pairs a sideloaded file with its cover thumbnail when the
//! ASIN records match the thumbnail filename and the CDE type reads `EBOK`,
//! so those records are rewritten in place. Record 0 keeps its exact length
//! through every edit and the record directory is never rewritten.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};

/// ASIN as shown in the Kindle store.
pub const EXTH_ASIN: u32 = 113;
/// CDE document type, `EBOK` for store books.
pub const EXTH_CDE_TYPE: u32 = 501;
/// Second ASIN slot read by newer firmware.
pub const EXTH_ASIN_ALT: u32 = 504;

/// One entry in the palm database record directory, 8 bytes on disk.
#[derive(Debug, Clone, Copy)]
pub struct RecordEntry {
    pub offset: u32,
    pub attributes: u8,
    /// Three bytes on disk.
    pub unique_id: u32,
}

/// Palm database container with its parsed record directory.
#[derive(Debug)]
pub struct PdbContainer {
    data: Vec<u8>,
    entries: Vec<RecordEntry>,
}

impl PdbContainer {
    /// Parse the record directory: count at byte 76, entries from byte 78.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        if data.len() < 78 {
            return Err(Error::MobiCorruption(
                "palm database header too short".into(),
            ));
        }
        let record_count = u16::from_be_bytes([data[76], data[77]]) as usize;
        let directory_end = 78 + record_count * 8;
        if data.len() < directory_end {
            return Err(Error::MobiCorruption(format!(
                "record directory truncated ({record_count} records)"
            )));
        }
        let mut entries = Vec::with_capacity(record_count);
        for i in 0..record_count {
            let base = 78 + i * 8;
            let offset = u32::from_be_bytes([
                data[base],
                data[base + 1],
                data[base + 2],
                data[base + 3],
            ]);
            if (offset as usize) < directory_end || offset as usize > data.len() {
                return Err(Error::MobiCorruption(format!(
                    "record {i} offset {offset} out of bounds"
                )));
            }
            entries.push(RecordEntry {
                offset,
                attributes: data[base + 4],
                unique_id: u32::from_be_bytes([0, data[base + 5], data[base + 6], data[base + 7]]),
            });
        }
        for pair in entries.windows(2) {
            if pair[0].offset > pair[1].offset {
                return Err(Error::MobiCorruption(
                    "record directory offsets run backwards".into(),
                ));
            }
        }
        Ok(Self { data, entries })
    }

    pub fn record_count(&self) -> usize {
        self.entries.len()
    }

    fn span(&self, index: usize) -> Result<(usize, usize)> {
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| Error::MobiCorruption(format!("record {index} does not exist")))?;
        let start = entry.offset as usize;
        let end = match self.entries.get(index + 1) {
            Some(next) => next.offset as usize,
            None => self.data.len(),
        };
        Ok((start, end))
    }

    pub fn record(&self, index: usize) -> Result<&[u8]> {
        let (start, end) = self.span(index)?;
        Ok(&self.data[start..end])
    }

    /// Overwrite a record in place. The replacement must be exactly as long
    /// as the original slice; a resize would shift every later offset in
    /// the directory, so a mismatch is fatal rather than repairable.
    pub fn replace_record(&mut self, index: usize, bytes: &[u8]) -> Result<()> {
        let (start, end) = self.span(index)?;
        if bytes.len() != end - start {
            return Err(Error::MobiCorruption(format!(
                "record {index} replacement is {} bytes, expected {}",
                bytes.len(),
                end - start
            )));
        }
        self.data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

/// One EXTH record: type and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExthRecord {
    pub rec_type: u32,
    pub payload: Vec<u8>,
}

/// Position of the EXTH block inside record 0.
struct ExthBlock {
    /// Absolute offset of the `EXTH` magic.
    start: usize,
    length: u32,
    record_count: u32,
}

/// Length-preserving editor over record 0's EXTH block.
///
/// Record 0 lays out as a 16-byte PalmDOC section, the MOBI header, the
/// EXTH block, the full title, then NUL padding. Edits shift the title and
/// trade bytes with the padding, never changing the record length. Nothing
/// outside record 0 references positions inside it, so the rest of the
/// container is untouched by construction.
#[derive(Debug)]
pub struct Record0 {
    data: Vec<u8>,
}

impl Record0 {
    pub fn new(bytes: &[u8]) -> Result<Self> {
        let record0 = Self {
            data: bytes.to_vec(),
        };
        record0.exth_block()?;
        Ok(record0)
    }

    fn exth_block(&self) -> Result<ExthBlock> {
        let data = &self.data;
        if data.len() < 24 || &data[16..20] != b"MOBI" {
            return Err(Error::MobiCorruption("record 0 has no MOBI header".into()));
        }
        let header_length = be_u32(data, 20)? as usize;
        let start = 16 + header_length;
        if data.len() < start + 12 || &data[start..start + 4] != b"EXTH" {
            return Err(Error::MobiCorruption(format!(
                "EXTH magic missing at offset {start}"
            )));
        }
        Ok(ExthBlock {
            start,
            length: be_u32(data, start + 4)?,
            record_count: be_u32(data, start + 8)?,
        })
    }

    /// `(start, length, type)` for each record, in block order.
    fn record_spans(&self) -> Result<Vec<(usize, usize, u32)>> {
        let exth = self.exth_block()?;
        let block_end = exth.start + exth.length as usize;
        if block_end > self.data.len() {
            return Err(Error::MobiCorruption(format!(
                "EXTH block length {} overruns record 0",
                exth.length
            )));
        }
        let mut spans = Vec::with_capacity(exth.record_count as usize);
        let mut pos = exth.start + 12;
        for _ in 0..exth.record_count {
            if pos + 8 > block_end {
                return Err(Error::MobiCorruption(
                    "EXTH record count overruns block".into(),
                ));
            }
            let rec_type = be_u32(&self.data, pos)?;
            let rec_len = be_u32(&self.data, pos + 4)? as usize;
            if rec_len < 8 || pos + rec_len > block_end {
                return Err(Error::MobiCorruption(format!(
                    "EXTH record at {pos} has bad length {rec_len}"
                )));
            }
            spans.push((pos, rec_len, rec_type));
            pos += rec_len;
        }
        Ok(spans)
    }

    /// Typed read of every EXTH record.
    pub fn records(&self) -> Result<Vec<ExthRecord>> {
        Ok(self
            .record_spans()?
            .into_iter()
            .map(|(start, len, rec_type)| ExthRecord {
                rec_type,
                payload: self.data[start + 8..start + len].to_vec(),
            })
            .collect())
    }

    /// Splice out every record of the type. Absent types are a no-op.
    pub fn delete(&mut self, rec_type: u32) -> Result<()> {
        let original_len = self.data.len();
        let doomed: Vec<(usize, usize)> = self
            .record_spans()?
            .into_iter()
            .filter(|&(_, _, t)| t == rec_type)
            .map(|(start, len, _)| (start, len))
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }
        let removed: usize = doomed.iter().map(|&(_, len)| len).sum();
        for &(start, len) in doomed.iter().rev() {
            self.data.drain(start..start + len);
        }
        self.adjust_sizes(-(removed as i64), -(doomed.len() as i64))?;
        // Right-pad so the record length is unchanged.
        self.data.resize(original_len, 0);
        debug!(rec_type, removed, "deleted EXTH records");
        Ok(())
    }

    /// Splice a new record in directly after the block header, taking the
    /// room from record 0's NUL tail.
    pub fn insert(&mut self, rec_type: u32, payload: &[u8]) -> Result<()> {
        let original_len = self.data.len();
        let exth = self.exth_block()?;

        let mut record = Vec::with_capacity(8 + payload.len());
        record.extend_from_slice(&rec_type.to_be_bytes());
        record.extend_from_slice(&((8 + payload.len()) as u32).to_be_bytes());
        record.extend_from_slice(payload);
        let added = record.len();

        let keep = original_len.checked_sub(added).ok_or_else(|| {
            Error::MobiCorruption(format!("record 0 too small for a {added}-byte EXTH record"))
        })?;
        if self.data[keep..].iter().any(|&b| b != 0) {
            return Err(Error::MobiCorruption(format!(
                "record 0 tail is not NUL padding, no room for a {added}-byte EXTH record"
            )));
        }
        self.data.truncate(keep);
        self.data.splice(exth.start + 12..exth.start + 12, record);
        self.adjust_sizes(added as i64, 1)?;
        debug!(rec_type, added, "inserted EXTH record");
        Ok(())
    }

    /// Apply a size delta to the EXTH block length, the record count, and
    /// the title offset at record offset 84.
    fn adjust_sizes(&mut self, delta: i64, count_delta: i64) -> Result<()> {
        let exth = self.exth_block()?;
        let length = apply_delta(exth.length, delta, "EXTH block length")?;
        let count = apply_delta(exth.record_count, count_delta, "EXTH record count")?;
        let title_offset = apply_delta(be_u32(&self.data, 84)?, delta, "title offset")?;
        put_u32(&mut self.data, exth.start + 4, length);
        put_u32(&mut self.data, exth.start + 8, count);
        put_u32(&mut self.data, 84, title_offset);
        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

fn be_u32(data: &[u8], at: usize) -> Result<u32> {
    let bytes: [u8; 4] = data
        .get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::MobiCorruption(format!("read past end of record 0 at {at}")))?;
    Ok(u32::from_be_bytes(bytes))
}

fn put_u32(data: &mut [u8], at: usize, value: u32) {
    data[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

fn apply_delta(value: u32, delta: i64, what: &str) -> Result<u32> {
    let adjusted = value as i64 + delta;
    u32::try_from(adjusted)
        .map_err(|_| Error::MobiCorruption(format!("{what} underflows ({value} {delta:+})")))
}

/// Rewrite the identity records so a sideloaded file picks up its store
/// thumbnail: both ASIN slots carry `asin` and the CDE type reads `EBOK`.
/// The output is always exactly as long as the input.
pub fn update_asin(data: Vec<u8>, asin: &str) -> Result<Vec<u8>> {
    let mut pdb = PdbContainer::parse(data)?;
    let mut record0 = Record0::new(pdb.record(0)?)?;
    record0.delete(EXTH_CDE_TYPE)?;
    record0.delete(EXTH_ASIN)?;
    record0.delete(EXTH_ASIN_ALT)?;
    record0.insert(EXTH_ASIN, asin.as_bytes())?;
    record0.insert(EXTH_ASIN_ALT, asin.as_bytes())?;
    record0.insert(EXTH_CDE_TYPE, b"EBOK")?;
    pdb.replace_record(0, &record0.into_bytes())?;
    Ok(pdb.into_inner())
}

/// [`update_asin`] against a file on disk. The patched container is written
/// back only after every edit has succeeded.
pub fn update_asin_file(path: &Path, asin: &str) -> Result<()> {
    let data = fs::read(path)?;
    let patched = update_asin(data, asin)?;
    fs::write(path, patched)?;
    Ok(())
}
