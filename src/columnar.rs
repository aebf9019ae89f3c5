//! On-disk columnar shard format shared by the unsorted and sorted shard
//! states (C1/C2/C3).
//!
//! Layout: an 8-byte little-endian row count header, followed by `row_count`
//! fixed-framing records. Each record is a 4-byte little-endian length
//! prefix followed by that many bytes of `bincode`-encoded [`CaptureRow`].
//! The length prefixes are what let [`ColumnarReader::read_rows`] seek
//! directly to a row range without deserializing rows outside it: a forward
//! scan from the nearest known offset, not a full-shard decode.

use crate::error::{CdxError, Result};
use crate::model::CaptureRow;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const HEADER_LEN: u64 = 8;

/// Streaming writer for a columnar shard. Call [`write_row`] for each row in
/// order, then [`finish`] to flush and fix up the row-count header.
pub struct ColumnarWriter {
    inner: BufWriter<File>,
    row_count: u64,
}

impl ColumnarWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| CdxError::OutputUnwritable {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut inner = BufWriter::new(file);
        inner
            .write_all(&0u64.to_le_bytes())
            .map_err(|e| CdxError::OutputUnwritable {
                path: path.to_path_buf(),
                source: e,
            })?;
        Ok(Self {
            inner,
            row_count: 0,
        })
    }

    pub fn write_row(&mut self, row: &CaptureRow) -> Result<()> {
        let bytes = bincode::serialize(row)?;
        self.inner.write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.inner.write_all(&bytes)?;
        self.row_count += 1;
        Ok(())
    }

    /// Flushes buffered writes, patches the row-count header, and returns
    /// the final row count. The caller is responsible for the
    /// temp-name-then-rename atomicity discipline (see [`crate::shard_store`]).
    pub fn finish(mut self) -> Result<u64> {
        self.inner.flush()?;
        let mut file = self.inner.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.row_count.to_le_bytes())?;
        file.flush()?;
        Ok(self.row_count)
    }
}

/// Random-access reader over a sealed columnar shard.
pub struct ColumnarReader {
    path: PathBuf,
    row_count: u64,
}

impl ColumnarReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| CdxError::InputUnreadable {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut header = [0u8; 8];
        file.read_exact(&mut header)
            .map_err(|e| CdxError::ArtifactCorrupted {
                path: path.to_path_buf(),
                reason: format!("truncated header: {e}"),
            })?;
        let row_count = u64::from_le_bytes(header);
        Ok(Self {
            path: path.to_path_buf(),
            row_count,
        })
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Reads every row, in order. Used by the converter/sorter/indexer's
    /// full linear scans.
    pub fn read_all(&self) -> Result<Vec<CaptureRow>> {
        self.read_rows(0, self.row_count)
    }

    /// Reads exactly `row_count` rows starting at `row_offset`, without
    /// decoding rows outside that range. This is the primitive the query
    /// engine's materialization step (C7 step 3) uses against a stored
    /// `(shard_id, row_offset, row_count)` run.
    pub fn read_rows(&self, row_offset: u64, row_count: u64) -> Result<Vec<CaptureRow>> {
        if row_offset + row_count > self.row_count {
            return Err(CdxError::ArtifactCorrupted {
                path: self.path.clone(),
                reason: format!(
                    "requested rows [{row_offset}, {}) exceed shard row count {}",
                    row_offset + row_count,
                    self.row_count
                ),
            });
        }
        let file = File::open(&self.path).map_err(|e| CdxError::InputUnreadable {
            path: self.path.clone(),
            source: e,
        })?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(HEADER_LEN))?;

        let mut out = Vec::with_capacity(row_count as usize);
        let mut idx = 0u64;
        let mut len_buf = [0u8; 4];
        while idx < row_offset + row_count {
            reader
                .read_exact(&mut len_buf)
                .map_err(|e| self.corrupted(e))?;
            let len = u32::from_le_bytes(len_buf) as usize;
            if idx < row_offset {
                reader
                    .seek_relative(len as i64)
                    .map_err(|e| self.corrupted(e))?;
            } else {
                let mut buf = vec![0u8; len];
                reader.read_exact(&mut buf).map_err(|e| self.corrupted(e))?;
                let row: CaptureRow = bincode::deserialize(&buf)?;
                out.push(row);
            }
            idx += 1;
        }
        Ok(out)
    }

    /// Self-check used before sealing an artifact into a canonical name and
    /// before the query engine trusts a sorted shard: every declared row
    /// decodes and the declared row count matches the bytes on disk.
    pub fn validate(&self) -> Result<()> {
        let rows = self.read_all()?;
        if rows.len() as u64 != self.row_count {
            return Err(CdxError::ArtifactCorrupted {
                path: self.path.clone(),
                reason: format!(
                    "header row count {} does not match {} decoded rows",
                    self.row_count,
                    rows.len()
                ),
            });
        }
        Ok(())
    }

    fn corrupted(&self, source: io::Error) -> CdxError {
        CdxError::ArtifactCorrupted {
            path: self.path.clone(),
            reason: format!("truncated row stream: {source}"),
        }
    }
}
