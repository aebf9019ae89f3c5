//! C2: decodes one raw gzipped CDX text shard into an unsorted columnar
//! shard, per spec section 4.2.
//!
//! Each input line is `<surt-url> <14-digit-timestamp> <json>`, where the
//! trailing JSON object carries `url`, `filename`, `offset`, `length` (the
//! leading SURT token is redundant with `url` and is not stored).

use crate::error::{CdxError, Result};
use crate::model::{host_of, reverse_host, CaptureRow};
use flate2::read::GzDecoder;
use serde::Deserialize;
use std::io::{BufRead, BufReader};
use std::path::Path;

#[derive(Deserialize)]
struct CdxJson {
    url: String,
    filename: String,
    offset: StringOrInt,
    length: StringOrInt,
}

/// CDX JSON encodes these as strings in practice but the format is not
/// strict about it; accept either.
#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrInt {
    S(String),
    U(u64),
}

impl StringOrInt {
    fn as_u64(&self) -> Option<u64> {
        match self {
            StringOrInt::U(n) => Some(*n),
            StringOrInt::S(s) => s.parse().ok(),
        }
    }
}

pub struct ConversionReport {
    pub rows_written: u64,
    pub lines_malformed: u64,
    pub lines_total: u64,
}

/// Streams `raw_path` (gzip CDX text), parsing each line into a
/// [`CaptureRow`] and calling `emit` in input order. Peak memory is bounded
/// by whatever `emit` buffers, not by this function (it never materializes
/// the whole shard). Malformed lines are counted, not collected; the
/// conversion fails only when the malformed fraction exceeds `threshold`.
pub fn convert_shard(
    raw_path: &Path,
    threshold: f64,
    mut emit: impl FnMut(CaptureRow) -> Result<()>,
) -> Result<ConversionReport> {
    let file = std::fs::File::open(raw_path).map_err(|e| CdxError::InputUnreadable {
        path: raw_path.to_path_buf(),
        source: e,
    })?;
    let reader = BufReader::new(GzDecoder::new(file));

    let mut rows_written = 0u64;
    let mut lines_malformed = 0u64;
    let mut lines_total = 0u64;

    for line in reader.lines() {
        let line = line.map_err(|e| CdxError::InputUnreadable {
            path: raw_path.to_path_buf(),
            source: e,
        })?;
        lines_total += 1;
        if line.trim().is_empty() {
            continue;
        }
        match parse_cdx_line(&line) {
            Some(row) => {
                emit(row)?;
                rows_written += 1;
            }
            None => lines_malformed += 1,
        }
    }

    if lines_total > 0 {
        let rate = lines_malformed as f64 / lines_total as f64;
        if rate > threshold {
            return Err(CdxError::MalformedRateExceeded {
                path: raw_path.to_path_buf(),
                rate,
                threshold,
            });
        }
    }

    Ok(ConversionReport {
        rows_written,
        lines_malformed,
        lines_total,
    })
}

/// Parses one CDX line into a [`CaptureRow`], returning `None` for any
/// structurally malformed line rather than erroring — malformed lines are
/// tolerated up to the configured threshold, not fatal individually.
fn parse_cdx_line(line: &str) -> Option<CaptureRow> {
    let mut parts = line.splitn(3, ' ');
    let _surt = parts.next()?;
    let timestamp = parts.next()?;
    let json = parts.next()?;
    if timestamp.len() != 14 || !timestamp.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let parsed: CdxJson = serde_json::from_str(json).ok()?;
    let host = host_of(&parsed.url)?;
    let warc_offset = parsed.offset.as_u64()?;
    let warc_length = parsed.length.as_u64()?;
    if warc_length == 0 {
        return None;
    }

    Some(CaptureRow {
        host_reversed: reverse_host(&host),
        host,
        url: parsed.url,
        timestamp: timestamp.to_string(),
        warc_filename: parsed.filename,
        warc_offset,
        warc_length,
    })
}
