//! CSV dialect and header detection.
//!
//! Works on a sample of at most [`SAMPLE_SIZE`] bytes from the start of the
//! file. The delimiter is the candidate whose per-line count (outside quoted
//! sections) is the same non-zero value on at least
//! [`CONSISTENCY_THRESHOLD`] of the sampled lines. The header is detected by
//! column type voting: a first row whose cells look unlike the rows below
//! it is a header.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::error::{CsvValidationError, Result, SyncError};

/// Bytes read from the file start for sniffing.
pub const SAMPLE_SIZE: usize = 1024 * 1024;

/// Fraction of lines that must agree on the delimiter count.
pub const CONSISTENCY_THRESHOLD: f64 = 0.9;

/// Candidate delimiters, in order of preference on ties.
const DELIMITERS: &[u8] = b",\t;|:";

const QUOTES: &[u8] = b"\"'";

/// Data rows inspected for header detection.
const HEADER_SAMPLE_ROWS: usize = 20;

/// Detected dialect plus the header row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvProfile {
    pub delimiter: u8,
    pub quote_char: u8,
    pub header: Vec<String>,
}

impl CsvProfile {
    /// Reader over data rows (the header is consumed as headers).
    pub fn reader_builder(&self) -> csv::ReaderBuilder {
        let mut builder = csv::ReaderBuilder::new();
        builder
            .delimiter(self.delimiter)
            .quote(self.quote_char)
            .has_headers(true)
            .flexible(true);
        builder
    }

    pub fn writer_builder(&self) -> csv::WriterBuilder {
        let mut builder = csv::WriterBuilder::new();
        builder
            .delimiter(self.delimiter)
            .quote(self.quote_char)
            .flexible(true);
        builder
    }
}

/// Analyze the file at `path`.
pub fn analyze(path: &Path) -> Result<CsvProfile> {
    let sample = read_sample(path).map_err(|e| SyncError::from_io_error(e, "sampling", path))?;
    analyze_sample(&sample).map_err(|e| SyncError::csv(path, e))
}

/// Read up to [`SAMPLE_SIZE`] bytes, dropping a trailing partial line when
/// the file is longer than the sample.
fn read_sample(path: &Path) -> io::Result<String> {
    let mut buf = Vec::with_capacity(8 * 1024);
    File::open(path)?
        .take(SAMPLE_SIZE as u64)
        .read_to_end(&mut buf)?;

    if buf.len() == SAMPLE_SIZE {
        if let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') {
            buf.truncate(last_newline + 1);
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Detect dialect and header from an in-memory sample.
pub fn analyze_sample(sample: &str) -> Result<CsvProfile, CsvValidationError> {
    let (delimiter, quote_char) = sniff_dialect(sample).ok_or(CsvValidationError::NoDialect)?;
    let rows = sample_rows(sample, delimiter, quote_char, HEADER_SAMPLE_ROWS + 1);

    if !has_header(&rows) {
        return Err(CsvValidationError::NoHeader);
    }

    let header: Vec<String> = rows
        .first()
        .map(|row| row.iter().map(|cell| cell.trim().to_string()).collect())
        .unwrap_or_default();
    if header.iter().all(|cell| cell.is_empty()) {
        return Err(CsvValidationError::EmptyHeader);
    }

    Ok(CsvProfile {
        delimiter,
        quote_char,
        header,
    })
}

fn sample_lines(sample: &str) -> Vec<&str> {
    sample
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .collect()
}

/// Guess `(delimiter, quote_char)`, or `None` when no candidate is consistent.
pub fn sniff_dialect(sample: &str) -> Option<(u8, u8)> {
    let lines = sample_lines(sample);
    if lines.is_empty() {
        return None;
    }
    let quote = guess_quote(&lines);

    let mut best: Option<(u8, f64)> = None;
    for &delimiter in DELIMITERS {
        let mut frequencies: HashMap<usize, usize> = HashMap::new();
        for line in &lines {
            *frequencies.entry(count_outside_quotes(line, delimiter, quote)).or_default() += 1;
        }
        let Some((&mode, &hits)) = frequencies
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        else {
            continue;
        };
        if mode == 0 {
            continue;
        }
        let consistency = hits as f64 / lines.len() as f64;
        if consistency < CONSISTENCY_THRESHOLD {
            continue;
        }
        // Strictly better only, so earlier candidates win ties.
        if best.map_or(true, |(_, c)| consistency > c) {
            best = Some((delimiter, consistency));
        }
    }

    best.map(|(delimiter, _)| (delimiter, quote))
}

/// The quote character that most often opens a field.
fn guess_quote(lines: &[&str]) -> u8 {
    let mut best = (b'"', 0usize);
    for &quote in QUOTES {
        let opens = lines
            .iter()
            .map(|line| {
                let bytes = line.as_bytes();
                bytes
                    .iter()
                    .enumerate()
                    .filter(|&(i, &b)| {
                        b == quote && (i == 0 || DELIMITERS.contains(&bytes[i - 1]))
                    })
                    .count()
            })
            .sum::<usize>();
        if opens > best.1 {
            best = (quote, opens);
        }
    }
    best.0
}

fn count_outside_quotes(line: &str, delimiter: u8, quote: u8) -> usize {
    let mut in_quotes = false;
    let mut count = 0;
    for &b in line.as_bytes() {
        if b == quote {
            in_quotes = !in_quotes;
        } else if b == delimiter && !in_quotes {
            count += 1;
        }
    }
    count
}

fn sample_rows(sample: &str, delimiter: u8, quote: u8, limit: usize) -> Vec<Vec<String>> {
    csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .quote(quote)
        .has_headers(false)
        .flexible(true)
        .from_reader(sample.as_bytes())
        .records()
        .filter_map(|r| r.ok())
        .take(limit)
        .map(|record| record.iter().map(str::to_string).collect())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellType {
    Integer,
    Float,
    /// Non-numeric text of the given length in characters.
    Text(usize),
}

impl CellType {
    fn of(value: &str) -> Self {
        let value = value.trim();
        if value.parse::<i64>().is_ok() {
            CellType::Integer
        } else if value.parse::<f64>().is_ok() {
            CellType::Float
        } else {
            CellType::Text(value.chars().count())
        }
    }

    /// Combine two observations of one column; `None` means inconsistent.
    fn unify(self, other: CellType) -> Option<CellType> {
        use CellType::*;
        match (self, other) {
            (a, b) if a == b => Some(a),
            (Integer, Float) | (Float, Integer) => Some(Float),
            _ => None,
        }
    }

    fn is_numeric(self) -> bool {
        matches!(self, CellType::Integer | CellType::Float)
    }
}

/// Vote on whether `rows[0]` is a header.
///
/// Every column whose data cells share one type casts a vote: +1 when the
/// first-row cell differs from that type (or length, for text), -1 when it
/// matches. Rows whose width differs from the first row are ignored. With
/// no data rows at all the first row is taken as a header.
fn has_header(rows: &[Vec<String>]) -> bool {
    let Some((header, data)) = rows.split_first() else {
        return false;
    };
    let data: Vec<&Vec<String>> = data.iter().filter(|r| r.len() == header.len()).collect();
    if data.is_empty() {
        return !header.is_empty();
    }

    let mut votes: i64 = 0;
    for (col, head) in header.iter().enumerate() {
        let mut column_type: Option<Option<CellType>> = None;
        for row in &data {
            let cell = &row[col];
            if cell.trim().is_empty() {
                continue;
            }
            let observed = CellType::of(cell);
            column_type = Some(match column_type {
                None => Some(observed),
                Some(Some(current)) => current.unify(observed),
                Some(None) => None,
            });
        }

        match column_type {
            Some(Some(CellType::Text(len))) => {
                if head.trim().chars().count() != len {
                    votes += 1;
                } else {
                    votes -= 1;
                }
            }
            Some(Some(t)) if t.is_numeric() => {
                if CellType::of(head).is_numeric() {
                    votes -= 1;
                } else {
                    votes += 1;
                }
            }
            _ => {}
        }
    }
    votes > 0
}

/// Compare a file header with the known table columns.
pub fn check_header(expected: &[String], found: &[String]) -> Result<(), CsvValidationError> {
    if expected == found {
        Ok(())
    } else {
        Err(CsvValidationError::HeaderMismatch {
            expected: expected.to_vec(),
            found: found.to_vec(),
        })
    }
}

/// Number of data rows (header excluded, blank lines ignored) in the file.
pub fn count_data_rows(path: &Path, profile: &CsvProfile) -> Result<u64> {
    let mut reader = profile
        .reader_builder()
        .from_path(path)
        .map_err(|e| SyncError::from_io_error(e.into(), "opening", path))?;
    let mut record = csv::ByteRecord::new();
    let mut rows = 0u64;
    loop {
        match reader.read_byte_record(&mut record) {
            Ok(true) => rows += 1,
            Ok(false) => break,
            Err(e) => return Err(SyncError::from_io_error(e.into(), "counting rows in", path)),
        }
    }
    Ok(rows)
}
