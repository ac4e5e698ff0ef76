//! Traffic record source.
//!
//! Records come from a delimited text file with a header row. Columns are
//! located by name, so extra columns and any column order are accepted.
//! Missing or empty fields become `None` rather than errors, and bytes
//! that are not valid UTF-8 are decoded lossily. Only the absence of the
//! file is fatal up front; an I/O error mid-stream ends the stream and is
//! reported through [`RecordSource::failure`].

use crate::config::InputConfig;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors opening a record source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("input file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to read input {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("input has no header row")]
    MissingHeader,

    #[error("failed to read input at line {line}: {source}")]
    Read {
        line: usize,
        #[source]
        source: io::Error,
    },
}

/// A stream of traffic records that can tell a clean end from an aborted one.
pub trait RecordSource: Iterator<Item = TrafficRecord> {
    /// The error that ended the stream early, if any.
    fn failure(&self) -> Option<&SourceError> {
        None
    }
}

impl RecordSource for std::vec::IntoIter<TrafficRecord> {}

/// One input row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrafficRecord {
    pub ip: Option<String>,
    pub zone: Option<String>,
    pub path: Option<String>,
}

impl TrafficRecord {
    /// Build a record, treating blank fields as missing.
    pub fn new(ip: Option<&str>, zone: Option<&str>, path: Option<&str>) -> Self {
        Self {
            ip: non_blank(ip).map(|s| s.trim().to_string()),
            zone: non_blank(zone).map(|s| s.trim().to_string()),
            path: non_blank(path).map(str::to_string),
        }
    }
}

fn non_blank(field: Option<&str>) -> Option<&str> {
    field.filter(|s| !s.trim().is_empty())
}

/// Column names of the fields the pipeline needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub ip: String,
    pub zone: String,
    pub path: String,
    pub delimiter: char,
}

impl From<&InputConfig> for ColumnMapping {
    fn from(config: &InputConfig) -> Self {
        Self {
            ip: config.ip_column.clone(),
            zone: config.zone_column.clone(),
            path: config.path_column.clone(),
            delimiter: config.delimiter,
        }
    }
}

impl Default for ColumnMapping {
    fn default() -> Self {
        ColumnMapping::from(&InputConfig::default())
    }
}

/// Lazy, single-pass reader of traffic records.
pub struct CsvRecordSource<R> {
    reader: R,
    buf: Vec<u8>,
    delimiter: char,
    headers: Vec<String>,
    ip_idx: Option<usize>,
    zone_idx: Option<usize>,
    path_idx: Option<usize>,
    line_no: usize,
    done: bool,
    failure: Option<SourceError>,
}

impl CsvRecordSource<BufReader<File>> {
    /// Open `path`. A missing file is reported before any record is read.
    pub fn open(path: &Path, mapping: ColumnMapping) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SourceError::NotFound {
                path: path.to_path_buf(),
            },
            _ => SourceError::Io {
                path: path.to_path_buf(),
                source: e,
            },
        })?;

        Self::from_reader(BufReader::new(file), mapping).map_err(|e| match e {
            SourceError::Io { source, .. } => SourceError::Io {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }
}

impl<R: BufRead> CsvRecordSource<R> {
    /// Read the header row from `reader` and locate the mapped columns.
    pub fn from_reader(mut reader: R, mapping: ColumnMapping) -> Result<Self, SourceError> {
        let mut buf = Vec::new();
        let mut line_no = 0;
        let header_line = loop {
            match read_line(&mut reader, &mut buf) {
                Ok(Some(line)) => {
                    line_no += 1;
                    if !line.trim().is_empty() {
                        break line;
                    }
                }
                Ok(None) => return Err(SourceError::MissingHeader),
                Err(source) => {
                    return Err(SourceError::Io {
                        path: PathBuf::new(),
                        source,
                    })
                }
            }
        };

        let headers: Vec<String> = split_fields(header_line.trim_start_matches('\u{feff}'), mapping.delimiter)
            .into_iter()
            .map(|h| h.trim().to_string())
            .collect();
        debug!(headers = ?headers, "Input headers");

        let find = |name: &str| {
            let idx = headers.iter().position(|h| h == name);
            if idx.is_none() {
                warn!(column = %name, "Input is missing column, field will be empty");
            }
            idx
        };
        let ip_idx = find(&mapping.ip);
        let zone_idx = find(&mapping.zone);
        let path_idx = find(&mapping.path);

        Ok(Self {
            reader,
            buf,
            delimiter: mapping.delimiter,
            headers,
            ip_idx,
            zone_idx,
            path_idx,
            line_no,
            done: false,
            failure: None,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

impl<R: BufRead> RecordSource for CsvRecordSource<R> {
    fn failure(&self) -> Option<&SourceError> {
        self.failure.as_ref()
    }
}

impl<R: BufRead> Iterator for CsvRecordSource<R> {
    type Item = TrafficRecord;

    fn next(&mut self) -> Option<TrafficRecord> {
        if self.done {
            return None;
        }

        loop {
            let line = match read_line(&mut self.reader, &mut self.buf) {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(source) => {
                    let line = self.line_no + 1;
                    warn!(line, error = %source, "Failed to read input, stopping");
                    self.failure = Some(SourceError::Read { line, source });
                    self.done = true;
                    return None;
                }
            };
            self.line_no += 1;

            if line.trim().is_empty() {
                continue;
            }

            let fields = split_fields(&line, self.delimiter);
            let get = |idx: Option<usize>| idx.and_then(|i| fields.get(i)).map(String::as_str);

            return Some(TrafficRecord::new(
                get(self.ip_idx),
                get(self.zone_idx),
                get(self.path_idx),
            ));
        }
    }
}

/// Read one line without its terminator, decoding invalid UTF-8 lossily.
/// Returns `Ok(None)` at end of input.
fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<String>> {
    buf.clear();
    if reader.read_until(b'\n', buf)? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

/// Split one line into fields, honouring double-quoted fields and `""`
/// escapes inside them.
fn split_fields(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(c);
            }
        } else if c == '"' && current.is_empty() {
            in_quotes = true;
        } else if c == delimiter {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    fields.push(current);

    fields
}
