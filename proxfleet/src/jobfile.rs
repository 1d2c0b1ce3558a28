//! The CSV job file: one row per VM, rewritten in place after every action.
//!
//! The file is read once per action and written back once. The delimiter
//! (`;` or `,`) is sniffed from the first 2 KiB, a UTF-8 byte-order mark is
//! tolerated and preserved, and the rewrite goes through a temp file plus
//! rename so a crash never leaves a half-written table behind.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Exact header every job file must carry, in this order.
pub const HEADER: [&str; 13] = [
    "student_name",
    "student_firstname",
    "student_login",
    "target_host",
    "vm_name",
    "template_name",
    "pool",
    "storage",
    "newid",
    "net0",
    "net1",
    "ipv4",
    "status",
];

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const SNIFF_LEN: usize = 2048;

pub const STATUS_CLONED: &str = "cloned";
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_STOPPED: &str = "stopped";
pub const STATUS_ERROR: &str = "error";

#[derive(Debug, thiserror::Error)]
pub enum JobFileError {
    #[error("job file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("job file {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("job file {path}: header mismatch, expected [{}] but found [{}]", HEADER.join(", "), found.join(", "))]
    Header { path: PathBuf, found: Vec<String> },
    #[error("job file {path} has no rows")]
    Empty { path: PathBuf },
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// One provisioning record. Every column is kept as the trimmed text read
/// from the file so that a load/store cycle only changes what an action changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRow {
    pub student_name: String,
    pub student_firstname: String,
    pub student_login: String,
    pub target_host: String,
    pub vm_name: String,
    pub template_name: String,
    pub pool: String,
    pub storage: String,
    pub newid: String,
    pub net0: String,
    pub net1: String,
    pub ipv4: String,
    pub status: String,
}

/// Parsed view of the `newid` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmId {
    Missing,
    Invalid,
    Valid(u32),
}

impl JobRow {
    pub fn vmid(&self) -> VmId {
        if self.newid.is_empty() {
            return VmId::Missing;
        }
        match self.newid.parse::<u32>() {
            Ok(id) if id > 0 => VmId::Valid(id),
            _ => VmId::Invalid,
        }
    }

    /// Either a login or both name and first name.
    pub fn has_identity(&self) -> bool {
        !self.student_login.is_empty()
            || (!self.student_name.is_empty() && !self.student_firstname.is_empty())
    }

    /// VM name from the row, else the login, else name plus first initial.
    pub fn resolved_vm_name(&self) -> Option<String> {
        if !self.vm_name.is_empty() {
            return Some(self.vm_name.clone());
        }
        if !self.student_login.is_empty() {
            return Some(self.student_login.clone());
        }
        let initial = self.student_firstname.chars().next()?;
        if self.student_name.is_empty() {
            return None;
        }
        Some(format!("{}{}", self.student_name, initial))
    }

    /// Short label for logs and summaries.
    pub fn label(&self) -> String {
        self.resolved_vm_name()
            .or_else(|| (!self.newid.is_empty()).then(|| format!("vmid {}", self.newid)))
            .unwrap_or_else(|| "<unnamed>".to_string())
    }

    pub fn wants_network(&self) -> bool {
        !self.net0.is_empty() || !self.net1.is_empty()
    }
}

/// 1-based line of a row in the file; the header is line 1.
pub fn line_of(index: usize) -> usize {
    index + 2
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct JobTable {
    path: PathBuf,
    delimiter: u8,
    bom: bool,
    pub rows: Vec<JobRow>,
}

impl JobTable {
    /// Read and parse the job file. Header mismatch and an empty row set are
    /// errors: no action runs on a table it cannot round-trip.
    pub async fn load(path: &Path) -> Result<Self, JobFileError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| JobFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &bytes)
    }

    fn parse(path: &Path, bytes: &[u8]) -> Result<Self, JobFileError> {
        let (bom, body) = match bytes.strip_prefix(UTF8_BOM) {
            Some(rest) => (true, rest),
            None => (false, bytes),
        };
        if body.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(JobFileError::Empty { path: path.to_path_buf() });
        }
        let delimiter = sniff_delimiter(body);
        let csv_err = |source| JobFileError::Csv { path: path.to_path_buf(), source };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(body);

        let found: Vec<String> = reader
            .headers()
            .map_err(csv_err)?
            .iter()
            .map(str::to_string)
            .collect();
        if found.iter().map(String::as_str).ne(HEADER.iter().copied()) {
            return Err(JobFileError::Header { path: path.to_path_buf(), found });
        }

        let rows = reader
            .deserialize::<JobRow>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(csv_err)?;
        if rows.is_empty() {
            return Err(JobFileError::Empty { path: path.to_path_buf() });
        }

        debug!(
            path = %path.display(),
            rows = rows.len(),
            delimiter = %(delimiter as char),
            bom,
            "loaded job file"
        );
        Ok(Self {
            path: path.to_path_buf(),
            delimiter,
            bom,
            rows,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn render(&self) -> Result<Vec<u8>, JobFileError> {
        let csv_err = |source| JobFileError::Csv { path: self.path.clone(), source };
        let mut out = Vec::new();
        if self.bom {
            out.extend_from_slice(UTF8_BOM);
        }
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .from_writer(out);
        writer.write_record(HEADER).map_err(csv_err)?;
        for row in &self.rows {
            writer.serialize(row).map_err(csv_err)?;
        }
        writer.into_inner().map_err(|e| JobFileError::Io {
            path: self.path.clone(),
            source: e.into_error(),
        })
    }

    /// Write the table back with the delimiter and BOM it was read with.
    pub async fn save(&self) -> Result<(), JobFileError> {
        let data = self.render()?;
        let io_err = |source| JobFileError::Io { path: self.path.clone(), source };

        let tmp_path = self.path.with_extension("csv.tmp");
        tokio::fs::write(&tmp_path, &data).await.map_err(io_err)?;
        tokio::fs::rename(&tmp_path, &self.path).await.map_err(io_err)?;

        debug!(path = %self.path.display(), rows = self.rows.len(), "saved job file");
        Ok(())
    }
}

/// Pick `;` or `,` from the header line in the first 2 KiB, preferring `;`.
fn sniff_delimiter(body: &[u8]) -> u8 {
    let sample = &body[..body.len().min(SNIFF_LEN)];
    let first_line = sample.split(|b| *b == b'\n').next().unwrap_or(sample);
    let count = |d: u8| first_line.iter().filter(|b| **b == d).count();
    if count(b',') > count(b';') {
        b','
    } else {
        b';'
    }
}
