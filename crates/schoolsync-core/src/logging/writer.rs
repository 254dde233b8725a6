//! Append-only journal files and reading them back

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::warn;

use super::entry::JournalEntry;

const RAW_DIR: &str = "raw";

/// The day file currently being appended to
struct DayFile {
    date: String,
    path: PathBuf,
    file: BufWriter<File>,
}

impl DayFile {
    fn open(raw_dir: &Path, date: &str, device: &str) -> io::Result<Self> {
        let path = raw_dir.join(format!("{}_{}.jsonl", date, device));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            date: date.to_string(),
            path,
            file: BufWriter::new(file),
        })
    }
}

/// Appends entries to `<logs_dir>/raw/<date>_<device>.jsonl`, moving to a
/// new file when an entry's date differs from the open one
pub struct JournalWriter {
    device: String,
    raw_dir: PathBuf,
    current: Mutex<DayFile>,
}

impl JournalWriter {
    pub fn new(logs_dir: impl AsRef<Path>, device: impl Into<String>) -> io::Result<Self> {
        let device = device.into();
        let raw_dir = logs_dir.as_ref().join(RAW_DIR);
        fs::create_dir_all(&raw_dir)?;

        let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let current = DayFile::open(&raw_dir, &date, &device)?;

        Ok(Self {
            device,
            raw_dir,
            current: Mutex::new(current),
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// File the next entry for the current day goes to
    pub fn path(&self) -> PathBuf {
        self.current.lock().path.clone()
    }

    /// Append one entry and flush, so a crash loses at most the current line
    pub fn append(&self, entry: &JournalEntry) -> io::Result<()> {
        let line = entry
            .to_line()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let date = match chrono::NaiveDate::parse_from_str(entry.date(), "%Y-%m-%d") {
            Ok(_) => entry.date().to_string(),
            Err(_) => chrono::Utc::now().format("%Y-%m-%d").to_string(),
        };

        let mut current = self.current.lock();
        if current.date != date {
            current.file.flush()?;
            *current = DayFile::open(&self.raw_dir, &date, &self.device)?;
        }
        writeln!(current.file, "{}", line)?;
        current.file.flush()
    }
}

impl Drop for JournalWriter {
    fn drop(&mut self) {
        let _ = self.current.lock().file.flush();
    }
}

/// Which journal entries to return
#[derive(Debug, Clone, Default)]
pub struct JournalFilter {
    /// `YYYY-MM-DD`
    pub date: Option<String>,
    /// Minimum level (`trace` < `debug` < `info` < `warn` < `error`)
    pub min_level: Option<String>,
    pub key: Option<String>,
    /// Keep only the newest N entries
    pub limit: Option<usize>,
}

impl JournalFilter {
    fn matches(&self, entry: &JournalEntry) -> bool {
        if let Some(date) = &self.date {
            if entry.date() != date {
                return false;
            }
        }
        if let Some(min) = &self.min_level {
            if level_rank(&entry.level) < level_rank(min) {
                return false;
            }
        }
        if let Some(key) = &self.key {
            if entry.key.as_deref() != Some(key.as_str()) {
                return false;
            }
        }
        true
    }
}

fn level_rank(level: &str) -> u8 {
    match level.to_ascii_lowercase().as_str() {
        "trace" => 0,
        "debug" => 1,
        "info" => 2,
        "warn" => 3,
        "error" => 4,
        _ => 2,
    }
}

/// Read journal entries from every device file, oldest first.
///
/// Unparseable lines are skipped with a warning.
pub fn read_journal(logs_dir: impl AsRef<Path>, filter: &JournalFilter) -> io::Result<Vec<JournalEntry>> {
    let raw_dir = logs_dir.as_ref().join(RAW_DIR);
    if !raw_dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for dir_entry in fs::read_dir(&raw_dir)? {
        let path = dir_entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".jsonl") {
            continue;
        }
        if let Some(date) = &filter.date {
            if !name.starts_with(date.as_str()) {
                continue;
            }
        }

        for line in fs::read_to_string(&path)?.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match JournalEntry::from_line(line) {
                Ok(entry) if filter.matches(&entry) => entries.push(entry),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping bad journal line"),
            }
        }
    }

    entries.sort_by(|a, b| a.ts.cmp(&b.ts));
    if let Some(limit) = filter.limit {
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
    }
    Ok(entries)
}
