//! Access log with size-based rotation

use chrono::{DateTime, Local, NaiveDateTime};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Timestamp embedded in rotated file names
const BACKUP_STAMP: &str = "%Y-%m-%dT%H-%M-%S%.3f";

/// One line of the access log
#[derive(Debug, Clone)]
pub struct AccessLogEntry {
    pub client: IpAddr,
    pub timestamp: DateTime<Local>,
    pub method: String,
    pub path: String,
    pub query: String,
    pub protocol: String,
    pub status: u16,
    pub bytes: u64,
    pub referrer: String,
    pub user_agent: String,
}

impl fmt::Display for AccessLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] \"{} {} {} {}\" {} {} \"{}\" \"{}\"",
            self.client,
            self.timestamp.format("%d/%b/%Y:%H:%M:%S %z"),
            self.method,
            self.path,
            self.query,
            self.protocol,
            self.status,
            self.bytes,
            self.referrer,
            self.user_agent,
        )
    }
}

/// Appends entries to a file, rotating it once it grows past `max_size`.
///
/// Not synchronized: the traffic worker is the only writer.
#[derive(Debug)]
pub struct AccessLogger {
    path: PathBuf,
    max_size: u64,
    max_backups: usize,
    file: Option<File>,
    size: u64,
}

impl AccessLogger {
    /// `max_backups` of 0 keeps every rotated file.
    pub fn new(path: impl Into<PathBuf>, max_size: u64, max_backups: usize) -> Self {
        Self {
            path: path.into(),
            max_size,
            max_backups,
            file: None,
            size: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry.
    ///
    /// A failed rotation is logged and the entry goes to the current file.
    pub fn write(&mut self, entry: &AccessLogEntry) -> io::Result<()> {
        let line = format!("{}\n", entry);
        let len = line.len() as u64;

        if self.file.is_none() {
            self.open()?;
        }
        if self.max_size > 0 && self.size > 0 && self.size + len > self.max_size {
            if let Err(e) = self.rotate() {
                warn!("Failed to rotate {}: {}", self.path.display(), e);
                if self.file.is_none() {
                    self.open()?;
                }
            }
        }

        let Some(file) = self.file.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::Other, "access log is closed"));
        };
        file.write_all(line.as_bytes())?;
        self.size += len;
        Ok(())
    }

    fn open(&mut self) -> io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.size = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file = None;
        let backup = self.backup_name(Local::now());
        std::fs::rename(&self.path, &backup)?;
        debug!("Rotated access log to {}", backup.display());
        self.open()?;
        self.prune();
        Ok(())
    }

    /// `logs/access.log` -> `logs/access-2024-05-01T10-20-30.123.log`
    fn backup_name(&self, at: DateTime<Local>) -> PathBuf {
        let (stem, ext) = self.name_parts();
        let stamp = at.format(BACKUP_STAMP);
        let name = match ext {
            Some(ext) => format!("{}-{}.{}", stem, stamp, ext),
            None => format!("{}-{}", stem, stamp),
        };
        self.path.with_file_name(name)
    }

    fn name_parts(&self) -> (String, Option<String>) {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "access".to_string());
        let ext = self
            .path
            .extension()
            .map(|e| e.to_string_lossy().into_owned());
        (stem, ext)
    }

    /// Rotated files, oldest first. Only names this logger produces count.
    fn backups(&self) -> io::Result<Vec<PathBuf>> {
        let (stem, ext) = self.name_parts();
        let prefix = format!("{}-", stem);
        let suffix = ext.map(|e| format!(".{}", e)).unwrap_or_default();
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut found: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.strip_prefix(&prefix))
                    .and_then(|n| n.strip_suffix(&suffix))
                    .map(|stamp| NaiveDateTime::parse_from_str(stamp, BACKUP_STAMP).is_ok())
                    .unwrap_or(false)
            })
            .collect();
        // Timestamps sort lexically
        found.sort();
        Ok(found)
    }

    fn prune(&self) {
        if self.max_backups == 0 {
            return;
        }
        let backups = match self.backups() {
            Ok(b) => b,
            Err(e) => {
                warn!("Failed to list access log backups: {}", e);
                return;
            }
        };
        let excess = backups.len().saturating_sub(self.max_backups);
        for old in backups.into_iter().take(excess) {
            if let Err(e) = std::fs::remove_file(&old) {
                warn!("Failed to remove {}: {}", old.display(), e);
            }
        }
    }
}
