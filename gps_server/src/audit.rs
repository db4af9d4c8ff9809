use chrono::{DateTime, Local};
use parking_lot::Mutex;
use shared::AuditConfig;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Append-only record of every raw message received from gpsd, one per line,
/// written before any decoding is attempted.
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditLog {
    pub fn open(config: &AuditConfig, started_at: DateTime<Local>) -> io::Result<Self> {
        fs::create_dir_all(&config.directory)?;
        let path = config.directory.join(file_name(config, started_at));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `raw` byte for byte, whether or not it is valid UTF-8.
    pub fn append(&self, raw: &[u8]) -> io::Result<()> {
        let mut line = Vec::with_capacity(raw.len() + 1);
        line.extend_from_slice(raw);
        line.push(b'\n');

        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.sync_data()
    }
}

/// `raw_gps_log.json` becomes `raw_gps_log_20240501_120000.json` when timestamped.
fn file_name(config: &AuditConfig, started_at: DateTime<Local>) -> String {
    if !config.timestamped {
        return config.file_name.clone();
    }
    let stamp = started_at.format("%Y%m%d_%H%M%S");
    match config.file_name.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => format!("{stem}_{stamp}.{extension}"),
        _ => format!("{}_{stamp}", config.file_name),
    }
}
