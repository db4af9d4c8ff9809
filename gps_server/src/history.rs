use crate::error::HistoryError;
use chrono::{DateTime, Local, TimeDelta};
use parking_lot::Mutex;
use shared::telemetry::PositionReport;
use shared::{HistoryColumn, HistoryConfig};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Rate-gated summary log: at most one CSV row per `min_interval`.
pub struct HistoryLog {
    path: PathBuf,
    columns: Vec<HistoryColumn>,
    min_interval: TimeDelta,
    gate: Mutex<Gate>,
}

struct Gate {
    last_logged_at: Option<DateTime<Local>>,
    writer: csv::Writer<File>,
}

impl HistoryLog {
    /// Opens the history file for appending, writing the header if the file is
    /// new. An existing file must carry exactly the configured header.
    ///
    /// A final row left unterminated by a crash is cut off before appending.
    pub fn open(config: &HistoryConfig) -> Result<Self, HistoryError> {
        let path = config.path.clone();
        let header: Vec<&str> = config.columns.iter().map(|c| c.header()).collect();

        let mut has_content = file_len(&path)? > 0;
        if has_content {
            let dropped = truncate_torn_tail(&path)?;
            if dropped > 0 {
                warn!(
                    name: "history.torn_tail.truncated",
                    path = %path.display(),
                    bytes = dropped,
                    "dropped unterminated last row of history file"
                );
                has_content = file_len(&path)? > 0;
            }
        }
        if has_content {
            check_header(&path, &header)?;
        } else if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if !has_content {
            writer.write_record(&header)?;
            sync(&mut writer)?;
            info!(name: "history.created", path = %path.display(), "created history file");
        }

        Ok(Self {
            path,
            columns: config.columns.clone(),
            min_interval: TimeDelta::seconds(
                i64::try_from(config.min_interval_seconds).unwrap_or(i64::MAX),
            ),
            gate: Mutex::new(Gate {
                last_logged_at: None,
                writer,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a row for `report` unless one was appended less than
    /// `min_interval` before `now`. Returns whether a row was written.
    pub fn maybe_log(
        &self,
        report: &PositionReport,
        now: DateTime<Local>,
    ) -> Result<bool, HistoryError> {
        let mut gate = self.gate.lock();
        if let Some(last_logged_at) = gate.last_logged_at
            && now - last_logged_at < self.min_interval
        {
            return Ok(false);
        }

        let record = self
            .columns
            .iter()
            .map(|&column| format_column(column, report, now));
        gate.writer.write_record(record)?;
        sync(&mut gate.writer)?;
        gate.last_logged_at = Some(now);
        Ok(true)
    }
}

fn sync(writer: &mut csv::Writer<File>) -> io::Result<()> {
    writer.flush()?;
    writer.get_ref().sync_data()
}

fn file_len(path: &Path) -> io::Result<u64> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(metadata.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// Shortens the file to end just after its last `\n`, or to nothing if it has
/// none. Returns how many bytes were removed.
fn truncate_torn_tail(path: &Path) -> io::Result<u64> {
    const CHUNK: u64 = 4096;

    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let len = file.metadata()?.len();
    let mut end = len;
    let mut chunk = vec![0u8; 4096];
    let keep = loop {
        if end == 0 {
            break 0;
        }
        let start = end.saturating_sub(CHUNK);
        // bounded by CHUNK
        #[allow(clippy::cast_possible_truncation)]
        let window = &mut chunk[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(window)?;
        if let Some(i) = window.iter().rposition(|&b| b == b'\n') {
            break start + i as u64 + 1;
        }
        end = start;
    };

    if keep < len {
        file.set_len(keep)?;
        file.sync_data()?;
    }
    Ok(len - keep)
}

fn format_column(column: HistoryColumn, report: &PositionReport, now: DateTime<Local>) -> String {
    match column {
        HistoryColumn::Timestamp => now.format(TIMESTAMP_FORMAT).to_string(),
        HistoryColumn::Latitude => report.latitude.to_string(),
        HistoryColumn::Longitude => report.longitude.to_string(),
        HistoryColumn::Speed => optional(report.speed),
        HistoryColumn::Heading => optional(report.heading),
        HistoryColumn::Epx => optional(report.err_east),
        HistoryColumn::Epy => optional(report.err_north),
        HistoryColumn::Epv => optional(report.err_vertical),
        HistoryColumn::Eps => optional(report.err_speed),
    }
}

fn optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn check_header(path: &Path, expected: &[&str]) -> Result<(), HistoryError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let Some(found) = reader.records().next().transpose()? else {
        return Ok(());
    };

    if found.iter().ne(expected.iter().copied()) {
        return Err(HistoryError::HeaderMismatch {
            path: path.to_path_buf(),
            expected: expected.join(","),
            found: found.iter().collect::<Vec<_>>().join(","),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn config(path: PathBuf, min_interval_seconds: u64) -> HistoryConfig {
        HistoryConfig {
            path,
            min_interval_seconds,
            columns: HistoryColumn::ALL.to_vec(),
        }
    }

    fn report(latitude: f64) -> PositionReport {
        PositionReport {
            latitude,
            longitude: -74.006,
            speed: Some(1.25),
            heading: None,
            err_east: Some(3.0),
            err_north: Some(4.5),
            err_vertical: None,
            err_speed: Some(0.5),
        }
    }

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn new_file_gets_header_and_formatted_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("track.csv");
        let history = HistoryLog::open(&config(path.clone(), 5)).unwrap();

        assert!(history.maybe_log(&report(40.7128), noon()).unwrap());

        assert_eq!(
            lines(&path),
            vec![
                "timestamp,latitude,longitude,speed (m/s),heading (°),epx,epy,epv,eps".to_string(),
                "2024-05-01 12:00:00,40.7128,-74.006,1.25,,3,4.5,,0.5".to_string(),
            ]
        );
    }

    #[test]
    fn burst_within_interval_writes_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.csv");
        let history = HistoryLog::open(&config(path.clone(), 5)).unwrap();

        let start = noon();
        let written = (0..100i64)
            .filter(|&i| {
                let now = start + TimeDelta::milliseconds(i * 10);
                history.maybe_log(&report(10.0), now).unwrap()
            })
            .count();

        assert_eq!(written, 1);
        assert_eq!(lines(&path).len(), 2);
    }

    #[test]
    fn one_row_per_interval_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.csv");
        let history = HistoryLog::open(&config(path.clone(), 5)).unwrap();

        let t0 = noon();
        let logged: Vec<bool> = [0i32, 3, 5, 9, 10, 14]
            .into_iter()
            .map(|s| {
                history
                    .maybe_log(&report(f64::from(s)), t0 + TimeDelta::seconds(i64::from(s)))
                    .unwrap()
            })
            .collect();

        assert_eq!(logged, vec![true, false, true, false, true, false]);
        let rows = lines(&path);
        assert_eq!(rows.len(), 4);
        assert!(rows[1].starts_with("2024-05-01 12:00:00,0,"));
        assert!(rows[2].starts_with("2024-05-01 12:00:05,5,"));
        assert!(rows[3].starts_with("2024-05-01 12:00:10,10,"));
    }

    #[test]
    fn clock_moving_backwards_does_not_reorder_rows() {
        let dir = tempfile::tempdir().unwrap();
        let history = HistoryLog::open(&config(dir.path().join("track.csv"), 5)).unwrap();

        assert!(history.maybe_log(&report(1.0), noon()).unwrap());
        assert!(
            !history
                .maybe_log(&report(2.0), noon() - TimeDelta::seconds(60))
                .unwrap()
        );
    }

    #[test]
    fn reopening_keeps_existing_rows_and_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.csv");
        {
            let history = HistoryLog::open(&config(path.clone(), 5)).unwrap();
            history.maybe_log(&report(1.0), noon()).unwrap();
        }
        let history = HistoryLog::open(&config(path.clone(), 5)).unwrap();
        history
            .maybe_log(&report(2.0), noon() + TimeDelta::seconds(1))
            .unwrap();

        let rows = lines(&path);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows.iter().filter(|r| r.starts_with("timestamp")).count(), 1);
    }

    #[test]
    fn torn_last_row_is_dropped_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.csv");
        fs::write(&path, "timestamp,latitude,longitude\n2024-05-01 12:00:00,40.5,-7").unwrap();

        let history = HistoryLog::open(&HistoryConfig {
            path: path.clone(),
            min_interval_seconds: 5,
            columns: vec![
                HistoryColumn::Timestamp,
                HistoryColumn::Latitude,
                HistoryColumn::Longitude,
            ],
        })
        .unwrap();
        history
            .maybe_log(&report(40.6), noon() + TimeDelta::seconds(60))
            .unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "timestamp,latitude,longitude\n2024-05-01 12:01:00,40.6,-74.006\n"
        );
    }

    #[test]
    fn torn_header_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.csv");
        fs::write(&path, "timestam").unwrap();

        let history = HistoryLog::open(&config(path.clone(), 5)).unwrap();
        history.maybe_log(&report(1.0), noon()).unwrap();

        let rows = lines(&path);
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("timestamp,latitude,"));
        assert!(rows[1].starts_with("2024-05-01 12:00:00,1,"));
    }

    #[test]
    fn terminated_file_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.csv");
        // longer than one scan chunk
        let mut content = String::from("timestamp,latitude,longitude\n");
        for i in 0..500 {
            content.push_str(&format!("2024-05-01 12:00:{:02},{i},-74.006\n", i % 60));
        }
        fs::write(&path, &content).unwrap();

        assert_eq!(truncate_torn_tail(&path).unwrap(), 0);
        assert_eq!(fs::read_to_string(&path).unwrap(), content);
    }

    #[test]
    fn tail_scan_finds_newline_in_an_earlier_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.csv");
        let mut content = b"timestamp\n".to_vec();
        content.extend(std::iter::repeat_n(b'9', 10_000));
        fs::write(&path, &content).unwrap();

        assert_eq!(truncate_torn_tail(&path).unwrap(), 10_000);
        assert_eq!(fs::read(&path).unwrap(), b"timestamp\n");
    }

    #[test]
    fn column_set_is_fixed_for_the_life_of_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.csv");
        HistoryLog::open(&config(path.clone(), 5)).unwrap();

        let narrower = HistoryConfig {
            path,
            min_interval_seconds: 5,
            columns: vec![
                HistoryColumn::Timestamp,
                HistoryColumn::Latitude,
                HistoryColumn::Longitude,
            ],
        };
        assert!(matches!(
            HistoryLog::open(&narrower),
            Err(HistoryError::HeaderMismatch { .. })
        ));
    }

    #[test]
    fn subset_columns_follow_configured_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.csv");
        let history = HistoryLog::open(&HistoryConfig {
            path: path.clone(),
            min_interval_seconds: 10,
            columns: vec![
                HistoryColumn::Timestamp,
                HistoryColumn::Latitude,
                HistoryColumn::Longitude,
            ],
        })
        .unwrap();
        history.maybe_log(&report(40.5), noon()).unwrap();

        assert_eq!(
            lines(&path),
            vec![
                "timestamp,latitude,longitude".to_string(),
                "2024-05-01 12:00:00,40.5,-74.006".to_string(),
            ]
        );
    }

    #[test]
    fn concurrent_producers_cannot_both_pass_the_gate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.csv");
        let history = Arc::new(HistoryLog::open(&config(path.clone(), 5)).unwrap());

        let now = noon();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let history = Arc::clone(&history);
                std::thread::spawn(move || history.maybe_log(&report(1.0), now).unwrap())
            })
            .collect();
        let written = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&w| w)
            .count();

        assert_eq!(written, 1);
        assert_eq!(lines(&path).len(), 2);
    }
}
