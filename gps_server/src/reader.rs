use crate::audit::AuditLog;
use crate::error::{StorageError, StreamError};
use crate::history::HistoryLog;
use chrono::{DateTime, Local, Utc};
use shared::GpsdConfig;
use shared::gpsd::{self, Message, WATCH_COMMAND};
use shared::telemetry::{InvalidReport, PositionReport, TelemetryCache};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    Empty,
    Malformed,
    /// Decoded, but not a position report.
    Ignored,
    Invalid(InvalidReport),
    Accepted {
        logged: bool,
    },
}

/// Turns raw gpsd lines into cache updates and history rows. The sole writer
/// of the telemetry cache.
#[derive(Clone)]
pub struct StreamReader {
    cache: TelemetryCache,
    audit: Arc<AuditLog>,
    history: Arc<HistoryLog>,
}

impl StreamReader {
    pub fn new(cache: TelemetryCache, audit: Arc<AuditLog>, history: Arc<HistoryLog>) -> Self {
        Self {
            cache,
            audit,
            history,
        }
    }

    pub fn handle_message(
        &self,
        raw: &[u8],
        received_at: DateTime<Local>,
    ) -> Result<MessageOutcome, StorageError> {
        if raw.trim_ascii().is_empty() {
            return Ok(MessageOutcome::Empty);
        }

        self.audit.append(raw).map_err(StorageError::Audit)?;

        let tpv = match gpsd::decode(raw) {
            Ok(Message::Tpv(tpv)) => tpv,
            Ok(Message::Other) => {
                trace!(raw = %String::from_utf8_lossy(raw), "ignoring non-TPV gpsd message");
                return Ok(MessageOutcome::Ignored);
            }
            Err(e) => {
                warn!(name: "reader.message.malformed", error = ?e, "skipping malformed gpsd message");
                return Ok(MessageOutcome::Malformed);
            }
        };

        let report = match PositionReport::try_from(&tpv) {
            Ok(report) => report,
            Err(e) => {
                debug!(
                    reason = %e,
                    device = ?tpv.device,
                    mode = ?tpv.mode,
                    "skipping TPV report without a usable position"
                );
                return Ok(MessageOutcome::Invalid(e));
            }
        };

        self.cache.publish(&report, received_at.with_timezone(&Utc));
        let logged = self.history.maybe_log(&report, received_at)?;
        if logged {
            trace!(lat = report.latitude, lon = report.longitude, "appended history row");
        }
        Ok(MessageOutcome::Accepted { logged })
    }

    /// Drains `messages` until every sender is dropped. Blocks the calling
    /// thread, so run it under `spawn_blocking`.
    pub fn run_blocking(&self, mut messages: mpsc::Receiver<Vec<u8>>) -> Result<(), StorageError> {
        while let Some(raw) = messages.blocking_recv() {
            self.handle_message(&raw, Local::now())?;
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Line {
    Complete,
    /// Longer than the limit; consumed through its newline and dropped.
    Oversized,
}

/// Splits a byte stream on `\n` without requiring UTF-8 and without buffering
/// more than `max_len` bytes of any one line.
struct LineReader<R> {
    inner: R,
    max_len: usize,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner,
            max_len: max_len.max(1),
        }
    }

    /// Reads the next line into `buf` without its terminator. `None` means
    /// end of stream; an oversized line leaves `buf` empty.
    async fn next_line(&mut self, buf: &mut Vec<u8>) -> io::Result<Option<Line>> {
        buf.clear();
        let mut oversized = false;
        loop {
            let limit = (self.max_len + 1 - buf.len()) as u64;
            let read = (&mut self.inner).take(limit).read_until(b'\n', buf).await?;
            if read == 0 {
                // a final line without a terminator still counts
                return Ok(match (oversized, buf.is_empty()) {
                    (true, _) => {
                        buf.clear();
                        Some(Line::Oversized)
                    }
                    (false, true) => None,
                    (false, false) => Some(Line::Complete),
                });
            }
            if buf.last() == Some(&b'\n') {
                buf.pop();
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
                if oversized {
                    buf.clear();
                    return Ok(Some(Line::Oversized));
                }
                return Ok(Some(Line::Complete));
            }
            if buf.len() > self.max_len {
                oversized = true;
                buf.clear();
            }
        }
    }
}

pub struct GpsdConnection {
    lines: LineReader<BufReader<TcpStream>>,
}

impl GpsdConnection {
    pub async fn connect(address: &str, max_line_bytes: usize) -> Result<Self, StreamError> {
        let connect_error = |source: io::Error| StreamError::Connect {
            address: address.to_string(),
            source,
        };
        let mut stream = TcpStream::connect(address).await.map_err(connect_error)?;
        stream
            .write_all(WATCH_COMMAND.as_bytes())
            .await
            .map_err(connect_error)?;

        Ok(Self {
            lines: LineReader::new(BufReader::new(stream), max_line_bytes),
        })
    }

    /// Forwards raw lines to the reader until gpsd hangs up, the reader stops,
    /// or shutdown is requested.
    pub async fn forward(
        mut self,
        messages: mpsc::Sender<Vec<u8>>,
        shutdown: &CancellationToken,
    ) -> Result<(), StreamError> {
        let mut buf = Vec::new();
        loop {
            let line = tokio::select! {
                line = self.lines.next_line(&mut buf) => line.map_err(StreamError::Read)?,
                () = shutdown.cancelled() => return Ok(()),
            };
            match line {
                None => return Err(StreamError::Disconnected),
                Some(Line::Oversized) => warn!(
                    name: "gpsd.line.oversized",
                    max_bytes = self.lines.max_len,
                    "discarding gpsd line over the length limit"
                ),
                Some(Line::Complete) => {
                    if messages.send(std::mem::take(&mut buf)).await.is_err() {
                        // the reader has stopped; its own result says why
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Connects, streams until the connection ends, and reconnects after
/// `reconnect_delay_seconds`. Returns `Ok` only on shutdown.
pub async fn supervise(
    config: GpsdConfig,
    reader: StreamReader,
    shutdown: CancellationToken,
) -> Result<(), StreamError> {
    let reconnect_delay = Duration::from_secs(config.reconnect_delay_seconds);
    loop {
        match run_session(&config, &reader, &shutdown).await {
            Ok(()) => {
                info!(name: "supervisor.shutdown", "shutdown requested, stopping gpsd stream");
                return Ok(());
            }
            Err(e) if e.is_fatal() => {
                error!(name: "supervisor.fatal", error = ?e, "stream reader failed");
                return Err(e);
            }
            Err(e) if reconnect_delay.is_zero() => {
                warn!(name: "supervisor.stopped", error = ?e, "gpsd stream ended and reconnecting is disabled");
                return Err(e);
            }
            Err(e) => {
                warn!(
                    name: "supervisor.reconnecting",
                    error = ?e,
                    delay = ?reconnect_delay,
                    "gpsd stream ended, reconnecting"
                );
                tokio::select! {
                    () = sleep(reconnect_delay) => {},
                    () = shutdown.cancelled() => return Ok(()),
                }
            }
        }
    }
}

async fn run_session(
    config: &GpsdConfig,
    reader: &StreamReader,
    shutdown: &CancellationToken,
) -> Result<(), StreamError> {
    let connection = tokio::select! {
        connection = GpsdConnection::connect(&config.address, config.max_line_bytes) => connection?,
        () = shutdown.cancelled() => return Ok(()),
    };
    info!(name: "gpsd.connected", address = %config.address, "connected to gpsd, streaming reports");

    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let worker = {
        let reader = reader.clone();
        tokio::task::spawn_blocking(move || reader.run_blocking(rx))
    };

    let forwarded = connection.forward(tx, shutdown).await;
    worker.await??;
    forwarded
}
