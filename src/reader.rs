use crate::config::{DeviceConfig, ScanlogConfig};
use crate::error::{Result, ScanlogError};
use crate::events::{EventBus, ScanlogEvent};
use crate::record::AttendanceRecord;
use chrono::Utc;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Span};

/// Where card ids come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderSource {
    Stdin,
    /// A FIFO, log file or keyboard-wedge device node read line by line
    Path(PathBuf),
}

impl ReaderSource {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" | "-" | "stdin" => ReaderSource::Stdin,
            path => ReaderSource::Path(PathBuf::from(path)),
        }
    }
}

impl std::fmt::Display for ReaderSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReaderSource::Stdin => write!(f, "stdin"),
            ReaderSource::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Drops repeat reads of the same card inside a time window
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last: Option<(String, Instant)>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Whether a read of `card_id` at `now` counts as a new scan
    pub fn accept(&mut self, card_id: &str, now: Instant) -> bool {
        if let Some((last_card, at)) = &self.last {
            if last_card == card_id && now.saturating_duration_since(*at) < self.window {
                return false;
            }
        }
        self.last = Some((card_id.to_string(), now));
        true
    }
}

/// Counts from one reader run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderSummary {
    pub accepted: usize,
    pub debounced: usize,
}

/// Line-oriented card reader.
///
/// Keyboard-wedge readers type the card id followed by Enter, so every
/// non-empty line is one scan. Reads happen on a dedicated OS thread because a
/// pending read cannot be interrupted; cancellation is noticed between lines.
pub struct CardReader {
    source: ReaderSource,
    debounce: Duration,
    exit_on_eof: bool,
    device: DeviceConfig,
    event_bus: Arc<EventBus>,
    cancellation_token: CancellationToken,
    span: Span,
}

impl CardReader {
    pub fn new(config: &ScanlogConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            source: ReaderSource::parse(&config.reader.source),
            debounce: Duration::from_secs(config.reader.debounce_seconds),
            exit_on_eof: config.reader.exit_on_eof,
            device: config.device.clone(),
            event_bus,
            cancellation_token: CancellationToken::new(),
            span: Span::none(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn source(&self) -> &ReaderSource {
        &self.source
    }

    /// Open the configured source and start forwarding scans to `sender`
    pub fn start(&self, sender: mpsc::Sender<AttendanceRecord>) -> Result<()> {
        let _enter = self.span.enter();
        info!("Starting card reader on {}", self.source);

        match &self.source {
            ReaderSource::Stdin => {
                self.read_from(BufReader::new(std::io::stdin()), sender)?;
            }
            ReaderSource::Path(path) => {
                let file = File::open(path).map_err(|e| {
                    ScanlogError::component(
                        "reader".to_string(),
                        format!("Failed to open {}: {}", path.display(), e),
                    )
                })?;
                self.read_from(BufReader::new(file), sender)?;
            }
        }

        info!("Ready to scan cards");
        Ok(())
    }

    /// Forward scans read from `input` on a background thread
    pub fn read_from<R>(
        &self,
        input: R,
        sender: mpsc::Sender<AttendanceRecord>,
    ) -> Result<std::thread::JoinHandle<ReaderSummary>>
    where
        R: BufRead + Send + 'static,
    {
        let pump = ReaderPump {
            debouncer: Debouncer::new(self.debounce),
            exit_on_eof: self.exit_on_eof,
            device: self.device.clone(),
            event_bus: Arc::clone(&self.event_bus),
            token: self.cancellation_token.clone(),
            runtime: Handle::current(),
            span: self.span.clone(),
        };

        std::thread::Builder::new()
            .name("card-reader".to_string())
            .spawn(move || pump.run(input, sender))
            .map_err(ScanlogError::Io)
    }

    /// Stop forwarding after the line currently being read
    pub fn stop(&self) {
        let _enter = self.span.enter();
        info!("Stopping card reader");
        self.cancellation_token.cancel();
    }
}

struct ReaderPump {
    debouncer: Debouncer,
    exit_on_eof: bool,
    device: DeviceConfig,
    event_bus: Arc<EventBus>,
    token: CancellationToken,
    runtime: Handle,
    span: Span,
}

impl ReaderPump {
    fn run<R: BufRead>(mut self, input: R, sender: mpsc::Sender<AttendanceRecord>) -> ReaderSummary {
        let _enter = self.span.clone().entered();
        let mut summary = ReaderSummary::default();

        for line in input.lines() {
            if self.token.is_cancelled() {
                debug!("Card reader cancelled");
                return summary;
            }

            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    error!("Error reading card input: {}", e);
                    break;
                }
            };

            let card_id = line.trim();
            if card_id.is_empty() {
                continue;
            }

            if !self.debouncer.accept(card_id, Instant::now()) {
                debug!("Ignoring duplicate read: {}", card_id);
                summary.debounced += 1;
                continue;
            }

            info!("Card detected: {}", card_id);
            let record = AttendanceRecord::new(card_id, Utc::now(), &self.device);
            if sender.blocking_send(record).is_err() {
                warn!("Ingest channel closed, card reader stopping");
                return summary;
            }
            summary.accepted += 1;
        }

        info!("Card input reached end of stream");
        if self.exit_on_eof && !self.token.is_cancelled() {
            let event = ScanlogEvent::ShutdownRequested {
                timestamp: Utc::now(),
                reason: "Card input closed".to_string(),
            };
            if let Err(e) = self.runtime.block_on(self.event_bus.publish(event)) {
                warn!("Failed to publish shutdown request: {}", e);
            }
        }
        summary
    }
}
