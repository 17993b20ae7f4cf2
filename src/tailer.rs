//! Incremental reader for a single growing log file.
//!
//! Two triggers feed one read loop:
//!
//! - a debounced filesystem watch on the file's parent directory, for low
//!   latency, and
//! - a fixed-interval poll, for filesystems where events are lost.
//!
//! Both end up in [`TailCursor::read_new`], which only reads the byte range
//! `[offset, size)`. A trigger that finds no new bytes does nothing, so the
//! watch and the poll racing on the same append never duplicate a line.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MonitoringConfig;
use crate::error::{HealerError, Result};

/// One complete, non-blank line read from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// Something the tailer observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailEvent {
    Line(LogLine),
    /// The file shrank; reading restarted from offset 0.
    Truncated { previous_size: u64, current_size: u64 },
    /// The file is missing or unreadable.
    Error { message: String },
}

/// Tailer timing.
#[derive(Debug, Clone)]
pub struct TailerConfig {
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub channel_capacity: usize,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self::from(&MonitoringConfig::default())
    }
}

impl From<&MonitoringConfig> for TailerConfig {
    fn from(config: &MonitoringConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.polling_interval_ms.max(1)),
            debounce: Duration::from_millis(config.debounce_ms.max(1)),
            channel_capacity: 1024,
        }
    }
}

// ============================================================================
// Cursor
// ============================================================================

/// Read position plus the buffered fragment of an unterminated line.
#[derive(Debug, Default)]
pub(crate) struct TailCursor {
    offset: u64,
    partial: Vec<u8>,
    missing: bool,
}

impl TailCursor {
    /// Cursor positioned at the current end of `path` (0 if absent).
    pub(crate) fn at_end_of(path: &Path) -> Self {
        let offset = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        Self {
            offset,
            ..Self::default()
        }
    }

    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.partial.clear();
    }

    /// Read whatever was appended since the last call.
    pub(crate) fn read_new(&mut self, path: &Path) -> Vec<TailEvent> {
        let size = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                if self.missing {
                    return Vec::new();
                }
                self.missing = true;
                self.reset();
                warn!("[healer] Log file {} unavailable: {}", path.display(), e);
                return vec![TailEvent::Error {
                    message: format!("{}: {}", path.display(), e),
                }];
            }
        };

        if self.missing {
            info!("[healer] Log file {} is back", path.display());
            self.missing = false;
        }

        let mut events = Vec::new();

        if size < self.offset {
            info!(
                "[healer] Log file truncated ({} -> {} bytes), restarting from 0",
                self.offset, size
            );
            events.push(TailEvent::Truncated {
                previous_size: self.offset,
                current_size: size,
            });
            self.reset();
        }

        if size == self.offset {
            return events;
        }

        let mut buf = Vec::with_capacity((size - self.offset) as usize);
        let read = File::open(path).and_then(|mut file| {
            file.seek(SeekFrom::Start(self.offset))?;
            file.take(size - self.offset).read_to_end(&mut buf)
        });
        if let Err(e) = read {
            events.push(TailEvent::Error {
                message: format!("{}: {}", path.display(), e),
            });
            return events;
        }

        self.offset += buf.len() as u64;
        self.partial.extend_from_slice(&buf);

        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let text = text.trim_end_matches('\r');
            if !text.trim().is_empty() {
                events.push(TailEvent::Line(LogLine {
                    text: text.to_string(),
                    received_at: Utc::now(),
                }));
            }
        }

        events
    }
}

// ============================================================================
// Tailer
// ============================================================================

/// Tails one file. Consumed by [`start`](LogTailer::start).
#[derive(Debug, Clone)]
pub struct LogTailer {
    path: PathBuf,
    config: TailerConfig,
}

impl LogTailer {
    pub fn new(path: impl Into<PathBuf>, config: TailerConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start tailing from the current end of the file.
    ///
    /// Must be called inside a tokio runtime. Failure to set up the
    /// filesystem watch is logged and the tailer continues in poll-only mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the path has no file name.
    pub fn start(self) -> Result<(TailerHandle, mpsc::Receiver<TailEvent>)> {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| HealerError::tailer(&self.path, "path has no file name"))?;

        let cursor = TailCursor::at_end_of(&self.path);
        debug!(
            "[healer] Tailing {} from offset {}",
            self.path.display(),
            cursor.offset()
        );

        let (event_tx, event_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (trigger_tx, trigger_rx) = mpsc::channel::<()>(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let debouncer = match self.watch_parent(file_name, trigger_tx) {
            Ok(d) => Some(d),
            Err(e) => {
                warn!("[healer] {}; falling back to polling only", e);
                None
            }
        };

        let task = tokio::spawn(run_loop(
            self.path,
            self.config.poll_interval,
            cursor,
            event_tx,
            trigger_rx,
            shutdown_rx,
        ));

        Ok((
            TailerHandle {
                shutdown: shutdown_tx,
                task: Mutex::new(Some(task)),
                debouncer: Mutex::new(debouncer),
            },
            event_rx,
        ))
    }

    fn watch_parent(
        &self,
        file_name: std::ffi::OsString,
        trigger: mpsc::Sender<()>,
    ) -> Result<Debouncer<RecommendedWatcher>> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut debouncer = new_debouncer(
            self.config.debounce,
            move |result: std::result::Result<Vec<DebouncedEvent>, notify::Error>| {
                let Ok(events) = result else {
                    return;
                };
                if events
                    .iter()
                    .any(|e| e.path.file_name() == Some(file_name.as_os_str()))
                {
                    // A full channel already has a wake-up queued.
                    let _ = trigger.try_send(());
                }
            },
        )
        .map_err(|e| HealerError::tailer(&self.path, format!("cannot create watcher: {e}")))?;

        debouncer
            .watcher()
            .watch(&parent, RecursiveMode::NonRecursive)
            .map_err(|e| HealerError::tailer(&self.path, format!("cannot watch {}: {e}", parent.display())))?;

        Ok(debouncer)
    }
}

async fn run_loop(
    path: PathBuf,
    poll_interval: Duration,
    mut cursor: TailCursor,
    events: mpsc::Sender<TailEvent>,
    mut trigger: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut poll = tokio::time::interval(poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(()) = trigger.recv() => {}
            _ = poll.tick() => {}
        }

        if *shutdown.borrow() {
            break;
        }

        for event in cursor.read_new(&path) {
            if events.send(event).await.is_err() {
                debug!("[healer] Tail receiver dropped, stopping");
                return;
            }
        }
    }
    debug!("[healer] Tailer for {} stopped", path.display());
}

/// Controls a running tailer.
pub struct TailerHandle {
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    debouncer: Mutex<Option<Debouncer<RecommendedWatcher>>>,
}

impl TailerHandle {
    /// Stop the watch and the poll timer. Safe to call more than once.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Ok(mut debouncer) = self.debouncer.lock() {
            debouncer.take();
        }
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl std::fmt::Debug for TailerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailerHandle")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Drop for TailerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
