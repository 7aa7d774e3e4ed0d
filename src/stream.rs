//! Streaming engine.
//!
//! A streaming session moves words between a file and one hardware FIFO. The
//! command sessions (one per DAC and ADC board) push a [`WaveformScript`] into
//! a command FIFO, waiting for free space before every write. The data
//! sessions drain the ADC data FIFO of a board, or the trigger data FIFO, into
//! a file.
//!
//! Each session runs in its own task. All the waits on the hardware are
//! bounded polls, so a stop request is observed within one poll interval.

use crate::fifo::{FifoId, FifoStatus};
use crate::protocol::{self, check_board, EncodeError};
use crate::script::{ChannelOrders, LoopMode, ScriptKind, WaveformScript};
use crate::shim::{Port, Shim};
use anyhow::Result;
pub use shim_json::{DataFormat, StopReason, StreamKind};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Streaming engine tunables.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StreamConfig {
    /// Sleep between polls of a FIFO that is not ready.
    pub poll_interval: Duration,
    /// Words left free in a command FIFO on top of those being written.
    pub safety_margin: u32,
    /// Maximum number of words read from a data FIFO at once.
    pub batch_words: usize,
    /// The output file is flushed every this number of batches.
    pub flush_batches: u32,
}

impl Default for StreamConfig {
    fn default() -> StreamConfig {
        StreamConfig {
            poll_interval: Duration::from_millis(1),
            safety_margin: 1,
            batch_words: 256,
            flush_batches: 64,
        }
    }
}

/// Streaming session key.
///
/// There is at most one running session per key.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum StreamKey {
    /// DAC command session of a board.
    DacCmd(u8),
    /// ADC command session of a board.
    AdcCmd(u8),
    /// ADC data session of a board.
    AdcData(u8),
    /// Trigger data session.
    TriggerData,
}

impl StreamKey {
    /// Builds a key from its board and kind.
    ///
    /// The trigger data session has no board, and every other kind needs one.
    pub fn new(board: Option<u8>, kind: StreamKind) -> Result<StreamKey, StreamError> {
        let invalid = StreamError::InvalidKey { board, kind };
        match (board, kind) {
            (None, StreamKind::TriggerData) => Ok(StreamKey::TriggerData),
            (Some(b), StreamKind::DacCmd) => Ok(StreamKey::DacCmd(check_board(b)?)),
            (Some(b), StreamKind::AdcCmd) => Ok(StreamKey::AdcCmd(check_board(b)?)),
            (Some(b), StreamKind::AdcData) => Ok(StreamKey::AdcData(check_board(b)?)),
            _ => Err(invalid),
        }
    }

    /// Returns the board of the session.
    pub fn board(&self) -> Option<u8> {
        match *self {
            StreamKey::DacCmd(b) | StreamKey::AdcCmd(b) | StreamKey::AdcData(b) => Some(b),
            StreamKey::TriggerData => None,
        }
    }

    /// Returns the kind of the session.
    pub fn kind(&self) -> StreamKind {
        match self {
            StreamKey::DacCmd(_) => StreamKind::DacCmd,
            StreamKey::AdcCmd(_) => StreamKind::AdcCmd,
            StreamKey::AdcData(_) => StreamKind::AdcData,
            StreamKey::TriggerData => StreamKind::TriggerData,
        }
    }

    /// Returns the FIFO that the session uses.
    pub fn fifo(&self) -> FifoId {
        match *self {
            StreamKey::DacCmd(b) => FifoId::DacCmd(b),
            StreamKey::AdcCmd(b) => FifoId::AdcCmd(b),
            StreamKey::AdcData(b) => FifoId::AdcData(b),
            StreamKey::TriggerData => FifoId::TrigData,
        }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            StreamKey::DacCmd(b) => write!(f, "DAC {b} command stream"),
            StreamKey::AdcCmd(b) => write!(f, "ADC {b} command stream"),
            StreamKey::AdcData(b) => write!(f, "ADC {b} data stream"),
            StreamKey::TriggerData => write!(f, "trigger data stream"),
        }
    }
}

/// Streaming session error.
#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    /// A session with the same key is running.
    #[error("{0} is already running")]
    AlreadyRunning(StreamKey),
    /// No session with this key is running.
    #[error("{0} is not running")]
    NotRunning(StreamKey),
    /// The hardware reports the FIFO of the session as absent.
    #[error("{0} is not present")]
    FifoAbsent(FifoId),
    /// Sessions are running, so exclusive access cannot be granted.
    #[error("streaming sessions are running: {0:?}")]
    Busy(Vec<StreamKey>),
    /// A write of the script does not fit in the FIFO.
    #[error("{key} needs writes of {needed} words, but the FIFO holds {capacity}")]
    FifoTooSmall {
        /// Session.
        key: StreamKey,
        /// Words of the largest write plus the safety margin.
        needed: usize,
        /// FIFO capacity.
        capacity: u32,
    },
    /// The job does not match the session kind.
    #[error("{0} cannot run this job")]
    JobMismatch(StreamKey),
    /// The board and kind do not name a session.
    #[error("there is no {kind:?} session for board {board:?}")]
    InvalidKey {
        /// Board.
        board: Option<u8>,
        /// Kind.
        kind: StreamKind,
    },
    /// Out of range board index or script value.
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// The output file cannot be created.
    #[error("cannot create {}: {source}", path.display())]
    Output {
        /// Output file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Work requested from a streaming session.
#[derive(Debug, Clone)]
pub enum StreamJob {
    /// Push a script into a command FIFO.
    Command {
        /// Script.
        script: Arc<WaveformScript>,
        /// Number of passes over the script.
        loop_count: u32,
        /// Loop marker expansion.
        loop_mode: LoopMode,
    },
    /// Drain ADC samples into a file.
    AdcData {
        /// Output file.
        output: PathBuf,
        /// Number of samples to capture.
        samples: u64,
        /// Output format.
        format: DataFormat,
        /// Channel sampled at each of the 8 positions of every record.
        orders: ChannelOrders,
        /// Bias subtracted from each channel in ASCII output.
        biases: [Option<f64>; 8],
    },
    /// Drain trigger timestamps into a file.
    TriggerData {
        /// Output file.
        output: PathBuf,
        /// Number of timestamps to capture.
        records: u64,
        /// Output format.
        format: DataFormat,
    },
}

impl StreamJob {
    fn describe(&self) -> String {
        match self {
            StreamJob::Command {
                loop_count,
                loop_mode,
                ..
            } => format!("script x{loop_count} ({loop_mode})"),
            StreamJob::AdcData { output, .. } | StreamJob::TriggerData { output, .. } => {
                output.display().to_string()
            }
        }
    }
}

/// Final report of a streaming session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamReport {
    /// Session.
    pub key: StreamKey,
    /// Why the session ended.
    pub reason: StopReason,
    /// Instructions sent, samples or timestamps written.
    pub progress: u64,
    /// Total that the session was to transfer.
    pub target: u64,
    /// Description of the failure, if the session failed.
    pub error: Option<String>,
}

impl StreamReport {
    /// Returns the report as JSON.
    pub fn json(&self) -> shim_json::StreamReport {
        shim_json::StreamReport {
            board: self.key.board(),
            kind: self.key.kind(),
            reason: self.reason,
            progress: self.progress,
            target: self.target,
            error: self.error.clone(),
        }
    }
}

type Output = BufWriter<tokio::fs::File>;

enum Work {
    Produce {
        kind: ScriptKind,
        board: u8,
        script: Arc<WaveformScript>,
        loop_count: u32,
        loop_mode: LoopMode,
    },
    ConsumeAdc {
        output: Output,
        samples: u64,
        format: DataFormat,
        orders: ChannelOrders,
        biases: [Option<f64>; 8],
    },
    ConsumeTrigger {
        output: Output,
        records: u64,
        format: DataFormat,
    },
}

struct Worker {
    key: StreamKey,
    port: Port,
    config: StreamConfig,
    cancel: CancellationToken,
    progress: Arc<AtomicU64>,
    target: u64,
}

impl Worker {
    #[tracing::instrument(name = "stream", skip_all, fields(key = %self.key))]
    async fn run(self, work: Work) -> StreamReport {
        tracing::info!(target = self.target, "session started");
        let result = match work {
            Work::Produce {
                kind,
                board,
                script,
                loop_count,
                loop_mode,
            } => {
                self.produce(kind, board, &script, loop_count, loop_mode)
                    .await
            }
            Work::ConsumeAdc {
                mut output,
                samples,
                format,
                orders,
                biases,
            } => {
                self.consume_adc(&mut output, samples, format, &orders, &biases)
                    .await
            }
            Work::ConsumeTrigger {
                mut output,
                records,
                format,
            } => self.consume_trigger(&mut output, records, format).await,
        };
        let (reason, error) = match result {
            Ok(reason) => (reason, None),
            Err(err) => {
                tracing::error!("session failed: {err:#}");
                (StopReason::Failed, Some(format!("{err:#}")))
            }
        };
        let progress = self.progress.load(Ordering::Relaxed);
        tracing::info!(?reason, progress, target = self.target, "session finished");
        StreamReport {
            key: self.key,
            reason,
            progress,
            target: self.target,
            error,
        }
    }

    /// Polls the FIFO until `ready` holds.
    ///
    /// Returns the reason to end the session if it is stopped or the FIFO is
    /// absent.
    async fn wait_for(&self, ready: impl Fn(FifoStatus) -> bool) -> Result<FifoStatus, StopReason> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(StopReason::Stopped);
            }
            let status = self.port.status();
            if !status.present {
                tracing::error!("{} is absent", self.port.id());
                return Err(StopReason::FifoAbsent);
            }
            if ready(status) {
                return Ok(status);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn produce(
        &self,
        kind: ScriptKind,
        board: u8,
        script: &WaveformScript,
        loop_count: u32,
        loop_mode: LoopMode,
    ) -> Result<StopReason> {
        let capacity = i64::from(self.port.fifo().capacity());
        let margin = i64::from(self.config.safety_margin);
        let mut sent = 0;
        for pass in 0..loop_count {
            for step in script.steps() {
                for _ in 0..step.writes(loop_mode) {
                    // cont is cleared only on the very last write
                    let cont = sent + 1 < self.target;
                    let words = step.encode(kind, loop_mode, board, cont)?;
                    let needed = words.len() as i64;
                    if let Err(reason) = self
                        .wait_for(|s| capacity - i64::from(s.word_count) - margin >= needed)
                        .await
                    {
                        return Ok(reason);
                    }
                    for &word in &words {
                        self.port.fifo().write(word);
                    }
                    sent += 1;
                    self.progress.store(sent, Ordering::Relaxed);
                    tracing::debug!(pass, sent, words = words.len(), cont, "wrote instruction");
                }
            }
        }
        Ok(StopReason::Completed)
    }

    async fn consume_adc(
        &self,
        output: &mut Output,
        samples: u64,
        format: DataFormat,
        orders: &ChannelOrders,
        biases: &[Option<f64>; 8],
    ) -> Result<StopReason> {
        let target_words = samples.div_ceil(2);
        let mut words_read = 0;
        let mut written = 0;
        let mut batches = 0;
        let mut text = String::new();
        let mut bytes = Vec::new();
        let mut order = orders.order(0);
        let reason = loop {
            if words_read >= target_words {
                break StopReason::Completed;
            }
            let status = match self.wait_for(|s| s.word_count > 0).await {
                Ok(status) => status,
                Err(reason) => break reason,
            };
            let n = u64::from(status.word_count)
                .min(self.config.batch_words as u64)
                .min(target_words - words_read);
            text.clear();
            bytes.clear();
            for _ in 0..n {
                let word = self.port.fifo().read();
                match format {
                    DataFormat::Binary => bytes.extend_from_slice(&word.to_le_bytes()),
                    DataFormat::Ascii => {
                        for sample in protocol::unpack_samples(word) {
                            if written == samples {
                                break;
                            }
                            let position = (written % 8) as usize;
                            if position == 0 {
                                order = orders.order(written / 8);
                            }
                            let channel = usize::from(order[position]);
                            let value = corrected_sample(sample, biases[channel]);
                            if position != 0 {
                                text.push(' ');
                            }
                            write!(text, "{value}")?;
                            if position == 7 {
                                text.push('\n');
                            }
                            written += 1;
                        }
                    }
                }
            }
            words_read += n;
            if format == DataFormat::Binary {
                written = (2 * words_read).min(samples);
                output.write_all(&bytes).await?;
            } else {
                output.write_all(text.as_bytes()).await?;
            }
            self.progress.store(written, Ordering::Relaxed);
            batches += 1;
            if batches % self.config.flush_batches == 0 {
                output.flush().await?;
            }
        };
        if format == DataFormat::Ascii && written % 8 != 0 {
            output.write_all(b"\n").await?;
        }
        output.flush().await?;
        Ok(reason)
    }

    async fn consume_trigger(
        &self,
        output: &mut Output,
        records: u64,
        format: DataFormat,
    ) -> Result<StopReason> {
        let batch_records = (self.config.batch_words as u64 / 2).max(1);
        let mut written = 0;
        let mut batches = 0;
        let mut text = String::new();
        let mut bytes = Vec::new();
        let reason = loop {
            if written >= records {
                break StopReason::Completed;
            }
            let status = match self.wait_for(|s| s.word_count >= 2).await {
                Ok(status) => status,
                Err(reason) => break reason,
            };
            let n = u64::from(status.word_count / 2)
                .min(batch_records)
                .min(records - written);
            text.clear();
            bytes.clear();
            for _ in 0..n {
                let low = self.port.fifo().read();
                let high = self.port.fifo().read();
                let timestamp = protocol::trigger::timestamp(low, high);
                match format {
                    DataFormat::Binary => bytes.extend_from_slice(&timestamp.to_le_bytes()),
                    DataFormat::Ascii => writeln!(text, "{timestamp}")?,
                }
            }
            match format {
                DataFormat::Binary => output.write_all(&bytes).await?,
                DataFormat::Ascii => output.write_all(text.as_bytes()).await?,
            }
            written += n;
            self.progress.store(written, Ordering::Relaxed);
            batches += 1;
            if batches % self.config.flush_batches == 0 {
                output.flush().await?;
            }
        };
        output.flush().await?;
        Ok(reason)
    }
}

/// Converts an offset-format sample to a signed value, subtracting `bias` and
/// rounding half away from zero.
pub fn corrected_sample(sample: u16, bias: Option<f64>) -> i64 {
    let signed = protocol::offset_to_signed(sample);
    match bias {
        Some(bias) => (f64::from(signed) - bias).round() as i64,
        None => signed.into(),
    }
}

#[derive(Debug)]
struct Session {
    description: String,
    target: u64,
    progress: Arc<AtomicU64>,
    cancel: CancellationToken,
    handle: JoinHandle<StreamReport>,
}

impl Session {
    async fn join(self, key: StreamKey) -> StreamReport {
        match self.handle.await {
            Ok(report) => report,
            Err(err) => StreamReport {
                key,
                reason: StopReason::Failed,
                progress: self.progress.load(Ordering::Relaxed),
                target: self.target,
                error: Some(format!("worker task failed: {err}")),
            },
        }
    }

    fn json(&self, key: StreamKey) -> shim_json::Stream {
        shim_json::Stream {
            board: key.board(),
            kind: key.kind(),
            state: if self.handle.is_finished() {
                shim_json::StreamState::Finished
            } else {
                shim_json::StreamState::Running
            },
            progress: self.progress.load(Ordering::Relaxed),
            target: self.target,
            path: self.description.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Sessions {
    active: BTreeMap<StreamKey, Session>,
    reports: BTreeMap<StreamKey, StreamReport>,
}

impl Sessions {
    /// Joins the sessions whose worker has exited and keeps their reports.
    async fn reap(&mut self) {
        let finished: Vec<StreamKey> = self
            .active
            .iter()
            .filter(|(_, s)| s.handle.is_finished())
            .map(|(&k, _)| k)
            .collect();
        for key in finished {
            if let Some(session) = self.active.remove(&key) {
                let report = session.join(key).await;
                self.reports.insert(key, report);
            }
        }
    }

    async fn stop(&mut self, key: StreamKey) -> Result<StreamReport, StreamError> {
        let session = self
            .active
            .remove(&key)
            .ok_or(StreamError::NotRunning(key))?;
        session.cancel.cancel();
        let report = session.join(key).await;
        self.reports.insert(key, report.clone());
        Ok(report)
    }
}

/// Exclusive access to the hardware, granted while no session runs.
///
/// While this guard is alive, the only sessions that can be started are the
/// ones started through it.
#[derive(Debug)]
pub struct Quiesced<'a> {
    manager: &'a StreamManager,
    sessions: tokio::sync::MutexGuard<'a, Sessions>,
}

impl Quiesced<'_> {
    /// Starts a session without giving up exclusive access.
    pub async fn start(&mut self, key: StreamKey, job: StreamJob) -> Result<(), StreamError> {
        self.manager
            .start_locked(&mut self.sessions, key, job)
            .await
    }

    /// Stops a session started through this guard.
    pub async fn stop(&mut self, key: StreamKey) -> Result<StreamReport, StreamError> {
        self.sessions.stop(key).await
    }
}

/// Streaming session manager.
///
/// This struct owns every streaming session, keyed by [`StreamKey`].
#[derive(Debug)]
pub struct StreamManager {
    shim: Arc<Shim>,
    config: StreamConfig,
    sessions: tokio::sync::Mutex<Sessions>,
}

async fn create_output(path: &Path) -> Result<Output, StreamError> {
    let file = tokio::fs::File::create(path)
        .await
        .map_err(|source| StreamError::Output {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(BufWriter::new(file))
}

impl StreamManager {
    /// Creates a session manager for the FIFOs of `shim`.
    pub fn new(shim: Arc<Shim>, config: StreamConfig) -> StreamManager {
        StreamManager {
            shim,
            config,
            sessions: tokio::sync::Mutex::new(Sessions::default()),
        }
    }

    /// Returns the streaming engine tunables.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Starts a session.
    ///
    /// Fails without side effects if a session with the same key is running,
    /// if the FIFO is absent, or if the job does not suit the session. A
    /// session whose worker has exited but that has not been stopped is
    /// reaped and replaced.
    pub async fn start(&self, key: StreamKey, job: StreamJob) -> Result<(), StreamError> {
        let mut sessions = self.sessions.lock().await;
        self.start_locked(&mut sessions, key, job).await
    }

    async fn start_locked(
        &self,
        sessions: &mut Sessions,
        key: StreamKey,
        job: StreamJob,
    ) -> Result<(), StreamError> {
        sessions.reap().await;
        if sessions.active.contains_key(&key) {
            return Err(StreamError::AlreadyRunning(key));
        }
        let port = self.shim.port(key.fifo())?.clone();
        if !port.present() {
            return Err(StreamError::FifoAbsent(key.fifo()));
        }
        let description = job.describe();
        let (work, target) = match (key, job) {
            (
                StreamKey::DacCmd(board) | StreamKey::AdcCmd(board),
                StreamJob::Command {
                    script,
                    loop_count,
                    loop_mode,
                },
            ) => {
                let kind = if matches!(key, StreamKey::DacCmd(_)) {
                    ScriptKind::Dac
                } else {
                    ScriptKind::Adc
                };
                if script.kind() != kind {
                    return Err(StreamError::JobMismatch(key));
                }
                let needed = script
                    .steps()
                    .iter()
                    .map(|s| s.words_per_write(loop_mode))
                    .max()
                    .unwrap_or(0)
                    + self.config.safety_margin as usize;
                let capacity = port.fifo().capacity();
                if needed > capacity as usize {
                    return Err(StreamError::FifoTooSmall {
                        key,
                        needed,
                        capacity,
                    });
                }
                let target = script.writes(loop_mode) * u64::from(loop_count);
                (
                    Work::Produce {
                        kind,
                        board,
                        script,
                        loop_count,
                        loop_mode,
                    },
                    target,
                )
            }
            (
                StreamKey::AdcData(_),
                StreamJob::AdcData {
                    output,
                    samples,
                    format,
                    orders,
                    biases,
                },
            ) => (
                Work::ConsumeAdc {
                    output: create_output(&output).await?,
                    samples,
                    format,
                    orders,
                    biases,
                },
                samples,
            ),
            (
                StreamKey::TriggerData,
                StreamJob::TriggerData {
                    output,
                    records,
                    format,
                },
            ) => (
                Work::ConsumeTrigger {
                    output: create_output(&output).await?,
                    records,
                    format,
                },
                records,
            ),
            _ => return Err(StreamError::JobMismatch(key)),
        };
        let cancel = CancellationToken::new();
        let progress = Arc::new(AtomicU64::new(0));
        let worker = Worker {
            key,
            port,
            config: self.config,
            cancel: cancel.clone(),
            progress: Arc::clone(&progress),
            target,
        };
        let handle = tokio::spawn(worker.run(work));
        sessions.reports.remove(&key);
        sessions.active.insert(
            key,
            Session {
                description,
                target,
                progress,
                cancel,
                handle,
            },
        );
        Ok(())
    }

    /// Stops a session.
    ///
    /// This waits until the worker has exited and its output file has been
    /// flushed and closed, and returns the report of the session.
    pub async fn stop(&self, key: StreamKey) -> Result<StreamReport, StreamError> {
        self.sessions.lock().await.stop(key).await
    }

    /// Waits for a session to end by itself and returns its report.
    pub async fn join(&self, key: StreamKey) -> Result<StreamReport, StreamError> {
        let session = self
            .sessions
            .lock()
            .await
            .active
            .remove(&key)
            .ok_or(StreamError::NotRunning(key))?;
        let report = session.join(key).await;
        self.sessions
            .lock()
            .await
            .reports
            .insert(key, report.clone());
        Ok(report)
    }

    /// Stops every session.
    pub async fn stop_all(&self) -> Vec<StreamReport> {
        let mut sessions = self.sessions.lock().await;
        let active = std::mem::take(&mut sessions.active);
        for session in active.values() {
            session.cancel.cancel();
        }
        let mut reports = Vec::with_capacity(active.len());
        for (key, session) in active {
            let report = session.join(key).await;
            sessions.reports.insert(key, report.clone());
            reports.push(report);
        }
        reports
    }

    /// Returns the keys of the sessions that have not been stopped.
    pub async fn active(&self) -> Vec<StreamKey> {
        self.sessions.lock().await.active.keys().copied().collect()
    }

    /// Grants exclusive access to the hardware.
    ///
    /// Fails if any session is running. Sessions whose worker has exited are
    /// reaped first.
    pub async fn quiesce(&self) -> Result<Quiesced<'_>, StreamError> {
        let mut sessions = self.sessions.lock().await;
        sessions.reap().await;
        if !sessions.active.is_empty() {
            return Err(StreamError::Busy(sessions.active.keys().copied().collect()));
        }
        Ok(Quiesced {
            manager: self,
            sessions,
        })
    }

    /// Returns the state of every session.
    pub async fn json(&self) -> shim_json::Streams {
        let sessions = self.sessions.lock().await;
        shim_json::Streams {
            sessions: sessions
                .active
                .iter()
                .map(|(&key, session)| session.json(key))
                .collect(),
            reports: sessions.reports.values().map(StreamReport::json).collect(),
        }
    }
}
