//! Waveform test orchestrator.
//!
//! A waveform test plays a DAC command script and an ADC command script on
//! each participating board, all synchronized to the same external triggers.
//! The orchestrator validates that every script consumes the same number of
//! triggers, preloads the command FIFOs, starts every streaming session and
//! then issues a single synchronization barrier that arms the trigger unit.
//!
//! Validation happens before anything is written to the hardware. Once the
//! barrier has been issued the test can only be cancelled by stopping its
//! streaming sessions.

use crate::calibration::{CalibrationConfig, CalibrationError, CalibrationTable, Calibrator};
use crate::fifo::FifoId;
use crate::protocol::{self, MAX_TRIGGER_VALUE};
use crate::script::{LoopMode, ScriptKind, WaveformScript};
use crate::shim::{CommandError, Shim};
use crate::stream::{DataFormat, Quiesced, StreamError, StreamJob, StreamKey, StreamManager};
use crate::trigger::{Barrier, MonitorConfig, TriggerMonitor};
use anyhow::{Context, Result};
pub use shim_json::PrefillTimeoutPolicy;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// Command script and loop count of one side of a board.
#[derive(Debug, Clone)]
pub struct SidePlan {
    /// Script.
    pub script: Arc<WaveformScript>,
    /// Number of passes over the script.
    pub loop_count: u32,
}

impl SidePlan {
    /// Returns the number of external triggers consumed by all the passes.
    pub fn triggers(&self) -> u64 {
        self.script.trigger_count() * u64::from(self.loop_count)
    }

    /// Returns the number of command words written by all the passes.
    pub fn words(&self, mode: LoopMode) -> u64 {
        self.script.words(mode) * u64::from(self.loop_count)
    }
}

/// Waveform test settings of one board.
#[derive(Debug, Clone)]
pub struct BoardPlan {
    /// Board index.
    pub board: u8,
    /// DAC side.
    pub dac: Option<SidePlan>,
    /// ADC side.
    pub adc: Option<SidePlan>,
    /// Output file of the ADC samples.
    pub output: Option<PathBuf>,
}

/// Waveform test request.
#[derive(Debug, Clone)]
pub struct WaveformRequest {
    /// Participating boards.
    pub boards: Vec<BoardPlan>,
    /// Reset every FIFO before starting.
    pub reset_buffers: bool,
    /// Run the full calibration before starting.
    pub calibrate: bool,
    /// Output file of the trigger timestamps.
    pub trigger_output: Option<PathBuf>,
    /// Loop marker expansion.
    pub loop_mode: LoopMode,
    /// Output file format.
    pub format: DataFormat,
    /// Trigger lockout, in clock cycles.
    pub lockout: u32,
    /// Action if the command FIFOs do not fill in time.
    pub prefill_timeout: PrefillTimeoutPolicy,
}

/// Defaults for the optional fields of a waveform test request.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct RequestDefaults {
    /// Loop marker expansion.
    pub loop_mode: LoopMode,
    /// Output file format.
    pub format: DataFormat,
    /// Trigger lockout, in clock cycles.
    pub lockout: u32,
}

/// Resolves a path relative to `dir`.
pub fn resolve_path(dir: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}

async fn load_side(
    kind: ScriptKind,
    side: Option<&shim_json::WaveformSide>,
    dir: &Path,
) -> Result<Option<SidePlan>> {
    let Some(side) = side else {
        return Ok(None);
    };
    let script = WaveformScript::load(kind, &resolve_path(dir, &side.script)).await?;
    Ok(Some(SidePlan {
        script: Arc::new(script),
        loop_count: side.loop_count,
    }))
}

impl WaveformRequest {
    /// Builds a request from its JSON form, loading the command scripts.
    ///
    /// Relative paths are taken relative to `dir`.
    pub async fn load(
        put: &shim_json::PutWaveform,
        defaults: &RequestDefaults,
        dir: &Path,
    ) -> Result<WaveformRequest> {
        let mut boards = Vec::with_capacity(put.boards.len());
        for board in &put.boards {
            boards.push(BoardPlan {
                board: board.board,
                dac: load_side(ScriptKind::Dac, board.dac.as_ref(), dir)
                    .await
                    .with_context(|| format!("board {} DAC script", board.board))?,
                adc: load_side(ScriptKind::Adc, board.adc.as_ref(), dir)
                    .await
                    .with_context(|| format!("board {} ADC script", board.board))?,
                output: board.output.as_deref().map(|p| resolve_path(dir, p)),
            });
        }
        Ok(WaveformRequest {
            boards,
            reset_buffers: put.reset_buffers,
            calibrate: put.calibrate,
            trigger_output: put.trigger_output.as_deref().map(|p| resolve_path(dir, p)),
            loop_mode: put.loop_mode.unwrap_or(defaults.loop_mode),
            format: put.format.unwrap_or(defaults.format),
            lockout: put.lockout.unwrap_or(defaults.lockout),
            prefill_timeout: put.prefill_timeout,
        })
    }
}

/// Side of a board.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Side {
    /// DAC board.
    Dac,
    /// ADC board.
    Adc,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Side::Dac => write!(f, "DAC"),
            Side::Adc => write!(f, "ADC"),
        }
    }
}

/// Trigger total of one side of a board.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SideTotal {
    /// Board index.
    pub board: u8,
    /// Side.
    pub side: Side,
    /// Triggers per pass times loop count.
    pub triggers: u64,
}

impl fmt::Display for SideTotal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "board {} {}: {}", self.board, self.side, self.triggers)
    }
}

/// The waveform test request is inconsistent.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum ValidationError {
    /// No board takes part in the test.
    #[error("no boards given")]
    NoBoards,
    /// A board index is out of range.
    #[error("board {0} is out of range")]
    InvalidBoard(u8),
    /// A board appears more than once.
    #[error("board {0} is given more than once")]
    DuplicateBoard(u8),
    /// A board has neither a DAC nor an ADC script.
    #[error("board {0} has no scripts")]
    NoScripts(u8),
    /// An ADC script is given without an output file.
    #[error("board {0} has an ADC script but no output file")]
    MissingOutput(u8),
    /// A side with a script is not connected.
    #[error("board {board} {side} is not connected")]
    NotConnected {
        /// Board index.
        board: u8,
        /// Side.
        side: Side,
    },
    /// A loop count is zero.
    #[error("board {board} {side} loop count is zero")]
    ZeroLoopCount {
        /// Board index.
        board: u8,
        /// Side.
        side: Side,
    },
    /// The trigger totals differ.
    #[error("trigger counts differ: {}", format_totals(.0))]
    TriggerMismatch(Vec<SideTotal>),
    /// The trigger total cannot be armed in the trigger unit.
    #[error("{0} expected triggers exceed the maximum {max}", max = MAX_TRIGGER_VALUE)]
    TooManyTriggers(u64),
}

fn format_totals(totals: &[SideTotal]) -> String {
    totals
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Validates a request against the connected boards.
///
/// Returns the number of external triggers that the test expects. Every side
/// of every board must consume the same number of triggers.
pub fn validate(request: &WaveformRequest, shim: &Shim) -> Result<u64, ValidationError> {
    if request.boards.is_empty() {
        return Err(ValidationError::NoBoards);
    }
    let connected = shim.connected_boards();
    let mut seen = Vec::new();
    let mut totals = Vec::new();
    for plan in &request.boards {
        let board = plan.board;
        if protocol::check_board(board).is_err() {
            return Err(ValidationError::InvalidBoard(board));
        }
        if seen.contains(&board) {
            return Err(ValidationError::DuplicateBoard(board));
        }
        seen.push(board);
        if plan.dac.is_none() && plan.adc.is_none() {
            return Err(ValidationError::NoScripts(board));
        }
        if plan.adc.is_some() && plan.output.is_none() {
            return Err(ValidationError::MissingOutput(board));
        }
        for (side, plan, connected) in [
            (Side::Dac, &plan.dac, &connected.dac),
            (Side::Adc, &plan.adc, &connected.adc),
        ] {
            let Some(plan) = plan else {
                continue;
            };
            if !connected.contains(&board) {
                return Err(ValidationError::NotConnected { board, side });
            }
            if plan.loop_count == 0 {
                return Err(ValidationError::ZeroLoopCount { board, side });
            }
            totals.push(SideTotal {
                board,
                side,
                triggers: plan.triggers(),
            });
        }
    }
    let expected = totals[0].triggers;
    if totals.iter().any(|t| t.triggers != expected) {
        return Err(ValidationError::TriggerMismatch(totals));
    }
    if expected > u64::from(MAX_TRIGGER_VALUE) {
        return Err(ValidationError::TooManyTriggers(expected));
    }
    Ok(expected)
}

/// Waveform test failure.
#[derive(thiserror::Error, Debug)]
pub enum WaveformError {
    /// The request is inconsistent. Nothing was written to the hardware.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A streaming session could not be started or the hardware is busy.
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// The calibration failed.
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    /// A command could not be issued.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// The command FIFOs did not fill in time. Every started session has been
    /// stopped.
    #[error("command FIFOs did not fill in time: {0:?}")]
    PrefillTimeout(Vec<FifoId>),
}

/// Prefill tunables.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PrefillConfig {
    /// Words that every command FIFO must hold before the barrier, unless the
    /// stream writes fewer words in total.
    pub threshold: u64,
    /// Maximum wait for the FIFOs to fill.
    pub timeout: Duration,
    /// Interval between polls of the FIFOs.
    pub poll_interval: Duration,
}

impl Default for PrefillConfig {
    fn default() -> PrefillConfig {
        PrefillConfig {
            threshold: 10,
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(1),
        }
    }
}

/// Sessions and settings of a started waveform test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveformTest {
    /// Participating boards.
    pub boards: Vec<u8>,
    /// External triggers that the test expects.
    pub expected_triggers: u64,
    /// Started sessions.
    pub keys: Vec<StreamKey>,
    /// The command FIFOs did not fill in time and the barrier was issued
    /// anyway.
    pub prefill_timed_out: bool,
}

impl WaveformTest {
    /// Returns the test as JSON, taking the state of its sessions from
    /// `streams`.
    pub fn json(&self, streams: &shim_json::Streams) -> shim_json::Waveform {
        shim_json::Waveform {
            boards: self.boards.clone(),
            expected_triggers: self.expected_triggers,
            streams: streams
                .sessions
                .iter()
                .filter(|s| {
                    StreamKey::new(s.board, s.kind).is_ok_and(|key| self.keys.contains(&key))
                })
                .cloned()
                .collect(),
            prefill_timed_out: self.prefill_timed_out,
        }
    }
}

/// Started waveform test.
#[derive(Debug)]
pub struct WaveformRun {
    /// Test sessions and settings.
    pub test: WaveformTest,
    /// Monitor following the trigger counter.
    pub monitor: TriggerMonitor,
}

/// Waveform test orchestrator.
#[derive(Debug)]
pub struct Orchestrator<'a> {
    shim: &'a Shim,
    streams: &'a StreamManager,
    table: &'a RwLock<CalibrationTable>,
    prefill: PrefillConfig,
    calibration: CalibrationConfig,
    monitor: MonitorConfig,
}

impl<'a> Orchestrator<'a> {
    /// Creates an orchestrator.
    pub fn new(
        shim: &'a Shim,
        streams: &'a StreamManager,
        table: &'a RwLock<CalibrationTable>,
    ) -> Orchestrator<'a> {
        Orchestrator {
            shim,
            streams,
            table,
            prefill: PrefillConfig::default(),
            calibration: CalibrationConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }

    /// Sets the prefill tunables.
    pub fn with_prefill(mut self, prefill: PrefillConfig) -> Self {
        self.prefill = prefill;
        self
    }

    /// Sets the calibration tunables.
    pub fn with_calibration(mut self, calibration: CalibrationConfig) -> Self {
        self.calibration = calibration;
        self
    }

    /// Sets the trigger monitor tunables.
    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Runs a waveform test up to the synchronization barrier.
    ///
    /// On success, the streaming sessions of the test are running and the
    /// trigger unit is armed.
    pub async fn run(&self, request: &WaveformRequest) -> Result<WaveformRun, WaveformError> {
        let expected = validate(request, self.shim)?;
        let boards: Vec<u8> = request.boards.iter().map(|b| b.board).collect();
        tracing::info!(?boards, expected, mode = %request.loop_mode, "starting waveform test");

        // exclusive access from the buffer reset until every session runs
        let mut quiesced = self.streams.quiesce().await?;
        self.prepare(&quiesced, request).await?;
        let mut keys = Vec::new();
        if let Err(err) = self
            .start_streams(&mut quiesced, request, expected, &mut keys)
            .await
        {
            for &key in &keys {
                if let Err(stop_err) = quiesced.stop(key).await {
                    tracing::warn!("could not stop {key}: {stop_err}");
                }
            }
            return Err(err.into());
        }
        drop(quiesced);

        let prefill_timed_out = match self.prefill(request, &keys).await {
            Ok(()) => false,
            Err(fifos) => match request.prefill_timeout {
                PrefillTimeoutPolicy::Abort => {
                    tracing::error!(?fifos, "command FIFOs did not fill in time, aborting");
                    self.stop(&keys).await;
                    return Err(WaveformError::PrefillTimeout(fifos));
                }
                PrefillTimeoutPolicy::Proceed => {
                    tracing::warn!(?fifos, "command FIFOs did not fill in time, proceeding");
                    true
                }
            },
        };

        let barrier = Barrier {
            reset_counter: true,
            lockout: request.lockout,
            expected,
        };
        if let Err(err) = barrier.issue(self.shim.trigger()) {
            self.stop(&keys).await;
            return Err(err.into());
        }
        let monitor = TriggerMonitor::start(self.shim.trigger().clone(), expected, self.monitor);
        Ok(WaveformRun {
            test: WaveformTest {
                boards,
                expected_triggers: expected,
                keys,
                prefill_timed_out,
            },
            monitor,
        })
    }

    /// Buffer reset, calibration and buffer stoppers.
    async fn prepare(
        &self,
        quiesced: &Quiesced<'_>,
        request: &WaveformRequest,
    ) -> Result<(), WaveformError> {
        if request.reset_buffers {
            self.shim.system().reset_all_buffers();
        }
        if request.calibrate {
            let report = Calibrator::new(self.shim, self.calibration)
                .full(quiesced, self.table)
                .await?;
            tracing::info!(
                bias_channels = report.bias.len(),
                dac_channels = report.dac.len(),
                "calibration before waveform test finished"
            );
        }
        // a wait for one trigger on every command FIFO, so that no command
        // runs before the barrier
        for plan in &request.boards {
            if plan.dac.is_some() {
                self.shim
                    .dac(plan.board)
                    .map_err(CommandError::from)?
                    .noop(true, true, 1)?;
            }
            if plan.adc.is_some() {
                self.shim
                    .adc(plan.board)
                    .map_err(CommandError::from)?
                    .noop(true, true, 1)?;
            }
        }
        Ok(())
    }

    async fn start_streams(
        &self,
        quiesced: &mut Quiesced<'_>,
        request: &WaveformRequest,
        expected: u64,
        keys: &mut Vec<StreamKey>,
    ) -> Result<(), StreamError> {
        for plan in &request.boards {
            let board = plan.board;
            if let Some(dac) = &plan.dac {
                let key = StreamKey::DacCmd(board);
                quiesced
                    .start(key, command_job(dac, request.loop_mode))
                    .await?;
                keys.push(key);
            }
            if let (Some(adc), Some(output)) = (&plan.adc, &plan.output) {
                let key = StreamKey::AdcData(board);
                let biases = self.table.read().unwrap().board_biases(board);
                quiesced
                    .start(
                        key,
                        StreamJob::AdcData {
                            output: output.clone(),
                            samples: adc.script.samples() * u64::from(adc.loop_count),
                            format: request.format,
                            orders: adc.script.channel_orders(),
                            biases,
                        },
                    )
                    .await?;
                keys.push(key);
                let key = StreamKey::AdcCmd(board);
                quiesced
                    .start(key, command_job(adc, request.loop_mode))
                    .await?;
                keys.push(key);
            }
        }
        if let Some(output) = &request.trigger_output {
            let key = StreamKey::TriggerData;
            quiesced
                .start(
                    key,
                    StreamJob::TriggerData {
                        output: output.clone(),
                        records: expected,
                        format: request.format,
                    },
                )
                .await?;
            keys.push(key);
        }
        Ok(())
    }

    /// Waits until every command FIFO of the test holds enough words.
    ///
    /// Returns the FIFOs that are short of words on timeout.
    async fn prefill(
        &self,
        request: &WaveformRequest,
        keys: &[StreamKey],
    ) -> Result<(), Vec<FifoId>> {
        let mut targets = Vec::new();
        for plan in &request.boards {
            for (key, side) in [
                (StreamKey::DacCmd(plan.board), &plan.dac),
                (StreamKey::AdcCmd(plan.board), &plan.adc),
            ] {
                if let (Some(side), true) = (side, keys.contains(&key)) {
                    // the buffer stopper counts
                    let threshold = self
                        .prefill
                        .threshold
                        .min(side.words(request.loop_mode) + 1);
                    if let Ok(port) = self.shim.port(key.fifo()) {
                        targets.push((port, threshold));
                    }
                }
            }
        }
        let deadline = Instant::now() + self.prefill.timeout;
        loop {
            let short: Vec<FifoId> = targets
                .iter()
                .filter(|(port, threshold)| u64::from(port.status().word_count) < *threshold)
                .map(|(port, _)| port.id())
                .collect();
            if short.is_empty() {
                tracing::debug!("command FIFOs prefilled");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(short);
            }
            tokio::time::sleep(self.prefill.poll_interval).await;
        }
    }

    async fn stop(&self, keys: &[StreamKey]) {
        for &key in keys {
            if let Err(err) = self.streams.stop(key).await {
                tracing::warn!("could not stop {key}: {err}");
            }
        }
    }
}

fn command_job(side: &SidePlan, loop_mode: LoopMode) -> StreamJob {
    StreamJob::Command {
        script: Arc::clone(&side.script),
        loop_count: side.loop_count,
        loop_mode,
    }
}
