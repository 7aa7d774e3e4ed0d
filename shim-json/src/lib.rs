//! shim-json contains the JSON schemas used by the REST API of shim-httpd.

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};

/// API JSON schema.
///
/// This JSON schema corresponds to GET requests on `/api`. It contains the
/// state of the full shim system.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Api {
    /// Hardware status.
    pub system: SystemStatus,
    /// System control settings.
    pub control: SystemControl,
    /// Streaming sessions.
    pub streams: Streams,
    /// Trigger unit.
    pub trigger: Trigger,
    /// Calibration table.
    pub calibration: Calibration,
}

/// Versions JSON schema.
///
/// This JSON schema corresponds to GET requests on `/api/version`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Versions {
    /// Git version of shim-httpd.
    pub shim_httpd_git: String,
    /// Version of shim-httpd.
    pub shim_httpd_version: String,
}

/// System control JSON schema.
///
/// This JSON schema corresponds to GET requests on `/api/system`. It contains
/// the values of the system control registers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct SystemControl {
    /// The system is enabled.
    pub enable: bool,
    /// Over-current integrator threshold.
    pub integrator_threshold: u32,
    /// Over-current integrator window, in clock cycles.
    pub integrator_window: u32,
    /// Over-current integrator enable.
    pub integrator_enable: bool,
    /// Boot-time board test skip mask.
    pub boot_test_skip: u32,
    /// Debug mode.
    pub debug: u32,
    /// SPI MOSI polarity.
    pub mosi_pol: bool,
    /// SPI MISO polarity.
    pub miso_pol: bool,
}

/// System control PATCH JSON schema.
///
/// This JSON schema corresponds to PATCH requests on `/api/system`. Besides a
/// subset of the system control registers, it can request FIFO resets.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PatchSystemControl {
    /// The system is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    /// Over-current integrator threshold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrator_threshold: Option<u32>,
    /// Over-current integrator window, in clock cycles.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrator_window: Option<u32>,
    /// Over-current integrator enable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrator_enable: Option<bool>,
    /// Boot-time board test skip mask.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_test_skip: Option<u32>,
    /// Debug mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<u32>,
    /// SPI MOSI polarity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mosi_pol: Option<bool>,
    /// SPI MISO polarity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub miso_pol: Option<bool>,
    /// FIFO resets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset: Option<BufferReset>,
}

/// FIFO reset request.
///
/// Bit `b` of a mask selects the FIFOs of DAC board `b`, bit `8 + b` those of
/// ADC board `b`, and bit 16 those of the trigger unit.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct BufferReset {
    /// Command FIFOs to reset.
    pub cmd_mask: u32,
    /// Data FIFOs to reset.
    pub data_mask: u32,
}

macro_rules! get_fields {
    ($struct:ident, $x:expr, $($field:ident),*) => {
        $struct {
            $(
                $field: Some($x.$field),
            )*
            ..Default::default()
        }
    }
}

impl From<SystemControl> for PatchSystemControl {
    fn from(val: SystemControl) -> PatchSystemControl {
        get_fields!(
            PatchSystemControl,
            val,
            enable,
            integrator_threshold,
            integrator_window,
            integrator_enable,
            boot_test_skip,
            debug,
            mosi_pol,
            miso_pol
        )
    }
}

/// FIFO status JSON schema.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct FifoStatus {
    /// The FIFO exists in the hardware.
    pub present: bool,
    /// Number of words held.
    pub word_count: u32,
    /// The FIFO is full.
    pub full: bool,
    /// The FIFO is almost full.
    pub almost_full: bool,
    /// The FIFO is empty.
    pub empty: bool,
    /// The FIFO is almost empty.
    pub almost_empty: bool,
}

/// FIFOs of one board slot.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BoardFifos {
    /// Board index.
    pub board: u8,
    /// DAC command FIFO.
    pub dac_cmd: FifoStatus,
    /// DAC data FIFO.
    pub dac_data: FifoStatus,
    /// ADC command FIFO.
    pub adc_cmd: FifoStatus,
    /// ADC data FIFO.
    pub adc_data: FifoStatus,
}

/// Hardware status JSON schema.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct SystemStatus {
    /// State machine state.
    pub state: u8,
    /// Status or error code.
    pub code: u32,
    /// Board the code refers to.
    pub board: u8,
    /// FIFOs of every board slot.
    pub boards: Vec<BoardFifos>,
    /// Trigger command FIFO.
    pub trigger_cmd: FifoStatus,
    /// Trigger data FIFO.
    pub trigger_data: FifoStatus,
    /// External triggers counted by the hardware.
    pub trigger_count: u32,
    /// Debug registers.
    pub debug: Vec<u32>,
}

macro_rules! impl_str_conv {
    ($ty:ty, $($s:expr => $v:ident),*) => {
        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, String> {
                Ok(match s {
                    $(
                        $s => <$ty>::$v,
                    )*
                        _ => return Err(format!("invalid value: {s}")),
                })
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                write!(f, "{}", match self {
                    $(
                        <$ty>::$v => $s,
                    )*
                })
            }
        }
    }
}

/// Expansion of ADC loop markers.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum LoopMode {
    /// The instruction following a loop marker is written once per repetition.
    #[default]
    Unroll,
    /// A loop marker is written as a hardware repeat command followed by the
    /// instruction.
    Hardware,
}

impl_str_conv!(LoopMode,
               "unroll" => Unroll,
               "hardware" => Hardware);

/// Output file format of data streams.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum DataFormat {
    /// Decimal text.
    ///
    /// ADC samples are written 8 per line, trigger timestamps one per line.
    #[default]
    Ascii,
    /// Raw little-endian words, as read from the FIFO.
    Binary,
}

impl_str_conv!(DataFormat,
               "ascii" => Ascii,
               "binary" => Binary);

/// Streaming session kind.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Waveform commands into a DAC command FIFO.
    DacCmd,
    /// Sampling commands into an ADC command FIFO.
    AdcCmd,
    /// Samples out of an ADC data FIFO.
    AdcData,
    /// Timestamps out of the trigger data FIFO.
    TriggerData,
}

/// Streaming session state.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StreamState {
    /// The worker is running.
    Running,
    /// The worker has exited and its report has not been collected.
    Finished,
}

/// Reason why a streaming session ended.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StopReason {
    /// The session transferred everything it was asked to.
    Completed,
    /// The session was stopped before completing.
    Stopped,
    /// The hardware reported the FIFO as absent.
    FifoAbsent,
    /// The session failed (for instance, the output file could not be
    /// written).
    Failed,
}

/// Streaming session JSON schema.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Stream {
    /// Board index, or `None` for the trigger data session.
    pub board: Option<u8>,
    /// Session kind.
    pub kind: StreamKind,
    /// Session state.
    pub state: StreamState,
    /// Instructions sent (command streams), samples written (ADC data) or
    /// records written (trigger data) so far.
    pub progress: u64,
    /// Total that the session is to transfer.
    pub target: u64,
    /// Script or output file.
    pub path: String,
}

/// Final report of a streaming session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamReport {
    /// Board index, or `None` for the trigger data session.
    pub board: Option<u8>,
    /// Session kind.
    pub kind: StreamKind,
    /// Why the session ended.
    pub reason: StopReason,
    /// Instructions, samples or records transferred.
    pub progress: u64,
    /// Total that the session was to transfer.
    pub target: u64,
    /// Description of the failure, if the session failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Streaming sessions JSON schema.
///
/// This JSON schema corresponds to GET requests on `/api/streams`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Streams {
    /// Sessions that have not been stopped.
    pub sessions: Vec<Stream>,
    /// Last report of every session that has been stopped.
    pub reports: Vec<StreamReport>,
}

/// Streaming session PUT JSON schema.
///
/// This JSON schema corresponds to PUT requests on
/// `/api/streams/{board}/{kind}` and `/api/streams/trigger`. Command streams
/// use `script`, `loop_count` and `loop_mode`. Data streams use `output`,
/// `count` and `format`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PutStream {
    /// Waveform command file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Number of times the script is played.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_count: Option<u32>,
    /// Loop marker expansion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_mode: Option<LoopMode>,
    /// Output file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Number of samples (ADC data) or timestamps (trigger data) to capture.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    /// Output file format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<DataFormat>,
}

/// Trigger unit JSON schema.
///
/// This JSON schema corresponds to GET requests on `/api/trigger`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Trigger {
    /// External triggers counted by the hardware.
    pub count: u32,
    /// Last lockout set, in clock cycles.
    pub lockout: u32,
    /// Trigger monitor, if running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor: Option<TriggerMonitor>,
}

/// Trigger monitor JSON schema.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TriggerMonitor {
    /// Number of triggers the monitor waits for.
    pub expected: u64,
    /// Last counter value seen by the monitor.
    pub last_count: u64,
    /// Whether the monitor is still polling the counter.
    pub running: bool,
}

/// Trigger unit command.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TriggerCommand {
    /// Synchronize the trigger state of every subsystem.
    Sync {
        /// Also clear the trigger counter.
        reset_counter: bool,
    },
    /// Issue triggers.
    Force {
        /// Number of triggers.
        count: u32,
    },
    /// Delay the following trigger command.
    Delay {
        /// Delay in clock cycles.
        cycles: u32,
    },
    /// Arm the counting of external triggers.
    Expect {
        /// Number of triggers.
        count: u32,
    },
    /// Flush the trigger command FIFO.
    Cancel,
    /// Start the trigger monitor.
    StartMonitor {
        /// Number of triggers to wait for.
        expected: u64,
    },
    /// Stop the trigger monitor.
    StopMonitor,
}

/// Trigger unit PATCH JSON schema.
///
/// This JSON schema corresponds to PATCH requests on `/api/trigger`.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct PatchTrigger {
    /// Lockout, in clock cycles.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lockout: Option<u32>,
    /// Command to issue after setting the lockout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<TriggerCommand>,
}

/// Calibration table JSON schema.
///
/// This JSON schema corresponds to GET requests on `/api/calibration`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Calibration {
    /// Entries of the 64 channels.
    pub channels: Vec<CalibrationChannel>,
    /// Report of the last calibration run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_report: Option<CalibrationReport>,
}

/// Calibration entry of one channel.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
pub struct CalibrationChannel {
    /// Global channel index (`board * 8 + channel_index`).
    pub channel: u8,
    /// Board index.
    pub board: u8,
    /// Channel index within the board.
    pub channel_index: u8,
    /// ADC bias.
    pub bias: f64,
    /// The bias is valid.
    pub valid: bool,
    /// Bias before the last calibration.
    pub previous_bias: f64,
    /// Validity of the bias before the last calibration.
    pub previous_valid: bool,
    /// Standard deviation of the samples used to measure the bias.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub std_dev: Option<f64>,
}

/// Calibration command.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub enum CalibrationCommand {
    /// DAC offset calibration.
    DacOffset,
    /// ADC bias calibration.
    AdcBias,
    /// ADC bias calibration followed by DAC offset calibration.
    Full,
    /// Load the bias table from a CSV file.
    Load {
        /// CSV file.
        path: String,
    },
    /// Save the bias table to a CSV file.
    Save {
        /// CSV file.
        path: String,
    },
}

/// Calibration PATCH JSON schema.
///
/// This JSON schema corresponds to PATCH requests on `/api/calibration`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatchCalibration {
    /// Command to run.
    pub command: CalibrationCommand,
}

/// Outcome of the DAC offset calibration of one channel.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DacOutcome {
    /// The offset was corrected.
    Ok,
    /// The regression slope is negative or too far from one.
    PoorLinearity,
    /// All the DAC test values are equal, so no regression is possible.
    DivisionByZero,
    /// The ADC did not return data.
    NoData,
}

/// DAC offset calibration result of one channel.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
pub struct DacChannelReport {
    /// Global channel index.
    pub channel: u8,
    /// Outcome.
    pub outcome: DacOutcome,
    /// Regression slope of the last iteration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slope: Option<f64>,
    /// Regression intercept of the last iteration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intercept: Option<f64>,
    /// Calibration value before the run.
    pub previous_cal: i32,
    /// Calibration value after the run.
    pub cal: i32,
    /// Iterations performed.
    pub iterations: u32,
}

/// Outcome of the ADC bias calibration of one channel.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BiasOutcome {
    /// The bias was measured.
    Ok,
    /// The ADC input follows the DAC, so it is not unplugged.
    Plugged,
    /// The ADC did not return data.
    NoData,
}

/// ADC bias calibration result of one channel.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
pub struct BiasChannelReport {
    /// Global channel index.
    pub channel: u8,
    /// Outcome.
    pub outcome: BiasOutcome,
    /// Slope of the unplugged check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slope: Option<f64>,
    /// Measured bias.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bias: Option<f64>,
    /// Standard deviation of the bias samples.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub std_dev: Option<f64>,
    /// Bias before the run.
    pub previous_bias: f64,
    /// Validity of the bias before the run.
    pub previous_valid: bool,
}

/// Calibration run report.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct CalibrationReport {
    /// ADC bias results.
    pub bias: Vec<BiasChannelReport>,
    /// DAC offset results.
    pub dac: Vec<DacChannelReport>,
}

/// Command script and loop count of one side of a board.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaveformSide {
    /// Waveform command file.
    pub script: String,
    /// Number of times the script is played.
    pub loop_count: u32,
}

/// Waveform test settings of one board.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaveformBoard {
    /// Board index.
    pub board: u8,
    /// DAC command script.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dac: Option<WaveformSide>,
    /// ADC command script.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adc: Option<WaveformSide>,
    /// Output file of the ADC samples. Required if `adc` is given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Action taken when the command FIFOs do not fill before the barrier.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum PrefillTimeoutPolicy {
    /// Stop every started session and fail.
    #[default]
    Abort,
    /// Issue the barrier anyway.
    Proceed,
}

/// Waveform test PUT JSON schema.
///
/// This JSON schema corresponds to PUT requests on `/api/waveform`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct PutWaveform {
    /// Boards taking part in the test.
    pub boards: Vec<WaveformBoard>,
    /// Reset every FIFO before starting.
    #[serde(default)]
    pub reset_buffers: bool,
    /// Run the full calibration before starting.
    #[serde(default)]
    pub calibrate: bool,
    /// Output file of the trigger timestamps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_output: Option<String>,
    /// Loop marker expansion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_mode: Option<LoopMode>,
    /// Output file format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<DataFormat>,
    /// Trigger lockout, in clock cycles.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lockout: Option<u32>,
    /// Action if the command FIFOs do not fill in time.
    #[serde(default)]
    pub prefill_timeout: PrefillTimeoutPolicy,
}

/// Waveform test JSON schema.
///
/// This JSON schema is returned by PUT requests on `/api/waveform`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Waveform {
    /// Boards taking part in the test.
    pub boards: Vec<u8>,
    /// External triggers the test expects.
    pub expected_triggers: u64,
    /// Sessions started by the test.
    pub streams: Vec<Stream>,
    /// The command FIFOs did not fill in time and the barrier was issued
    /// anyway.
    pub prefill_timed_out: bool,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn str_conv() {
        assert_eq!("hardware".parse::<LoopMode>(), Ok(LoopMode::Hardware));
        assert_eq!(DataFormat::Binary.to_string(), "binary");
        assert!("text".parse::<DataFormat>().is_err());
    }

    #[test]
    fn patch_from_control() {
        let control = SystemControl {
            enable: true,
            integrator_threshold: 1,
            integrator_window: 2,
            integrator_enable: false,
            boot_test_skip: 0,
            debug: 0,
            mosi_pol: false,
            miso_pol: true,
        };
        let patch = PatchSystemControl::from(control);
        assert_eq!(patch.enable, Some(true));
        assert_eq!(patch.miso_pol, Some(true));
        assert_eq!(patch.reset, None);
    }
}
