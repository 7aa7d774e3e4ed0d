//! Calibration engine.
//!
//! Two calibrations are supported, both using the loopback from each DAC
//! channel to the ADC channel with the same index on the same board:
//!
//! - The ADC bias calibration first checks that every ADC input is unplugged
//!   (its reading does not follow the DAC), and then measures the DC offset of
//!   each input with the DAC held at zero. The result is stored in the
//!   [`CalibrationTable`], which the ADC data streams use to correct samples.
//!
//! - The DAC offset calibration fits a straight line to the ADC readback of a
//!   few DAC test values and corrects the calibration register of the DAC
//!   channel by the intercept of the fit.

use crate::protocol::MAX_CAL;
use crate::regs::{CHANNELS_PER_BOARD, NUM_CHANNELS};
use crate::shim::{CommandError, Shim};
use crate::stream::{Quiesced, StreamError};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
pub use shim_json::{
    BiasChannelReport, BiasOutcome, CalibrationReport, DacChannelReport, DacOutcome,
};
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

/// DAC values used by both calibrations.
pub const DAC_TEST_VALUES: [i32; 5] = [-3276, -1638, 0, 1638, 3276];

/// Bias entry of one channel.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct ChannelBias {
    /// Bias, in ADC units.
    pub bias: f64,
    /// The bias has been measured or loaded.
    pub valid: bool,
    /// Bias before the last update.
    pub previous_bias: f64,
    /// Validity before the last update.
    pub previous_valid: bool,
    /// Standard deviation of the samples of the last measurement.
    pub std_dev: Option<f64>,
}

impl ChannelBias {
    fn update(&mut self, bias: f64, valid: bool, std_dev: Option<f64>) {
        self.previous_bias = self.bias;
        self.previous_valid = self.valid;
        self.bias = bias;
        self.valid = valid;
        self.std_dev = std_dev;
    }

    /// Returns the bias if it is valid.
    pub fn valid_bias(&self) -> Option<f64> {
        self.valid.then_some(self.bias)
    }
}

/// ADC bias table.
///
/// The table holds one entry for each of the 64 global channels
/// (`board * 8 + channel`).
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    channels: Vec<ChannelBias>,
}

impl Default for CalibrationTable {
    fn default() -> CalibrationTable {
        CalibrationTable::new()
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct CsvRow {
    #[serde(rename = "Channel")]
    channel: usize,
    #[serde(rename = "Board")]
    board: usize,
    #[serde(rename = "Channel_Index")]
    channel_index: usize,
    #[serde(rename = "Bias_Value")]
    bias: f64,
    #[serde(rename = "Valid")]
    valid: bool,
}

impl CalibrationTable {
    /// Creates a table where no bias is valid.
    pub fn new() -> CalibrationTable {
        CalibrationTable {
            channels: vec![ChannelBias::default(); NUM_CHANNELS],
        }
    }

    /// Returns the entry of a global channel.
    ///
    /// # Panics
    ///
    /// Panics if `channel` is not smaller than 64.
    pub fn get(&self, channel: usize) -> &ChannelBias {
        &self.channels[channel]
    }

    /// Returns the valid bias of a global channel.
    pub fn bias(&self, channel: usize) -> Option<f64> {
        self.channels.get(channel).and_then(ChannelBias::valid_bias)
    }

    /// Returns the valid biases of the 8 channels of a board.
    pub fn board_biases(&self, board: u8) -> [Option<f64>; CHANNELS_PER_BOARD] {
        std::array::from_fn(|n| self.bias(usize::from(board) * CHANNELS_PER_BOARD + n))
    }

    /// Sets the bias of a global channel, keeping the old value as the
    /// previous one.
    pub fn set_bias(&mut self, channel: usize, bias: f64, std_dev: Option<f64>) {
        self.channels[channel].update(bias, true, std_dev);
    }

    /// Returns the table as JSON.
    pub fn json(&self, last_report: Option<CalibrationReport>) -> shim_json::Calibration {
        shim_json::Calibration {
            channels: self
                .channels
                .iter()
                .enumerate()
                .map(|(n, c)| shim_json::CalibrationChannel {
                    channel: n as u8,
                    board: (n / CHANNELS_PER_BOARD) as u8,
                    channel_index: (n % CHANNELS_PER_BOARD) as u8,
                    bias: c.bias,
                    valid: c.valid,
                    previous_bias: c.previous_bias,
                    previous_valid: c.previous_valid,
                    std_dev: c.std_dev,
                })
                .collect(),
            last_report,
        }
    }

    /// Formats the table as CSV.
    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for (n, c) in self.channels.iter().enumerate() {
            writer.serialize(CsvRow {
                channel: n,
                board: n / CHANNELS_PER_BOARD,
                channel_index: n % CHANNELS_PER_BOARD,
                bias: c.bias,
                valid: c.valid,
            })?;
        }
        writer
            .into_inner()
            .map_err(|err| anyhow::anyhow!("failed to flush CSV writer: {}", err.error()))
    }

    /// Updates the table from CSV.
    ///
    /// Every row must name a channel in range with a consistent board and
    /// channel index. Channels without a row become invalid. The table is left
    /// untouched if any row is wrong.
    pub fn update_from_csv(&mut self, csv: &[u8]) -> Result<()> {
        let mut loaded = vec![None; NUM_CHANNELS];
        let mut reader = csv::Reader::from_reader(csv);
        for (line, row) in reader.deserialize::<CsvRow>().enumerate() {
            let row = row.with_context(|| format!("invalid CSV row {}", line + 1))?;
            anyhow::ensure!(
                row.channel < NUM_CHANNELS
                    && row.board == row.channel / CHANNELS_PER_BOARD
                    && row.channel_index == row.channel % CHANNELS_PER_BOARD,
                "CSV row {} has inconsistent channel {}, board {} and index {}",
                line + 1,
                row.channel,
                row.board,
                row.channel_index
            );
            loaded[row.channel] = Some((row.bias, row.valid));
        }
        for (entry, loaded) in self.channels.iter_mut().zip(loaded) {
            let (bias, valid) = loaded.unwrap_or((0.0, false));
            entry.update(bias, valid, None);
        }
        Ok(())
    }
}

/// Loads a bias table from a CSV file.
pub async fn load_table(table: &RwLock<CalibrationTable>, path: &Path) -> Result<()> {
    let csv = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut table = table.write().unwrap();
    table
        .update_from_csv(&csv)
        .with_context(|| format!("failed to load {}", path.display()))?;
    tracing::info!(
        path = %path.display(),
        valid = table.channels.iter().filter(|c| c.valid).count(),
        "loaded calibration table"
    );
    Ok(())
}

/// Saves a bias table to a CSV file.
pub async fn save_table(table: &RwLock<CalibrationTable>, path: &Path) -> Result<()> {
    let csv = table.read().unwrap().to_csv()?;
    tokio::fs::write(path, csv)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), "saved calibration table");
    Ok(())
}

/// Whole-run calibration failure.
#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    /// No board has both its DAC and its ADC connected.
    #[error("no board has both DAC and ADC connected")]
    NoBoards,
    /// Some ADC inputs follow the DAC or return no data, so the bias cannot be
    /// measured. The table is left unchanged.
    #[error("ADC bias calibration aborted: channels {channels:?} failed the unplugged check")]
    NotUnplugged {
        /// Global channels that failed.
        channels: Vec<u8>,
        /// Results of every checked channel.
        report: Vec<BiasChannelReport>,
    },
    /// Some ADC inputs passed the unplugged check but returned no data while
    /// their bias was measured. The table is left unchanged.
    #[error("ADC bias calibration aborted: no bias data for channels {channels:?}")]
    Incomplete {
        /// Global channels without a bias.
        channels: Vec<u8>,
        /// Results of every checked channel.
        report: Vec<BiasChannelReport>,
    },
    /// Streaming sessions are running.
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// A command could not be issued.
    #[error(transparent)]
    Command(#[from] CommandError),
}

impl CalibrationError {
    /// Returns the per-channel results of an aborted ADC bias calibration.
    pub fn bias_report(&self) -> Option<&[BiasChannelReport]> {
        match self {
            CalibrationError::NotUnplugged { report, .. }
            | CalibrationError::Incomplete { report, .. } => Some(report),
            _ => None,
        }
    }
}

/// Calibration tunables.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CalibrationConfig {
    /// Maximum wait for each ADC sample or calibration readback.
    pub readback_timeout: Duration,
    /// Wait after each DAC write.
    pub settle: Duration,
    /// ADC samples averaged for each DAC test value in the offset
    /// calibration.
    pub dac_readbacks: u32,
    /// Maximum number of offset corrections per channel.
    pub max_iterations: u32,
    /// Allowed range of the regression slope in the offset calibration.
    pub slope_min: f64,
    /// See `slope_min`.
    pub slope_max: f64,
    /// ADC samples for each DAC test value in the unplugged check.
    pub sweep_samples: u32,
    /// Maximum absolute slope of an unplugged input.
    pub unplugged_slope: f64,
    /// ADC samples averaged to measure a bias.
    pub bias_samples: u32,
}

impl Default for CalibrationConfig {
    fn default() -> CalibrationConfig {
        CalibrationConfig {
            readback_timeout: Duration::from_secs(1),
            settle: Duration::from_millis(1),
            dac_readbacks: 10,
            max_iterations: 3,
            slope_min: 0.95,
            slope_max: 1.05,
            sweep_samples: 5,
            unplugged_slope: 0.1,
            bias_samples: 50,
        }
    }
}

/// Ordinary least squares fit of `y = slope * x + intercept`.
///
/// Returns `None` if the denominator of the fit is zero.
pub fn linear_fit(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    let n = points.len() as f64;
    let sx: f64 = points.iter().map(|p| p.0).sum();
    let sy: f64 = points.iter().map(|p| p.1).sum();
    let sxx: f64 = points.iter().map(|p| p.0 * p.0).sum();
    let sxy: f64 = points.iter().map(|p| p.0 * p.1).sum();
    let denominator = n * sxx - sx * sx;
    if denominator == 0.0 {
        return None;
    }
    let slope = (n * sxy - sx * sy) / denominator;
    let intercept = (sy - slope * sx) / n;
    Some((slope, intercept))
}

/// Mean and sample standard deviation.
///
/// The standard deviation is `None` with fewer than two samples.
pub fn mean_std(samples: &[f64]) -> Option<(f64, Option<f64>)> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let std_dev = (samples.len() > 1).then(|| {
        let sum_sq: f64 = samples.iter().map(|x| (x - mean).powi(2)).sum();
        (sum_sq / (n - 1.0)).sqrt()
    });
    Some((mean, std_dev))
}

/// Channel being calibrated.
#[derive(Debug, Copy, Clone)]
struct Channel {
    board: u8,
    index: u8,
}

impl Channel {
    fn global(&self) -> usize {
        usize::from(self.board) * CHANNELS_PER_BOARD + usize::from(self.index)
    }
}

/// Calibration engine.
///
/// The engine issues single commands to the boards, so it needs exclusive
/// access to the hardware: every run takes a [`Quiesced`] guard from the
/// streaming session manager.
#[derive(Debug)]
pub struct Calibrator<'a> {
    shim: &'a Shim,
    config: CalibrationConfig,
}

impl<'a> Calibrator<'a> {
    /// Creates a calibration engine for `shim`.
    pub fn new(shim: &'a Shim, config: CalibrationConfig) -> Calibrator<'a> {
        Calibrator { shim, config }
    }

    fn channels(&self) -> Result<Vec<Channel>, CalibrationError> {
        let boards = self.shim.connected_boards().both();
        if boards.is_empty() {
            return Err(CalibrationError::NoBoards);
        }
        Ok(boards
            .into_iter()
            .flat_map(|board| {
                (0..CHANNELS_PER_BOARD as u8).map(move |index| Channel { board, index })
            })
            .collect())
    }

    /// Discards stale samples and calibration readbacks.
    fn drain(&self, channels: &[Channel]) -> Result<(), CalibrationError> {
        for channel in channels.iter().filter(|c| c.index == 0) {
            self.shim.adc(channel.board).map_err(CommandError::from)?.data().drain();
            self.shim.dac(channel.board).map_err(CommandError::from)?.data().drain();
        }
        Ok(())
    }

    async fn set_dac(&self, channel: Channel, value: i32) -> Result<(), CommandError> {
        self.shim
            .dac(channel.board)?
            .write_channel(channel.index, value)?;
        tokio::time::sleep(self.config.settle).await;
        Ok(())
    }

    /// Reads `count` ADC samples of a channel, subtracting `bias`.
    ///
    /// Returns `Ok(None)` if the ADC does not return data in time.
    async fn read_adc(
        &self,
        channel: Channel,
        count: u32,
        bias: Option<f64>,
    ) -> Result<Option<Vec<f64>>, CommandError> {
        let adc = self.shim.adc(channel.board)?;
        let mut samples = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match adc
                .read_channel(channel.index, self.config.readback_timeout)
                .await
            {
                Ok(sample) => samples.push(f64::from(sample) - bias.unwrap_or(0.0)),
                Err(CommandError::Timeout(fifo)) => {
                    tracing::error!(%fifo, channel = channel.global(), "no ADC data");
                    return Ok(None);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(Some(samples))
    }

    /// Sweeps the DAC test values and returns the mean ADC reading at each of
    /// them, or `None` if the ADC returns no data.
    async fn sweep(
        &self,
        channel: Channel,
        samples: u32,
        bias: Option<f64>,
    ) -> Result<Option<Vec<(f64, f64)>>, CommandError> {
        let mut points = Vec::with_capacity(DAC_TEST_VALUES.len());
        for value in DAC_TEST_VALUES {
            self.set_dac(channel, value).await?;
            let Some(readings) = self.read_adc(channel, samples, bias).await? else {
                return Ok(None);
            };
            let Some((mean, _)) = mean_std(&readings) else {
                return Ok(None);
            };
            points.push((f64::from(value), mean));
        }
        self.set_dac(channel, 0).await?;
        Ok(Some(points))
    }

    /// Runs the ADC bias calibration.
    ///
    /// If any channel fails the unplugged check or returns no data for its
    /// bias, the run is aborted and `table` is left unchanged. Otherwise every
    /// checked channel gets a new valid bias.
    pub async fn adc_bias(
        &self,
        _quiesced: &Quiesced<'_>,
        table: &RwLock<CalibrationTable>,
    ) -> Result<Vec<BiasChannelReport>, CalibrationError> {
        let channels = self.channels()?;
        tracing::info!(channels = channels.len(), "starting ADC bias calibration");
        self.drain(&channels)?;
        let previous = table.read().unwrap().clone();

        let mut reports = Vec::with_capacity(channels.len());
        let mut failed = Vec::new();
        for &channel in &channels {
            let global = channel.global();
            let entry = previous.get(global);
            let mut report = BiasChannelReport {
                channel: global as u8,
                outcome: BiasOutcome::Ok,
                slope: None,
                bias: None,
                std_dev: None,
                previous_bias: entry.bias,
                previous_valid: entry.valid,
            };
            match self.sweep(channel, self.config.sweep_samples, None).await? {
                None => report.outcome = BiasOutcome::NoData,
                Some(points) => match linear_fit(&points) {
                    Some((slope, _)) => {
                        report.slope = Some(slope);
                        if slope.abs() > self.config.unplugged_slope {
                            report.outcome = BiasOutcome::Plugged;
                        }
                    }
                    None => report.outcome = BiasOutcome::NoData,
                },
            }
            if report.outcome != BiasOutcome::Ok {
                tracing::warn!(
                    channel = global,
                    outcome = ?report.outcome,
                    slope = report.slope,
                    "ADC input failed the unplugged check"
                );
                failed.push(global as u8);
            }
            reports.push(report);
        }
        if !failed.is_empty() {
            return Err(CalibrationError::NotUnplugged {
                channels: failed,
                report: reports,
            });
        }

        for &channel in &channels {
            self.set_dac(channel, 0).await?;
        }
        let mut measured = Vec::with_capacity(channels.len());
        for (&channel, report) in channels.iter().zip(reports.iter_mut()) {
            match self
                .read_adc(channel, self.config.bias_samples, None)
                .await?
                .as_deref()
                .and_then(mean_std)
            {
                Some((bias, std_dev)) => {
                    report.bias = Some(bias);
                    report.std_dev = std_dev;
                    measured.push((channel.global(), bias, std_dev));
                }
                None => {
                    tracing::warn!(channel = channel.global(), "no ADC data for the bias");
                    report.outcome = BiasOutcome::NoData;
                    failed.push(channel.global() as u8);
                }
            }
        }
        if !failed.is_empty() {
            return Err(CalibrationError::Incomplete {
                channels: failed,
                report: reports,
            });
        }

        let mut table = table.write().unwrap();
        for (global, bias, std_dev) in measured {
            tracing::info!(
                channel = global,
                bias,
                std_dev,
                previous_bias = table.get(global).bias,
                "measured ADC bias"
            );
            table.set_bias(global, bias, std_dev);
        }
        Ok(reports)
    }

    async fn dac_offset_channel(
        &self,
        channel: Channel,
        bias: Option<f64>,
    ) -> Result<DacChannelReport, CommandError> {
        let dac = self.shim.dac(channel.board)?;
        let mut report = DacChannelReport {
            channel: channel.global() as u8,
            outcome: DacOutcome::NoData,
            slope: None,
            intercept: None,
            previous_cal: 0,
            cal: 0,
            iterations: 0,
        };
        let cal = match dac
            .get_cal(channel.index, self.config.readback_timeout)
            .await
        {
            Ok(cal) => cal,
            Err(CommandError::Timeout(_)) => return Ok(report),
            Err(err) => return Err(err),
        };
        report.previous_cal = cal;
        report.cal = cal;
        while report.iterations < self.config.max_iterations {
            report.iterations += 1;
            let Some(points) = self
                .sweep(channel, self.config.dac_readbacks, bias)
                .await?
            else {
                report.outcome = DacOutcome::NoData;
                break;
            };
            let Some((slope, intercept)) = linear_fit(&points) else {
                report.outcome = DacOutcome::DivisionByZero;
                break;
            };
            report.slope = Some(slope);
            report.intercept = Some(intercept);
            if !(self.config.slope_min..=self.config.slope_max).contains(&slope) {
                report.outcome = DacOutcome::PoorLinearity;
                break;
            }
            report.outcome = DacOutcome::Ok;
            let adjustment = intercept.round() as i32;
            if adjustment == 0 {
                break;
            }
            report.cal = (report.cal - adjustment).clamp(-MAX_CAL, MAX_CAL);
            dac.set_cal(channel.index, report.cal)?;
            tracing::debug!(
                channel = report.channel,
                iteration = report.iterations,
                slope,
                intercept,
                cal = report.cal,
                "corrected DAC offset"
            );
        }
        Ok(report)
    }

    /// Runs the DAC offset calibration.
    ///
    /// ADC readings are corrected with the valid biases in `table`.
    pub async fn dac_offset(
        &self,
        _quiesced: &Quiesced<'_>,
        table: &RwLock<CalibrationTable>,
    ) -> Result<Vec<DacChannelReport>, CalibrationError> {
        let channels = self.channels()?;
        tracing::info!(channels = channels.len(), "starting DAC offset calibration");
        self.drain(&channels)?;
        let biases = table.read().unwrap().clone();
        let mut reports = Vec::with_capacity(channels.len());
        for channel in channels {
            let report = self
                .dac_offset_channel(channel, biases.bias(channel.global()))
                .await?;
            if report.outcome == DacOutcome::Ok {
                tracing::info!(
                    channel = report.channel,
                    previous_cal = report.previous_cal,
                    cal = report.cal,
                    iterations = report.iterations,
                    "calibrated DAC offset"
                );
            } else {
                tracing::warn!(
                    channel = report.channel,
                    outcome = ?report.outcome,
                    slope = report.slope,
                    "DAC offset calibration failed"
                );
            }
            reports.push(report);
        }
        Ok(reports)
    }

    /// Runs the ADC bias calibration followed by the DAC offset calibration.
    pub async fn full(
        &self,
        quiesced: &Quiesced<'_>,
        table: &RwLock<CalibrationTable>,
    ) -> Result<CalibrationReport, CalibrationError> {
        let bias = self.adc_bias(quiesced, table).await?;
        let dac = self.dac_offset(quiesced, table).await?;
        Ok(CalibrationReport { bias, dac })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimShim;
    use crate::stream::{StreamConfig, StreamManager};
    use std::sync::Arc;

    fn manager(sim: &SimShim) -> StreamManager {
        StreamManager::new(Arc::clone(&sim.shim), StreamConfig::default())
    }

    #[test]
    fn fit() {
        let points: Vec<_> = DAC_TEST_VALUES
            .iter()
            .map(|&x| (f64::from(x), 2.0 * f64::from(x) - 7.0))
            .collect();
        let (slope, intercept) = linear_fit(&points).unwrap();
        assert!((slope - 2.0).abs() < 1e-9);
        assert!((intercept + 7.0).abs() < 1e-9);
        assert_eq!(linear_fit(&[(1.0, 2.0), (1.0, 3.0)]), None);
        let (mean, std) = mean_std(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(mean, 2.5);
        assert!((std.unwrap() - 1.290_994_448_7).abs() < 1e-9);
        assert_eq!(mean_std(&[5.0]), Some((5.0, None)));
    }

    #[test]
    fn csv_round_trip() {
        let mut table = CalibrationTable::new();
        table.set_bias(0, 1.5, Some(0.2));
        table.set_bias(63, -12.25, None);
        let csv = table.to_csv().unwrap();
        let text = String::from_utf8(csv.clone()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("Channel,Board,Channel_Index,Bias_Value,Valid"));
        assert_eq!(lines.next(), Some("0,0,0,1.5,true"));
        assert_eq!(lines.next(), Some("1,0,1,0.0,false"));
        assert_eq!(text.lines().last(), Some("63,7,7,-12.25,true"));

        let mut loaded = CalibrationTable::new();
        loaded.update_from_csv(&csv).unwrap();
        assert_eq!(loaded.bias(0), Some(1.5));
        assert_eq!(loaded.bias(63), Some(-12.25));
        assert_eq!(loaded.bias(1), None);
        assert!(!loaded.get(0).previous_valid);
    }

    #[tokio::test]
    async fn load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bias.csv");
        let table = RwLock::new(CalibrationTable::new());
        table.write().unwrap().set_bias(9, -2.5, None);
        save_table(&table, &path).await.unwrap();
        let loaded = RwLock::new(CalibrationTable::new());
        load_table(&loaded, &path).await.unwrap();
        assert_eq!(loaded.read().unwrap().bias(9), Some(-2.5));
        assert!(load_table(&loaded, &dir.path().join("missing.csv"))
            .await
            .is_err());
    }

    #[test]
    fn csv_rejects_inconsistent_rows() {
        let mut table = CalibrationTable::new();
        table.set_bias(3, 4.0, None);
        let before = table.clone();
        let csv = b"Channel,Board,Channel_Index,Bias_Value,Valid\n3,1,3,2.0,true\n";
        assert!(table.update_from_csv(csv).is_err());
        assert_eq!(table, before);
    }

    #[tokio::test]
    async fn bias_calibration_aborts_on_plugged_channel() {
        let sim = SimShim::builder().loopback(0).build();
        sim.loopback(0).unplug_all();
        sim.loopback(0).set_gain(5, 0.5);
        let streams = manager(&sim);
        let quiesced = streams.quiesce().await.unwrap();
        let table = RwLock::new(CalibrationTable::new());
        let calibrator = Calibrator::new(&sim.shim, CalibrationConfig::default());
        match calibrator.adc_bias(&quiesced, &table).await {
            Err(CalibrationError::NotUnplugged { channels, report }) => {
                assert_eq!(channels, vec![5]);
                assert_eq!(report.len(), 8);
                assert_eq!(report[5].outcome, BiasOutcome::Plugged);
                assert!((report[5].slope.unwrap() - 0.5).abs() < 0.01);
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(*table.read().unwrap(), CalibrationTable::new());
    }

    #[tokio::test]
    async fn bias_calibration_is_all_or_nothing() {
        let sim = SimShim::builder().loopback(0).build();
        let lb = sim.loopback(0);
        lb.unplug_all();
        lb.set_offset(0, 4.0);
        // the unplugged check takes 8 * 5 * 5 samples, and then only two
        // channels get their 50 bias samples
        lb.set_sample_limit(300);
        let streams = manager(&sim);
        let quiesced = streams.quiesce().await.unwrap();
        let mut initial = CalibrationTable::new();
        initial.set_bias(0, 1.0, None);
        let table = RwLock::new(initial.clone());
        let config = CalibrationConfig {
            readback_timeout: Duration::from_millis(2),
            ..Default::default()
        };
        let calibrator = Calibrator::new(&sim.shim, config);
        let err = calibrator.adc_bias(&quiesced, &table).await.unwrap_err();
        match &err {
            CalibrationError::Incomplete { channels, report } => {
                assert_eq!(channels, &[2, 3, 4, 5, 6, 7]);
                assert_eq!(report[0].outcome, BiasOutcome::Ok);
                assert_eq!(report[0].bias, Some(4.0));
                assert_eq!(report[2].outcome, BiasOutcome::NoData);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.bias_report().map(|r| r.len()), Some(8));
        assert_eq!(*table.read().unwrap(), initial);
    }

    #[tokio::test]
    async fn bias_calibration_measures_offsets() {
        let sim = SimShim::builder().loopback(2).build();
        let lb = sim.loopback(2);
        lb.unplug_all();
        lb.set_offset(1, 12.0);
        lb.set_noise(1, 2.0);
        lb.set_offset(7, -3.0);
        let streams = manager(&sim);
        let quiesced = streams.quiesce().await.unwrap();
        let table = RwLock::new(CalibrationTable::new());
        let calibrator = Calibrator::new(&sim.shim, CalibrationConfig::default());
        let reports = calibrator.adc_bias(&quiesced, &table).await.unwrap();
        assert_eq!(reports.len(), 8);
        assert!(reports.iter().all(|r| r.outcome == BiasOutcome::Ok));
        let table = table.read().unwrap();
        assert_eq!(table.bias(17), Some(12.0));
        assert!(table.get(17).std_dev.unwrap() > 1.9);
        assert_eq!(table.bias(23), Some(-3.0));
        assert_eq!(table.bias(16), Some(0.0));
        assert_eq!(table.bias(0), None);
        assert!(!table.get(17).previous_valid);
        assert_eq!(table.board_biases(2)[1], Some(12.0));
    }

    #[tokio::test]
    async fn dac_offset_calibration_corrects_intercept() {
        let sim = SimShim::builder().loopback(0).build();
        sim.loopback(0).set_offset(3, 20.0);
        sim.loopback(0).set_gain(6, 0.5);
        let streams = manager(&sim);
        let quiesced = streams.quiesce().await.unwrap();
        let table = RwLock::new(CalibrationTable::new());
        let calibrator = Calibrator::new(&sim.shim, CalibrationConfig::default());
        let reports = calibrator.dac_offset(&quiesced, &table).await.unwrap();
        assert_eq!(reports.len(), 8);
        assert_eq!(reports[3].outcome, DacOutcome::Ok);
        assert_eq!(reports[3].previous_cal, 0);
        assert_eq!(reports[3].cal, -20);
        assert_eq!(reports[3].iterations, 2);
        assert_eq!(sim.loopback(0).cal(3), -20);
        assert_eq!(reports[0].cal, 0);
        assert_eq!(reports[0].iterations, 1);
        assert_eq!(reports[6].outcome, DacOutcome::PoorLinearity);
        assert_eq!(sim.loopback(0).cal(6), 0);
    }

    #[tokio::test]
    async fn dac_offset_uses_bias() {
        let sim = SimShim::builder().loopback(0).build();
        sim.loopback(0).set_offset(2, 20.0);
        let streams = manager(&sim);
        let quiesced = streams.quiesce().await.unwrap();
        let mut table = CalibrationTable::new();
        table.set_bias(2, 20.0, None);
        let table = RwLock::new(table);
        let calibrator = Calibrator::new(&sim.shim, CalibrationConfig::default());
        let reports = calibrator.dac_offset(&quiesced, &table).await.unwrap();
        assert_eq!(reports[2].cal, 0);
    }

    #[tokio::test]
    async fn no_data() {
        let sim = SimShim::builder().board(0).build();
        let streams = manager(&sim);
        let quiesced = streams.quiesce().await.unwrap();
        let table = RwLock::new(CalibrationTable::new());
        let config = CalibrationConfig {
            readback_timeout: Duration::from_millis(2),
            ..Default::default()
        };
        let calibrator = Calibrator::new(&sim.shim, config);
        let reports = calibrator.dac_offset(&quiesced, &table).await.unwrap();
        assert!(reports.iter().all(|r| r.outcome == DacOutcome::NoData));
        assert!(matches!(
            calibrator.adc_bias(&quiesced, &table).await,
            Err(CalibrationError::NotUnplugged { .. })
        ));

        let empty = SimShim::builder().build();
        let calibrator = Calibrator::new(&empty.shim, CalibrationConfig::default());
        assert!(matches!(
            calibrator.dac_offset(&quiesced, &table).await,
            Err(CalibrationError::NoBoards)
        ));
    }
}
