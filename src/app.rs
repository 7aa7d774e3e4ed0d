//! shim-httpd application.
//!
//! This module contains a top-level structure [`App`] that represents the whole
//! shim-httpd application and a structure [`AppState`] that contains the
//! application state.

use crate::{
    args::Args,
    calibration::{self, CalibrationTable},
    httpd,
    shim::Shim,
    stream::{StreamConfig, StreamManager},
    trigger::TriggerMonitor,
    waveform::{RequestDefaults, WaveformTest},
};
use anyhow::Result;
use shim_json::CalibrationReport;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// shim-httpd application.
///
/// This struct represents the shim-httpd application. It owns the HTTP server,
/// which holds the application state.
#[derive(Debug)]
pub struct App {
    httpd: httpd::Server,
}

impl App {
    /// Creates a new application.
    #[tracing::instrument(name = "App::new", level = "debug")]
    pub async fn new(args: &Args) -> Result<App> {
        let shim = Arc::new(Shim::take(&args.mem_device).await?);
        let state = AppState::new(shim, args);
        if let Some(path) = &args.calibration_file {
            if tokio::fs::try_exists(path).await? {
                calibration::load_table(state.calibration(), path).await?;
            } else {
                tracing::warn!(
                    path = %path.display(),
                    "calibration file does not exist, starting with an empty table"
                );
            }
        }

        let httpd = httpd::Server::new(&args.listen, state).await?;

        Ok(App { httpd })
    }

    /// Runs the application.
    ///
    /// This only returns if the HTTP server fails.
    #[tracing::instrument(name = "App::run", level = "debug", skip_all)]
    pub async fn run(self) -> Result<()> {
        self.httpd.run().await
    }
}

/// Application state.
///
/// This struct contains the application state that needs to be shared between
/// different modules, such as different Axum handlers in the HTTP server. The
/// struct behaves as an `Arc<...>`. It is cheaply clonable and clones represent
/// a reference to a shared object.
#[derive(Debug, Clone)]
pub struct AppState(Arc<State>);

#[derive(Debug)]
struct State {
    shim: Arc<Shim>,
    streams: StreamManager,
    calibration: RwLock<CalibrationTable>,
    last_report: Mutex<Option<CalibrationReport>>,
    lockout: Mutex<u32>,
    monitor: tokio::sync::Mutex<Option<TriggerMonitor>>,
    waveform: Mutex<Option<WaveformTest>>,
    defaults: RequestDefaults,
    output_dir: PathBuf,
}

impl AppState {
    /// Creates the application state.
    ///
    /// The defaults of the waveform tests and the initial trigger lockout are
    /// taken from `args`.
    pub fn new(shim: Arc<Shim>, args: &Args) -> AppState {
        AppState(Arc::new(State {
            streams: StreamManager::new(Arc::clone(&shim), StreamConfig::default()),
            shim,
            calibration: RwLock::new(CalibrationTable::new()),
            last_report: Mutex::new(None),
            lockout: Mutex::new(args.lockout),
            monitor: tokio::sync::Mutex::new(None),
            waveform: Mutex::new(None),
            defaults: RequestDefaults {
                loop_mode: args.loop_mode,
                format: args.data_format,
                lockout: args.lockout,
            },
            output_dir: args.output_dir.clone(),
        }))
    }

    /// Gives access to the [`Shim`] object of the application.
    pub fn shim(&self) -> &Arc<Shim> {
        &self.0.shim
    }

    /// Gives access to the [`StreamManager`] of the application.
    pub fn streams(&self) -> &StreamManager {
        &self.0.streams
    }

    /// Gives access to the ADC bias table.
    pub fn calibration(&self) -> &RwLock<CalibrationTable> {
        &self.0.calibration
    }

    /// Gives access to the report of the last calibration run.
    pub fn last_report(&self) -> &Mutex<Option<CalibrationReport>> {
        &self.0.last_report
    }

    /// Gives access to the last trigger lockout written to the trigger unit.
    pub fn lockout(&self) -> &Mutex<u32> {
        &self.0.lockout
    }

    /// Gives access to the trigger monitor.
    pub fn monitor(&self) -> &tokio::sync::Mutex<Option<TriggerMonitor>> {
        &self.0.monitor
    }

    /// Gives access to the last waveform test.
    pub fn waveform(&self) -> &Mutex<Option<WaveformTest>> {
        &self.0.waveform
    }

    /// Returns the defaults for waveform tests and streaming sessions.
    pub fn defaults(&self) -> &RequestDefaults {
        &self.0.defaults
    }

    /// Returns the directory of relative script and output paths.
    pub fn output_dir(&self) -> &Path {
        &self.0.output_dir
    }

    /// Replaces the trigger monitor, stopping the previous one.
    pub async fn replace_monitor(&self, monitor: Option<TriggerMonitor>) {
        let previous = std::mem::replace(&mut *self.monitor().lock().await, monitor);
        if let Some(previous) = previous {
            let outcome = previous.stop().await;
            tracing::debug!(?outcome, "replaced trigger monitor");
        }
    }
}
