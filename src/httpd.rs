//! HTTP server.
//!
//! This module contains the HTTP server of shim-httpd, which is a web server
//! implemented using [`axum`].

use crate::app::AppState;
use anyhow::Result;
use axum::{
    routing::{get, put},
    Router,
};
use tower_http::trace::TraceLayer;

mod api;
mod calibration;
mod streams;
mod system;
mod trigger;
mod version;
mod waveform;

/// HTTP server.
///
/// This HTTP server is the control surface of shim-httpd. Every operation on
/// the hardware is performed as response to an HTTP request handled by this
/// server.
#[derive(Debug)]
pub struct Server {
    server: axum::serve::Serve<Router, Router>,
}

impl Server {
    /// Creates a new HTTP server.
    ///
    /// The `address` parameter gives the address in which the server will
    /// listen. The `state` gives the handlers shared access to the hardware,
    /// the streaming sessions and the calibration table.
    ///
    /// After calling this function, the server needs to be run by calling
    /// [`Server::run`].
    pub async fn new(address: &std::net::SocketAddr, state: AppState) -> Result<Server> {
        let app = Router::new()
            .route("/api", get(api::get_api))
            .route("/api/version", get(version::get_version))
            .route(
                "/api/system",
                get(system::get_system).patch(system::patch_system),
            )
            .route("/api/system/status", get(system::get_system_status))
            .route("/api/streams", get(streams::get_streams))
            .route(
                "/api/streams/trigger",
                put(streams::put_trigger_stream).delete(streams::delete_trigger_stream),
            )
            .route(
                "/api/streams/:board/:kind",
                put(streams::put_stream).delete(streams::delete_stream),
            )
            .route(
                "/api/trigger",
                get(trigger::get_trigger).patch(trigger::patch_trigger),
            )
            .route(
                "/api/calibration",
                get(calibration::get_calibration).patch(calibration::patch_calibration),
            )
            .route(
                "/api/waveform",
                get(waveform::get_waveform).put(waveform::put_waveform),
            )
            .with_state(state);
        tracing::info!(%address, "starting HTTP server");
        let listener = tokio::net::TcpListener::bind(address).await?;
        let server = axum::serve(listener, app.layer(TraceLayer::new_for_http()));
        Ok(Server { server })
    }

    /// Runs the HTTP server.
    ///
    /// This only returns if there is a fatal error.
    pub async fn run(self) -> Result<()> {
        Ok(self.server.await?)
    }
}

mod json_error {
    use crate::calibration::CalibrationError;
    use crate::shim::CommandError;
    use crate::stream::StreamError;
    use crate::waveform::WaveformError;
    use anyhow::Error;
    use axum::{
        http::StatusCode,
        response::{IntoResponse, Response},
    };
    use serde::Serialize;

    #[derive(Serialize, Debug, Clone, Eq, PartialEq)]
    pub struct JsonError {
        http_status_code: u16,
        error_description: String,
    }

    impl JsonError {
        pub fn from_error(status_code: StatusCode, error: Error) -> JsonError {
            JsonError {
                http_status_code: status_code.as_u16(),
                error_description: format!("{error:#}"),
            }
        }

        pub fn client_error(error: Error) -> JsonError {
            JsonError::from_error(StatusCode::BAD_REQUEST, error)
        }

        pub fn conflict(error: Error) -> JsonError {
            JsonError::from_error(StatusCode::CONFLICT, error)
        }

        pub fn not_found(error: Error) -> JsonError {
            JsonError::from_error(StatusCode::NOT_FOUND, error)
        }

        pub fn server_error(error: Error) -> JsonError {
            JsonError::from_error(StatusCode::INTERNAL_SERVER_ERROR, error)
        }

        #[cfg(test)]
        pub fn status_code(&self) -> u16 {
            self.http_status_code
        }
    }

    impl From<StreamError> for JsonError {
        fn from(error: StreamError) -> JsonError {
            match error {
                StreamError::AlreadyRunning(_)
                | StreamError::Busy(_)
                | StreamError::FifoAbsent(_) => JsonError::conflict(error.into()),
                StreamError::NotRunning(_) => JsonError::not_found(error.into()),
                StreamError::Output { .. } => JsonError::server_error(error.into()),
                StreamError::FifoTooSmall { .. }
                | StreamError::JobMismatch(_)
                | StreamError::InvalidKey { .. }
                | StreamError::Encode(_) => JsonError::client_error(error.into()),
            }
        }
    }

    impl From<CommandError> for JsonError {
        fn from(error: CommandError) -> JsonError {
            match error {
                CommandError::Encode(_) => JsonError::client_error(error.into()),
                CommandError::FifoAbsent(_) | CommandError::FifoFull { .. } => {
                    JsonError::conflict(error.into())
                }
                CommandError::Timeout(_) => JsonError::server_error(error.into()),
            }
        }
    }

    impl From<CalibrationError> for JsonError {
        fn from(error: CalibrationError) -> JsonError {
            match error {
                CalibrationError::NoBoards | CalibrationError::NotUnplugged { .. } => {
                    JsonError::conflict(error.into())
                }
                CalibrationError::Incomplete { .. } => JsonError::server_error(error.into()),
                CalibrationError::Stream(error) => error.into(),
                CalibrationError::Command(error) => error.into(),
            }
        }
    }

    impl From<WaveformError> for JsonError {
        fn from(error: WaveformError) -> JsonError {
            match error {
                WaveformError::Validation(_) => JsonError::client_error(error.into()),
                WaveformError::PrefillTimeout(_) => JsonError::conflict(error.into()),
                WaveformError::Stream(error) => error.into(),
                WaveformError::Calibration(error) => error.into(),
                WaveformError::Command(error) => error.into(),
            }
        }
    }

    impl IntoResponse for JsonError {
        fn into_response(self) -> Response {
            let status_code = StatusCode::from_u16(self.http_status_code).unwrap();
            let json = serde_json::to_string(&self).unwrap();
            (status_code, json).into_response()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::args::Args;
    use crate::sim::SimShim;
    use axum::extract::{Path, State};
    use axum::Json;
    use clap::Parser;
    use shim_json::{
        BufferReset, PatchCalibration, PatchSystemControl, PatchTrigger, PutStream, PutWaveform,
        StopReason, StreamKind, TriggerCommand, WaveformBoard, WaveformSide,
    };

    fn state(sim: &SimShim, dir: &std::path::Path) -> AppState {
        let args = Args::parse_from([
            "shim-httpd",
            "--output-dir",
            dir.to_str().unwrap(),
            "--lockout",
            "1234",
        ]);
        AppState::new(std::sync::Arc::clone(&sim.shim), &args)
    }

    fn trigger_stream(count: u64) -> PutStream {
        PutStream {
            output: Some("trig.txt".to_string()),
            count: Some(count),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stream_lifecycle() {
        let sim = SimShim::builder().board(0).build();
        let dir = tempfile::tempdir().unwrap();
        let state = state(&sim, dir.path());

        let Json(stream) =
            streams::put_trigger_stream(State(state.clone()), Json(trigger_stream(2)))
                .await
                .unwrap();
        assert_eq!(stream.kind, StreamKind::TriggerData);
        assert_eq!(stream.target, 2);
        let err = streams::put_trigger_stream(State(state.clone()), Json(trigger_stream(2)))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);

        let Json(report) = streams::delete_trigger_stream(State(state.clone()))
            .await
            .unwrap();
        assert_eq!(report.reason, StopReason::Stopped);
        let err = streams::delete_trigger_stream(State(state.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert!(dir.path().join("trig.txt").exists());
    }

    #[tokio::test]
    async fn stream_requests_are_checked() {
        let sim = SimShim::builder().board(0).build();
        let dir = tempfile::tempdir().unwrap();
        let state = state(&sim, dir.path());

        let err = streams::put_stream(
            State(state.clone()),
            Path((0, StreamKind::DacCmd)),
            Json(PutStream::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), 400);

        let err = streams::put_stream(
            State(state.clone()),
            Path((9, StreamKind::AdcData)),
            Json(trigger_stream(8)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), 400);

        let err = streams::put_stream(
            State(state.clone()),
            Path((3, StreamKind::AdcData)),
            Json(trigger_stream(8)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), 409);

        tokio::fs::write(dir.path().join("dac.txt"), "T 1 1 2 3 4 5 6 7 8\n")
            .await
            .unwrap();
        let put = PutStream {
            script: Some("dac.txt".to_string()),
            loop_count: Some(2),
            ..Default::default()
        };
        let Json(stream) =
            streams::put_stream(State(state.clone()), Path((0, StreamKind::DacCmd)), Json(put))
                .await
                .unwrap();
        assert_eq!(stream.board, Some(0));
        assert_eq!(stream.target, 2);
        state.streams().stop_all().await;
    }

    #[tokio::test]
    async fn busy_hardware_is_a_conflict() {
        let sim = SimShim::builder().loopback(0).build();
        let dir = tempfile::tempdir().unwrap();
        let state = state(&sim, dir.path());
        let Json(stream) =
            streams::put_trigger_stream(State(state.clone()), Json(trigger_stream(5)))
                .await
                .unwrap();
        assert_eq!(stream.board, None);

        let patch = PatchSystemControl {
            reset: Some(BufferReset {
                cmd_mask: 1,
                data_mask: 0,
            }),
            ..Default::default()
        };
        let writes = sim.ctrl.writes().len();
        let err = system::patch_system(State(state.clone()), Json(patch))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert_eq!(sim.ctrl.writes().len(), writes);

        let patch = PatchCalibration {
            command: shim_json::CalibrationCommand::AdcBias,
        };
        let err = calibration::patch_calibration(State(state.clone()), Json(patch))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
        state.streams().stop_all().await;
    }

    #[tokio::test]
    async fn trigger_commands() {
        let sim = SimShim::builder().build();
        let dir = tempfile::tempdir().unwrap();
        let state = state(&sim, dir.path());
        let Json(trigger) = trigger::get_trigger(State(state.clone())).await;
        assert_eq!(trigger.lockout, 1234);
        assert!(trigger.monitor.is_none());

        let patch = PatchTrigger {
            lockout: Some(100),
            command: Some(TriggerCommand::Force { count: 2 }),
        };
        let Json(trigger) = trigger::patch_trigger(State(state.clone()), Json(patch))
            .await
            .unwrap();
        assert_eq!(trigger.lockout, 100);
        assert_eq!(sim.trigger_cmd.written().len(), 2);

        let patch = PatchTrigger {
            lockout: None,
            command: Some(TriggerCommand::StartMonitor { expected: 3 }),
        };
        let Json(trigger) = trigger::patch_trigger(State(state.clone()), Json(patch))
            .await
            .unwrap();
        assert_eq!(trigger.monitor.map(|m| m.expected), Some(3));
        let patch = PatchTrigger {
            lockout: None,
            command: Some(TriggerCommand::StopMonitor),
        };
        let Json(trigger) = trigger::patch_trigger(State(state.clone()), Json(patch))
            .await
            .unwrap();
        assert!(trigger.monitor.is_none());
        let err = trigger::patch_trigger(State(state.clone()), Json(patch))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn waveform_validation_error() {
        let sim = SimShim::builder().board(0).build();
        let dir = tempfile::tempdir().unwrap();
        let state = state(&sim, dir.path());
        tokio::fs::write(dir.path().join("dac.txt"), "T 1\nT 1\n")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("adc.txt"), "T 1\n")
            .await
            .unwrap();
        let side = |script: &str| {
            Some(WaveformSide {
                script: script.to_string(),
                loop_count: 1,
            })
        };
        let put = PutWaveform {
            boards: vec![WaveformBoard {
                board: 0,
                dac: side("dac.txt"),
                adc: side("adc.txt"),
                output: Some("adc0.txt".to_string()),
            }],
            reset_buffers: true,
            calibrate: false,
            trigger_output: None,
            loop_mode: None,
            format: None,
            lockout: None,
            prefill_timeout: Default::default(),
        };
        let err = waveform::put_waveform(State(state.clone()), Json(put))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(sim.ctrl.writes().is_empty());
        assert!(sim.boards[0].dac_cmd.written().is_empty());
        let err = waveform::get_waveform(State(state.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }
}
