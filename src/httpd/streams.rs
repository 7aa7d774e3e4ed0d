use super::json_error::JsonError;
use crate::{
    app::AppState,
    script::{ChannelOrders, ScriptKind, WaveformScript},
    stream::{StreamJob, StreamKey},
    waveform::resolve_path,
};
use anyhow::{anyhow, Result};
use axum::{
    extract::{Path, State},
    Json,
};
use shim_json::{PutStream, Stream, StreamKind, StreamReport, Streams};
use std::path::PathBuf;
use std::sync::Arc;

pub async fn get_streams(State(state): State<AppState>) -> Json<Streams> {
    Json(state.streams().json().await)
}

fn required<'a, T>(value: &'a Option<T>, name: &str, key: StreamKey) -> Result<&'a T, JsonError> {
    value
        .as_ref()
        .ok_or_else(|| JsonError::client_error(anyhow!("{key} needs {name}")))
}

async fn load_script(state: &AppState, kind: ScriptKind, script: &str) -> Result<WaveformScript> {
    WaveformScript::load(kind, &resolve_path(state.output_dir(), script)).await
}

fn output_path(state: &AppState, output: &str) -> PathBuf {
    resolve_path(state.output_dir(), output)
}

async fn stream_job(
    state: &AppState,
    key: StreamKey,
    put: &PutStream,
) -> Result<StreamJob, JsonError> {
    let defaults = state.defaults();
    let format = put.format.unwrap_or(defaults.format);
    Ok(match key {
        StreamKey::DacCmd(_) | StreamKey::AdcCmd(_) => {
            let kind = if matches!(key, StreamKey::DacCmd(_)) {
                ScriptKind::Dac
            } else {
                ScriptKind::Adc
            };
            let script = load_script(state, kind, required(&put.script, "a script", key)?)
                .await
                .map_err(JsonError::client_error)?;
            let loop_count = put.loop_count.unwrap_or(1);
            if loop_count == 0 {
                return Err(JsonError::client_error(anyhow!("loop count is zero")));
            }
            StreamJob::Command {
                script: Arc::new(script),
                loop_count,
                loop_mode: put.loop_mode.unwrap_or(defaults.loop_mode),
            }
        }
        StreamKey::AdcData(board) => {
            let output = output_path(state, required(&put.output, "an output file", key)?);
            let samples = *required(&put.count, "a sample count", key)?;
            // the ADC script, if given, only provides the channel orders
            let orders = match &put.script {
                Some(script) => load_script(state, ScriptKind::Adc, script)
                    .await
                    .map_err(JsonError::client_error)?
                    .channel_orders(),
                None => ChannelOrders::identity(),
            };
            let biases = state.calibration().read().unwrap().board_biases(board);
            StreamJob::AdcData {
                output,
                samples,
                format,
                orders,
                biases,
            }
        }
        StreamKey::TriggerData => StreamJob::TriggerData {
            output: output_path(state, required(&put.output, "an output file", key)?),
            records: *required(&put.count, "a timestamp count", key)?,
            format,
        },
    })
}

async fn start_stream(
    state: &AppState,
    key: StreamKey,
    put: &PutStream,
) -> Result<Stream, JsonError> {
    let job = stream_job(state, key, put).await?;
    state.streams().start(key, job).await?;
    state
        .streams()
        .json()
        .await
        .sessions
        .into_iter()
        .find(|s| s.board == key.board() && s.kind == key.kind())
        .ok_or_else(|| JsonError::server_error(anyhow!("{key} disappeared after starting")))
}

async fn stop_stream(state: &AppState, key: StreamKey) -> Result<StreamReport, JsonError> {
    Ok(state.streams().stop(key).await?.json())
}

pub async fn put_stream(
    State(state): State<AppState>,
    Path((board, kind)): Path<(u8, StreamKind)>,
    Json(put): Json<PutStream>,
) -> Result<Json<Stream>, JsonError> {
    let key = StreamKey::new(Some(board), kind)?;
    start_stream(&state, key, &put).await.map(Json)
}

pub async fn delete_stream(
    State(state): State<AppState>,
    Path((board, kind)): Path<(u8, StreamKind)>,
) -> Result<Json<StreamReport>, JsonError> {
    let key = StreamKey::new(Some(board), kind)?;
    stop_stream(&state, key).await.map(Json)
}

pub async fn put_trigger_stream(
    State(state): State<AppState>,
    Json(put): Json<PutStream>,
) -> Result<Json<Stream>, JsonError> {
    start_stream(&state, StreamKey::TriggerData, &put)
        .await
        .map(Json)
}

pub async fn delete_trigger_stream(
    State(state): State<AppState>,
) -> Result<Json<StreamReport>, JsonError> {
    stop_stream(&state, StreamKey::TriggerData).await.map(Json)
}
