use super::json_error::JsonError;
use crate::{
    app::AppState,
    waveform::{Orchestrator, WaveformRequest},
};
use anyhow::anyhow;
use axum::{extract::State, Json};
use shim_json::{PutWaveform, Waveform};

async fn waveform_json(state: &AppState) -> Result<Waveform, JsonError> {
    let streams = state.streams().json().await;
    state
        .waveform()
        .lock()
        .unwrap()
        .as_ref()
        .map(|test| test.json(&streams))
        .ok_or_else(|| JsonError::not_found(anyhow!("no waveform test has been run")))
}

pub async fn get_waveform(State(state): State<AppState>) -> Result<Json<Waveform>, JsonError> {
    waveform_json(&state).await.map(Json)
}

async fn run_waveform(state: &AppState, put: &PutWaveform) -> Result<(), JsonError> {
    let request = WaveformRequest::load(put, state.defaults(), state.output_dir())
        .await
        .map_err(JsonError::client_error)?;
    let run = Orchestrator::new(state.shim(), state.streams(), state.calibration())
        .run(&request)
        .await?;
    state.replace_monitor(Some(run.monitor)).await;
    *state.lockout().lock().unwrap() = request.lockout;
    *state.waveform().lock().unwrap() = Some(run.test);
    Ok(())
}

pub async fn put_waveform(
    State(state): State<AppState>,
    Json(put): Json<PutWaveform>,
) -> Result<Json<Waveform>, JsonError> {
    run_waveform(&state, &put).await?;
    waveform_json(&state).await.map(Json)
}
