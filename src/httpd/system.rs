use super::json_error::JsonError;
use crate::app::AppState;
use axum::{extract::State, Json};
use shim_json::{PatchSystemControl, SystemControl, SystemStatus};

pub async fn get_system(State(state): State<AppState>) -> Json<SystemControl> {
    Json(state.shim().system().json())
}

pub async fn get_system_status(State(state): State<AppState>) -> Json<SystemStatus> {
    Json(state.shim().status_json())
}

async fn update_system(state: &AppState, patch: &PatchSystemControl) -> Result<(), JsonError> {
    // FIFOs are only reset while no session uses them
    let _quiesced = match patch.reset {
        Some(_) => Some(state.streams().quiesce().await?),
        None => None,
    };
    state.shim().system().patch(patch);
    Ok(())
}

pub async fn patch_system(
    State(state): State<AppState>,
    Json(patch): Json<PatchSystemControl>,
) -> Result<Json<SystemControl>, JsonError> {
    update_system(&state, &patch).await?;
    Ok(Json(state.shim().system().json()))
}
