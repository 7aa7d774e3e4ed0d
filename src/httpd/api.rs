use super::{calibration::calibration_json, trigger::trigger_json};
use crate::app::AppState;
use axum::{extract::State, Json};

async fn api_json(state: &AppState) -> shim_json::Api {
    let shim = state.shim();
    shim_json::Api {
        system: shim.status_json(),
        control: shim.system().json(),
        streams: state.streams().json().await,
        trigger: trigger_json(state).await,
        calibration: calibration_json(state),
    }
}

pub async fn get_api(State(state): State<AppState>) -> Json<shim_json::Api> {
    Json(api_json(&state).await)
}
