use super::json_error::JsonError;
use crate::{
    app::AppState,
    calibration::{self, CalibrationConfig, CalibrationError, Calibrator},
    waveform::resolve_path,
};
use anyhow::Result;
use axum::{extract::State, Json};
use shim_json::{Calibration, CalibrationCommand, CalibrationReport, PatchCalibration};

pub fn calibration_json(state: &AppState) -> Calibration {
    let last_report = state.last_report().lock().unwrap().clone();
    state.calibration().read().unwrap().json(last_report)
}

pub async fn get_calibration(State(state): State<AppState>) -> Json<Calibration> {
    Json(calibration_json(&state))
}

async fn calibrate(
    state: &AppState,
    adc_bias: bool,
    dac_offset: bool,
) -> Result<CalibrationReport, CalibrationError> {
    let quiesced = state.streams().quiesce().await?;
    let calibrator = Calibrator::new(state.shim(), CalibrationConfig::default());
    let table = state.calibration();
    let bias = if adc_bias {
        calibrator.adc_bias(&quiesced, table).await?
    } else {
        Vec::new()
    };
    let dac = if dac_offset {
        calibrator.dac_offset(&quiesced, table).await?
    } else {
        Vec::new()
    };
    Ok(CalibrationReport { bias, dac })
}

async fn update_calibration(state: &AppState, patch: &PatchCalibration) -> Result<(), JsonError> {
    match &patch.command {
        CalibrationCommand::Load { path } => {
            calibration::load_table(state.calibration(), &resolve_path(state.output_dir(), path))
                .await
                .map_err(JsonError::client_error)?;
        }
        CalibrationCommand::Save { path } => {
            calibration::save_table(state.calibration(), &resolve_path(state.output_dir(), path))
                .await
                .map_err(JsonError::server_error)?;
        }
        command => {
            let adc_bias =
                matches!(command, CalibrationCommand::AdcBias | CalibrationCommand::Full);
            let dac_offset =
                matches!(command, CalibrationCommand::DacOffset | CalibrationCommand::Full);
            let report = match calibrate(state, adc_bias, dac_offset).await {
                Ok(report) => report,
                Err(err) => {
                    if let Some(bias) = err.bias_report() {
                        *state.last_report().lock().unwrap() = Some(CalibrationReport {
                            bias: bias.to_vec(),
                            dac: Vec::new(),
                        });
                    }
                    return Err(err.into());
                }
            };
            *state.last_report().lock().unwrap() = Some(report);
        }
    }
    Ok(())
}

pub async fn patch_calibration(
    State(state): State<AppState>,
    Json(patch): Json<PatchCalibration>,
) -> Result<Json<Calibration>, JsonError> {
    update_calibration(&state, &patch).await?;
    Ok(Json(calibration_json(&state)))
}
