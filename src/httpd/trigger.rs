use super::json_error::JsonError;
use crate::{
    app::AppState,
    trigger::{MonitorConfig, TriggerMonitor},
};
use anyhow::anyhow;
use axum::{extract::State, Json};
use shim_json::{PatchTrigger, Trigger, TriggerCommand};

pub async fn trigger_json(state: &AppState) -> Trigger {
    let monitor = state.monitor().lock().await.as_ref().map(TriggerMonitor::json);
    let lockout = *state.lockout().lock().unwrap();
    Trigger {
        count: state.shim().trigger().count(),
        lockout,
        monitor,
    }
}

pub async fn get_trigger(State(state): State<AppState>) -> Json<Trigger> {
    Json(trigger_json(&state).await)
}

async fn run_command(state: &AppState, command: &TriggerCommand) -> Result<(), JsonError> {
    let trigger = state.shim().trigger();
    match *command {
        TriggerCommand::Sync { reset_counter } => trigger.sync_channels(reset_counter)?,
        TriggerCommand::Force { count } => trigger.force_trigger(count)?,
        TriggerCommand::Delay { cycles } => trigger.delay(cycles)?,
        TriggerCommand::Expect { count } => trigger.expect_ext(count)?,
        TriggerCommand::Cancel => trigger.cancel()?,
        TriggerCommand::StartMonitor { expected } => {
            let monitor =
                TriggerMonitor::start(trigger.clone(), expected, MonitorConfig::default());
            state.replace_monitor(Some(monitor)).await;
        }
        TriggerCommand::StopMonitor => {
            if state.monitor().lock().await.is_none() {
                return Err(JsonError::not_found(anyhow!(
                    "the trigger monitor is not running"
                )));
            }
            state.replace_monitor(None).await;
        }
    }
    Ok(())
}

async fn update_trigger(state: &AppState, patch: &PatchTrigger) -> Result<(), JsonError> {
    if let Some(lockout) = patch.lockout {
        state.shim().trigger().set_lockout(lockout)?;
        *state.lockout().lock().unwrap() = lockout;
    }
    if let Some(command) = &patch.command {
        run_command(state, command).await?;
    }
    Ok(())
}

pub async fn patch_trigger(
    State(state): State<AppState>,
    Json(patch): Json<PatchTrigger>,
) -> Result<Json<Trigger>, JsonError> {
    update_trigger(&state, &patch).await?;
    Ok(Json(trigger_json(&state).await))
}
