use axum::{extract::State, Json};
use serde::Serialize;

use sqlharbor_core::manager::ManagerSnapshot;
use sqlharbor_core::session::SessionRegistrySnapshot;

use crate::http::AppState;

#[derive(Serialize)]
pub struct StatusPayload {
    generated_at_ms: u64,
    manager: ManagerSnapshot,
    sessions: SessionRegistrySnapshot,
}

pub async fn status_json(State(state): State<AppState>) -> Json<StatusPayload> {
    let payload = StatusPayload {
        generated_at_ms: now_millis(),
        manager: state.manager.snapshot(),
        sessions: state.sessions.snapshot(),
    };
    Json(payload)
}

fn now_millis() -> u64 {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}
