//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness: SQLite reachable, object root writable, plus
//!   link lifecycle counters for operators

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::BTreeMap, path::Path};
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Always 200. Never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// `GET /readyz`
///
/// 200 when every check passes, 503 otherwise. Links minted but not yet
/// persisted are reported but do not fail readiness.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert("sqlite", probe_sqlite(&state).await);
    checks.insert("object_store", probe_storage(state.objects.base_path()).await);

    let ready = checks.values().all(|c| c.ok);
    let lifecycle = state.resources.lifecycle();
    let body = ReadyResponse {
        status: if ready { "ok" } else { "error" },
        checks,
        refreshes_in_flight: lifecycle.in_flight_count(),
        links_pending_persist: lifecycle.unsaved_count(),
    };

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn probe_sqlite(state: &AppState) -> CheckStatus {
    match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*state.db)
        .await
    {
        Ok(1) => CheckStatus::pass(),
        Ok(v) => CheckStatus::fail(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::fail(format!("error: {}", e)),
    }
}

async fn probe_storage(root: &Path) -> CheckStatus {
    let probe = root.join(format!(".readyz-{}", Uuid::new_v4()));
    let outcome = match fs::write(&probe, b"readyz").await {
        Ok(()) => match fs::read(&probe).await {
            Ok(bytes) if bytes == b"readyz" => CheckStatus::pass(),
            Ok(_) => CheckStatus::fail("file content mismatch"),
            Err(e) => CheckStatus::fail(format!("could not read probe file: {}", e)),
        },
        Err(e) => return CheckStatus::fail(format!("could not write probe file: {}", e)),
    };
    let _ = fs::remove_file(&probe).await;
    outcome
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, CheckStatus>,
    refreshes_in_flight: usize,
    links_pending_persist: usize,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn pass() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn fail(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(msg.into()),
        }
    }
}
