//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness ("ok")
//! - GET /readyz   -> readiness: database, payload root and scratch space

use crate::routes::routes::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::BTreeMap, path::Path};
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// `GET /readyz`
///
/// Answers 200 when every check passes, 503 otherwise, with one entry per
/// check in the body.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let database = match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM deposits")
        .fetch_one(&*state.storage.db)
        .await
    {
        Ok(_) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(format!("error: {e}")),
    };
    checks.insert("database", database);
    checks.insert("payloads", check_dir(&state.storage.base_path).await);
    checks.insert("scratch", check_dir(&state.storage.scratch_dir()).await);

    let ready = checks.values().all(|check| check.ok);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            status: if ready { "ok" } else { "error" },
            checks,
        }),
    )
}

/// Write, read back and remove a canary file under `dir`.
async fn check_dir(dir: &Path) -> CheckStatus {
    if let Err(e) = fs::create_dir_all(dir).await {
        return CheckStatus::failed(format!("could not create {}: {e}", dir.display()));
    }
    let canary = dir.join(format!(".readyz-{}", Uuid::new_v4()));
    let result = match fs::write(&canary, b"readyz").await {
        Ok(()) => match fs::read(&canary).await {
            Ok(bytes) if bytes == b"readyz" => CheckStatus::ok(),
            Ok(_) => CheckStatus::failed("canary content mismatch".into()),
            Err(e) => CheckStatus::failed(format!("could not read canary: {e}")),
        },
        Err(e) => return CheckStatus::failed(format!("could not write canary: {e}")),
    };
    let _ = fs::remove_file(&canary).await;
    result
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
