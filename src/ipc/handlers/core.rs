use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::SqliteLockStore;
use crate::worker::WorkerPool;
use serde_json::json;
use std::path::PathBuf;
use tracing::{error, info};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "workers": state.pool.as_ref().map(|p| p.size()).unwrap_or(0)
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    // Stop the old workers before they lose their workspace.
    state.pool = None;
    state.store = None;
    state.db = None;
    state.workspace = None;

    let conn = match db::open_db(&path) {
        Ok(conn) => conn,
        Err(e) => return err(&req.id, "db_open_failed", format!("{e:?}"), None),
    };
    let db_file = db::db_path(&path);
    let store = match SqliteLockStore::open(&db_file) {
        Ok(store) => store,
        Err(e) => return err(&req.id, "db_open_failed", e.to_string(), None),
    };
    let pool = match WorkerPool::start(db_file, state.config.clone()) {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "failed to start worker pool");
            return err(&req.id, "pool_start_failed", format!("{e:?}"), None);
        }
    };

    info!(workspace = %path.display(), "workspace selected");
    let workers = pool.size();
    state.workspace = Some(path.clone());
    state.db = Some(conn);
    state.store = Some(store);
    state.pool = Some(pool);
    ok(
        &req.id,
        json!({ "workspacePath": path.to_string_lossy(), "workers": workers }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
