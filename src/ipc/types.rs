use std::path::PathBuf;

use crate::config::EngineConfig;
use crate::store::SqliteLockStore;
use crate::worker::WorkerPool;
use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub config: EngineConfig,
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub store: Option<SqliteLockStore>,
    pub pool: Option<WorkerPool>,
}

impl AppState {
    pub fn new(config: EngineConfig) -> Self {
        AppState {
            config,
            workspace: None,
            db: None,
            store: None,
            pool: None,
        }
    }
}
