pub mod attendance;
pub mod core;
pub mod directory;
pub mod payments;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model;
use crate::store::SqliteLockStore;
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub(crate) struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn bad_params(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<EngineError> for HandlerErr {
    fn from(e: EngineError) -> Self {
        HandlerErr {
            code: e.code(),
            message: e.to_string(),
            details: None,
        }
    }
}

pub(crate) fn respond<T: Serialize>(id: &str, result: Result<T, HandlerErr>) -> serde_json::Value {
    match result.and_then(|v| {
        serde_json::to_value(v).map_err(|e| HandlerErr {
            code: "bad_payload",
            message: e.to_string(),
            details: None,
        })
    }) {
        Ok(v) => ok(id, v),
        Err(e) => e.response(id),
    }
}

pub(crate) fn parse_params<T: DeserializeOwned>(req: &Request) -> Result<T, HandlerErr> {
    serde_json::from_value(req.params.clone()).map_err(|e| HandlerErr::bad_params(e.to_string()))
}

pub(crate) fn parse_date(raw: &str, key: &str) -> Result<NaiveDate, HandlerErr> {
    model::parse_date(raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

pub(crate) fn db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state.db.as_ref().ok_or_else(|| HandlerErr {
        code: "no_workspace",
        message: "select a workspace first".to_string(),
        details: None,
    })
}

pub(crate) fn engine(
    state: &AppState,
) -> Result<(&Connection, &SqliteLockStore, &EngineConfig), HandlerErr> {
    let conn = db(state)?;
    let store = state.store.as_ref().ok_or_else(|| HandlerErr {
        code: "no_workspace",
        message: "select a workspace first".to_string(),
        details: None,
    })?;
    Ok((conn, store, &state.config))
}
