use super::{db, engine, parse_date, parse_params, respond, HandlerErr};
use crate::attendance::{self, BatchUpdateItem, CreateAttendanceRequest};
use crate::batch::{self, SubmitBatchRequest};
use crate::ipc::types::{AppState, Request};
use crate::keys::BatchKey;
use crate::ledger::{self, AttendanceFilter};
use crate::model::LedgerMonth;
use crate::selection::Selection;
use chrono::{Datelike, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateParams {
    student_id: String,
    session_id: String,
    learning_date: String,
    is_attend: bool,
    #[serde(default)]
    note: String,
    user_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBatchParams {
    class_id: String,
    session_id: String,
    learning_date: String,
    #[serde(flatten)]
    selection: Selection,
    user_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchStatusParams {
    batch_id: Option<String>,
    class_id: Option<String>,
    session_id: Option<String>,
    learning_date: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateParams {
    attendance_id: String,
    is_attend: bool,
    note: Option<String>,
    user_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateBatchParams {
    class_id: String,
    learning_date: String,
    attendances: Vec<BatchUpdateItem>,
    user_id: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FindParams {
    class_id: Option<String>,
    payment_id: Option<String>,
    learning_date: Option<String>,
    learning_month: Option<u32>,
    learning_year: Option<i32>,
    is_attend: Option<bool>,
    #[serde(default)]
    page: u32,
    #[serde(default)]
    row_per_page: u32,
}

fn create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: CreateParams = parse_params(req)?;
    let learning_date = parse_date(&p.learning_date, "learningDate")?;
    let outcome = attendance::create_attendance(
        db(state)?,
        &CreateAttendanceRequest {
            student_id: p.student_id,
            session_id: p.session_id,
            learning_date,
            is_attend: p.is_attend,
            note: p.note,
        },
        &p.user_id,
    )?;
    Ok(json!(outcome))
}

fn submit_batch(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: SubmitBatchParams = parse_params(req)?;
    let learning_date = parse_date(&p.learning_date, "learningDate")?;
    let (conn, store, cfg) = engine(state)?;
    let submission = batch::submit_batch(
        conn,
        store,
        cfg,
        &SubmitBatchRequest {
            class_id: p.class_id,
            session_id: p.session_id,
            learning_date,
            selection: p.selection,
            submitted_by: p.user_id,
        },
    )?;
    Ok(json!(submission))
}

fn batch_status(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: BatchStatusParams = parse_params(req)?;
    let batch_id = match (p.batch_id, p.class_id, p.session_id, p.learning_date) {
        (Some(id), _, _, _) => id,
        (None, Some(class_id), Some(session_id), Some(raw)) => {
            let date = parse_date(&raw, "learningDate")?;
            BatchKey::new(&class_id, &session_id, date).id().to_string()
        }
        _ => {
            return Err(HandlerErr::bad_params(
                "batchId or classId, sessionId and learningDate required",
            ))
        }
    };
    let (conn, store, _) = engine(state)?;
    let status = batch::get_batch_status(conn, store, &batch_id)?;
    Ok(json!(status))
}

fn update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: UpdateParams = parse_params(req)?;
    let outcome = attendance::update_attendance(
        db(state)?,
        &p.attendance_id,
        p.is_attend,
        p.note.as_deref(),
        &p.user_id,
        today(),
    )?;
    Ok(json!(outcome))
}

fn update_batch(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: UpdateBatchParams = parse_params(req)?;
    let learning_date = parse_date(&p.learning_date, "learningDate")?;
    let updated = attendance::update_batch_attendance(
        db(state)?,
        &p.class_id,
        learning_date,
        &p.attendances,
        &p.user_id,
        today(),
    )?;
    Ok(json!({ "attendances": updated }))
}

fn find(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: FindParams = if req.params.is_null() {
        FindParams::default()
    } else {
        parse_params(req)?
    };
    let learning_date = p
        .learning_date
        .as_deref()
        .map(|raw| parse_date(raw, "learningDate"))
        .transpose()?;
    let month = match (p.learning_month, p.learning_year) {
        (Some(m), _) if !(1..=12).contains(&m) => {
            return Err(HandlerErr::bad_params("learningMonth must be between 1 and 12"))
        }
        (Some(month), year) => Some(LedgerMonth {
            year: year.unwrap_or_else(|| today().year()),
            month,
        }),
        (None, _) => None,
    };
    if ledger::page_offset(p.page, p.row_per_page).is_none() {
        return Err(HandlerErr::bad_params("page is out of range"));
    }
    let page = ledger::find_attendances(
        db(state)?,
        &AttendanceFilter {
            class_id: p.class_id,
            payment_id: p.payment_id,
            is_attend: p.is_attend,
            learning_date,
            month,
            page: p.page,
            row_per_page: p.row_per_page,
        },
    )?;
    Ok(json!(page))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "attendance.create" => create(state, req),
        "attendance.submitBatch" => submit_batch(state, req),
        "attendance.batchStatus" => batch_status(state, req),
        "attendance.update" => update(state, req),
        "attendance.updateBatch" => update_batch(state, req),
        "attendance.find" => find(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
