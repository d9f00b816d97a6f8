use super::{db, parse_params, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::ledger;
use crate::model::{LedgerMonth, PaymentStatus};
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MonthParams {
    student_id: String,
    year: i32,
    month: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusParams {
    payment_id: String,
    status: PaymentStatus,
    paid_amount: Option<i64>,
    note: Option<String>,
}

fn get_for_month(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: MonthParams = parse_params(req)?;
    if !(1..=12).contains(&p.month) {
        return Err(HandlerErr::bad_params("month must be between 1 and 12"));
    }
    let payment = ledger::get_payment_for_month(
        db(state)?,
        &p.student_id,
        LedgerMonth {
            year: p.year,
            month: p.month,
        },
    )?;
    Ok(json!({ "payment": payment }))
}

fn update_status(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: StatusParams = parse_params(req)?;
    let payment = ledger::update_payment_status(
        db(state)?,
        &p.payment_id,
        p.status,
        p.paid_amount,
        p.note.as_deref(),
    )?;
    Ok(json!({ "payment": payment }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "payments.getForMonth" => get_for_month(state, req),
        "payments.updateStatus" => update_status(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
