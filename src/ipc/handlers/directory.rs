use super::{db, parse_date, parse_params, respond, HandlerErr};
use crate::directory::{self, NewSession};
use crate::ipc::types::{AppState, Request};
use crate::model::Status;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassParams {
    class_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionParams {
    class_id: String,
    weekday: String,
    start_time: String,
    end_time: String,
    amount: i64,
    valid_from: Option<String>,
    valid_to: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseSessionParams {
    session_id: String,
    valid_to: Option<String>,
}

#[derive(Deserialize)]
struct CreateStudentParams {
    name: String,
    #[serde(default)]
    debt: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MembershipParams {
    student_id: String,
    class_id: String,
    status: Option<Status>,
}

fn classes_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: NameParams = parse_params(req)?;
    if p.name.trim().is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let class_id = directory::create_class(db(state)?, p.name.trim())?;
    Ok(json!({ "classId": class_id }))
}

fn classes_roster(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: ClassParams = parse_params(req)?;
    let conn = db(state)?;
    if !directory::class_exists(conn, &p.class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: format!("class {} not found", p.class_id),
            details: None,
        });
    }
    let student_ids = directory::get_active_roster(conn, &p.class_id)?;
    Ok(json!({ "classId": p.class_id, "studentIds": student_ids }))
}

fn sessions_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: CreateSessionParams = parse_params(req)?;
    let valid_from = match p.valid_from.as_deref() {
        Some(raw) => parse_date(raw, "validFrom")?,
        None => Utc::now().date_naive(),
    };
    let valid_to = p
        .valid_to
        .as_deref()
        .map(|raw| parse_date(raw, "validTo"))
        .transpose()?;
    let session = directory::create_session(
        db(state)?,
        &NewSession {
            class_id: p.class_id,
            weekday: p.weekday,
            start_time: p.start_time,
            end_time: p.end_time,
            amount: p.amount,
            valid_from,
            valid_to,
        },
    )?;
    Ok(json!({ "session": session }))
}

fn sessions_close(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: CloseSessionParams = parse_params(req)?;
    let valid_to = p
        .valid_to
        .as_deref()
        .map(|raw| parse_date(raw, "validTo"))
        .transpose()?;
    let session = directory::close_session(db(state)?, &p.session_id, valid_to)?;
    Ok(json!({ "session": session }))
}

fn students_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let p: CreateStudentParams = parse_params(req)?;
    if p.name.trim().is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let student_id = directory::create_student(db(state)?, p.name.trim(), p.debt)?;
    Ok(json!({ "studentId": student_id }))
}

fn students_membership(
    state: &AppState,
    req: &Request,
    default_status: Option<Status>,
) -> Result<serde_json::Value, HandlerErr> {
    let p: MembershipParams = parse_params(req)?;
    let Some(status) = p.status.or(default_status) else {
        return Err(HandlerErr::bad_params("missing status"));
    };
    directory::set_membership(db(state)?, &p.student_id, &p.class_id, status)?;
    Ok(json!({
        "studentId": p.student_id,
        "classId": p.class_id,
        "status": status,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "classes.create" => classes_create(state, req),
        "classes.roster" => classes_roster(state, req),
        "sessions.create" => sessions_create(state, req),
        "sessions.close" => sessions_close(state, req),
        "students.create" => students_create(state, req),
        "students.enroll" => students_membership(state, req, Some(Status::Active)),
        "students.setMembership" => students_membership(state, req, None),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
