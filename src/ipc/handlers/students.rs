use crate::auth::Actor;
use crate::error::DomainError;
use crate::events::WorkflowEvent;
use crate::ipc::helpers::{
    get_optional_f64, get_optional_i64, get_optional_str, get_required_str, read_conn,
    require_actor, require_staff, respond, scoped_filter, with_source, write_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::roster::{self, AttitudeScore, SkillAdjustment, StudentPatch};
use serde_json::json;

fn departments_list(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    let (conn, source) = read_conn(state)?;
    let departments = roster::list_departments(conn)?;
    Ok(with_source(json!({ "departments": departments }), source))
}

fn students_list(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_staff(state)?;
    let filter = scoped_filter(&actor, params)?;
    let (conn, source) = read_conn(state)?;
    let students = roster::list_students(conn, &filter)?;
    Ok(with_source(json!({ "students": students }), source))
}

fn students_get(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let (conn, source) = read_conn(state)?;
    let student = roster::get_student(conn, &student_id)?;
    if !actor.can_view_student(&student) {
        return Err(DomainError::forbidden("student is out of scope").into());
    }
    let departments = roster::list_departments(conn).unwrap_or_default();
    let overview = roster::overview_for(conn, student, &departments);
    Ok(with_source(json!({ "student": overview }), source))
}

fn students_overview(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(state)?;
    let (conn, source) = read_conn(state)?;
    let rows = match &actor {
        Actor::Student { student_id, .. } => {
            let student = roster::get_student(conn, student_id)?;
            let departments = roster::list_departments(conn).unwrap_or_default();
            vec![roster::overview_for(conn, student, &departments)]
        }
        staff => roster::overview(conn, &scoped_filter(staff, params)?)?,
    };
    Ok(with_source(json!({ "students": rows }), source))
}

fn students_update(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_staff(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let empty = json!({});
    let patch_raw = params.get("patch").unwrap_or(&empty);
    let patch = StudentPatch {
        class_name: patch_raw
            .get("className")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        points: get_optional_i64(patch_raw, "points")?,
    };

    let conn = write_conn(state)?;
    let student = roster::get_student(conn, &student_id)?;
    if !actor.can_manage_student(&student) {
        return Err(DomainError::forbidden("student is out of scope").into());
    }
    let updated = roster::update_student(conn, &student, &patch)?;
    tracing::info!(student = %updated.id, by = actor.id(), "student updated");
    Ok(json!({ "student": updated }))
}

fn skills_adjust(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_staff(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let adj = SkillAdjustment {
        score: get_optional_f64(params, "score")?,
        points_delta: get_optional_i64(params, "pointsDelta")?.unwrap_or(0),
    };
    if adj.score.is_none() && adj.points_delta == 0 {
        return Err(HandlerErr::bad_params("nothing to adjust: pass score or pointsDelta"));
    }

    let conn = write_conn(state)?;
    let student = roster::get_student(conn, &student_id)?;
    if !actor.can_assess(&student) {
        return Err(DomainError::forbidden(
            "only subject teachers or the department head may adjust skills",
        )
        .into());
    }
    let change = roster::adjust_skill(conn, &student, &adj)?;
    if change.level_changed() {
        tracing::info!(
            student = %student.id,
            from = change.before.level_rank,
            to = change.after.level_rank,
            "level changed"
        );
        state.events.publish(
            conn,
            &WorkflowEvent::LevelChanged {
                student_id: student.id.clone(),
                from_rank: change.before.level_rank,
                to_rank: change.after.level_rank,
                level_name: change.level.name.clone(),
            },
        );
    }
    Ok(json!({
        "studentId": student.id,
        "skill": change.after,
        "previous": change.before,
        "level": change.level,
        "levelChanged": change.level_changed(),
    }))
}

fn discipline_get(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let (conn, source) = read_conn(state)?;
    let student = roster::get_student(conn, &student_id)?;
    if !actor.can_view_student(&student) {
        return Err(DomainError::forbidden("student is out of scope").into());
    }
    let record = roster::discipline(conn, &student.id)?;
    let average = record.attitude_average();
    Ok(with_source(
        json!({
            "studentId": student.id,
            "discipline": record,
            "attitudeAverage": average,
        }),
        source,
    ))
}

fn count(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    Ok(get_optional_i64(params, key)?.unwrap_or(0))
}

fn discipline_save(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_staff(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let counts = (
        count(params, "hadir")?,
        count(params, "izin")?,
        count(params, "sakit")?,
        count(params, "alpa")?,
    );
    let mut attitude = Vec::new();
    if let Some(items) = params.get("attitude").and_then(|v| v.as_array()) {
        for item in items {
            let aspect = get_optional_str(item, "aspect")
                .ok_or_else(|| HandlerErr::bad_params("attitude items need an aspect"))?;
            let score = item
                .get("score")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| HandlerErr::bad_params("attitude items need a numeric score"))?;
            attitude.push(AttitudeScore { aspect, score });
        }
    }

    let conn = write_conn(state)?;
    let student = roster::get_student(conn, &student_id)?;
    let allowed = match &actor {
        Actor::Walas { class_name, .. } => *class_name == student.class_name,
        Actor::Hod { jurusan_id, .. } => *jurusan_id == student.jurusan_id,
        _ => false,
    };
    if !allowed {
        return Err(DomainError::forbidden(
            "only the homeroom teacher or the department head may record discipline",
        )
        .into());
    }
    let record = roster::save_discipline(conn, &student.id, counts, &attitude)?;
    let average = record.attitude_average();
    Ok(json!({
        "studentId": student.id,
        "discipline": record,
        "attitudeAverage": average,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "departments.list" => departments_list(state),
        "students.list" => students_list(state, &req.params),
        "students.get" => students_get(state, &req.params),
        "students.overview" => students_overview(state, &req.params),
        "students.update" => students_update(state, &req.params),
        "skills.adjust" => skills_adjust(state, &req.params),
        "discipline.get" => discipline_get(state, &req.params),
        "discipline.save" => discipline_save(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
