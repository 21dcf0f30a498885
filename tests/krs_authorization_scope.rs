use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_skillpassd");
    let mut child = Command::new(exe)
        .env_remove("SKILLPASS_WORKSPACE")
        .env_remove("SKILLPASS_STAFF_PASSWORD")
        .env_remove("SKILLPASS_NO_FALLBACK")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn skillpassd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Sends a request expected to fail and returns its error code.
fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

/// Opens a fresh workspace and loads the demo dataset into it.
fn open_seeded_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    prefix: &str,
) -> PathBuf {
    let workspace = temp_dir(prefix);
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = request_ok(stdin, reader, "seed", "workspace.seedDemo", json!({}));
    assert_eq!(seeded["seeded"], json!(true));
    workspace
}

fn login_staff(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    username: &str,
    role: &str,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        &format!("login-{}", username),
        "auth.login",
        json!({ "username": username, "role": role, "password": "skillpass" }),
    )
}

fn login_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    nis: &str,
    nisn: &str,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        &format!("login-{}", nis),
        "auth.login",
        json!({ "username": nis, "role": "student", "password": nisn }),
    )
}

#[test]
fn reviewers_outside_the_department_or_stage_are_refused() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let workspace = open_seeded_workspace(&mut stdin, &mut reader, "skillpass-krs-scope");

    let _ = login_student(&mut stdin, &mut reader, "2223002", "0061234502");
    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "krs.submit",
        json!({ "items": ["Membuat REST API"] }),
    );
    let krs_id = submitted["request"]["id"].as_str().expect("krs id").to_string();

    // A student cannot approve anything.
    let code = request_err(&mut stdin, &mut reader, "2", "krs.approve", json!({ "krsId": krs_id }));
    assert_eq!(code, "forbidden");

    // Subject teacher from another department.
    let _ = login_staff(&mut stdin, &mut reader, "produktif.tkj", "produktif");
    let code = request_err(&mut stdin, &mut reader, "3", "krs.approve", json!({ "krsId": krs_id }));
    assert_eq!(code, "forbidden");
    let code = request_err(&mut stdin, &mut reader, "4", "krs.get", json!({ "krsId": krs_id }));
    assert_eq!(code, "forbidden");
    let listed = request_ok(&mut stdin, &mut reader, "5", "krs.list", json!({}));
    assert_eq!(listed["requests"].as_array().map(|a| a.len()), Some(0));

    // Department head of the right department, wrong stage.
    let _ = login_staff(&mut stdin, &mut reader, "kaprog.rpl", "hod");
    let code = request_err(&mut stdin, &mut reader, "6", "krs.approve", json!({ "krsId": krs_id }));
    assert_eq!(code, "forbidden");

    // Homeroom teacher of the class sees it but does not review RPL requests.
    let _ = login_staff(&mut stdin, &mut reader, "walas.rpl", "walas");
    let seen = request_ok(&mut stdin, &mut reader, "7", "krs.get", json!({ "krsId": krs_id }));
    assert_eq!(seen["request"]["studentName"], json!("Siti Rahmawati"));
    let code = request_err(&mut stdin, &mut reader, "8", "krs.approve", json!({ "krsId": krs_id }));
    assert_eq!(code, "forbidden");

    let _ = login_staff(&mut stdin, &mut reader, "produktif.rpl", "produktif");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "9",
        "krs.reject",
        json!({ "krsId": krs_id, "reason": "   " }),
    );
    assert_eq!(code, "bad_params");
    let step = request_ok(&mut stdin, &mut reader, "10", "krs.approve", json!({ "krsId": krs_id }));
    assert_eq!(step["request"]["status"], json!("pending_hod"));

    // A repeated approval now lands on the department head stage.
    let code = request_err(&mut stdin, &mut reader, "11", "krs.approve", json!({ "krsId": krs_id }));
    assert_eq!(code, "forbidden");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "12",
        "krs.get",
        json!({ "krsId": "krs-does-not-exist" }),
    );
    assert_eq!(code, "not_found");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn scoped_student_reads_follow_the_actor() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let workspace = open_seeded_workspace(&mut stdin, &mut reader, "skillpass-student-scope");

    let _ = login_staff(&mut stdin, &mut reader, "produktif.rpl", "produktif");
    let listed = request_ok(&mut stdin, &mut reader, "1", "students.list", json!({}));
    let ids: Vec<&str> = listed["students"]
        .as_array()
        .expect("students")
        .iter()
        .filter_map(|s| s["id"].as_str())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(!ids.contains(&"stu-budi"));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "students.list",
        json!({ "jurusanId": "jur-tkj" }),
    );
    assert_eq!(code, "forbidden");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "students.get",
        json!({ "studentId": "stu-budi" }),
    );
    assert_eq!(code, "forbidden");

    // Discipline is recorded by homeroom teachers and department heads only.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "discipline.save",
        json!({ "studentId": "stu-andi", "hadir": 10 }),
    );
    assert_eq!(code, "forbidden");

    let _ = login_staff(&mut stdin, &mut reader, "walas.rpl", "walas");
    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "discipline.save",
        json!({
            "studentId": "stu-andi",
            "hadir": 18,
            "izin": 1,
            "sakit": 1,
            "alpa": 0,
            "attitude": [
                { "aspect": "Kedisiplinan", "score": 85 },
                { "aspect": "Kerja sama", "score": 90 }
            ]
        }),
    );
    assert_eq!(saved["discipline"]["percentage"], json!(90.0));
    assert_eq!(saved["attitudeAverage"], json!(87.5));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.update",
        json!({ "studentId": "stu-andi", "patch": { "points": 25 } }),
    );
    assert_eq!(updated["student"]["id"], json!("stu-andi"));

    let _ = login_student(&mut stdin, &mut reader, "2223001", "0061234501");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "history.list",
        json!({ "studentId": "stu-siti" }),
    );
    assert_eq!(code, "forbidden");
    let code = request_err(&mut stdin, &mut reader, "8", "students.list", json!({}));
    assert_eq!(code, "forbidden");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn homeroom_teacher_reads_only_their_own_class() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let workspace = open_seeded_workspace(&mut stdin, &mut reader, "skillpass-walas-reads");

    let _ = login_staff(&mut stdin, &mut reader, "kaprog.rpl", "hod");
    let moved = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.update",
        json!({ "studentId": "stu-andi", "patch": { "className": "XI RPL 2" } }),
    );
    assert_eq!(moved["student"]["className"], json!("XI RPL 2"));

    // walas.rpl keeps XI RPL 1; Andi is in the same department but another class.
    let _ = login_staff(&mut stdin, &mut reader, "walas.rpl", "walas");
    for (id, method) in [("2", "students.get"), ("3", "discipline.get"), ("4", "history.list")] {
        let code = request_err(&mut stdin, &mut reader, id, method, json!({ "studentId": "stu-andi" }));
        assert_eq!(code, "forbidden", "{}", method);
    }
    let own = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.get",
        json!({ "studentId": "stu-siti" }),
    );
    assert_eq!(own["student"]["student"]["id"], json!("stu-siti"));

    let _ = std::fs::remove_dir_all(workspace);
}
