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
    spawn_sidecar_with(&[])
}

fn spawn_sidecar_with(args: &[&str]) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_skillpassd");
    let mut child = Command::new(exe)
        .args(args)
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
fn reads_use_the_demo_dataset_until_a_workspace_is_opened() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let levels = request_ok(&mut stdin, &mut reader, "1", "levels.list", json!({}));
    assert_eq!(levels["source"], json!("fallback"));
    assert_eq!(levels["levels"].as_array().map(|a| a.len()), Some(3));

    let session = login_staff(&mut stdin, &mut reader, "kaprog.rpl", "hod");
    assert_eq!(session["source"], json!("fallback"));
    let overview = request_ok(&mut stdin, &mut reader, "2", "students.overview", json!({}));
    assert_eq!(overview["source"], json!("fallback"));
    assert_eq!(overview["students"].as_array().map(|a| a.len()), Some(2));

    // Mutations are never served from the fallback store.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "skills.adjust",
        json!({ "studentId": "stu-siti", "score": 90 }),
    );
    assert_eq!(code, "no_workspace");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "settings.set",
        json!({ "key": "school.city", "value": "Garut" }),
    );
    assert_eq!(code, "no_workspace");
    let code = request_err(&mut stdin, &mut reader, "5", "workspace.seedDemo", json!({}));
    assert_eq!(code, "no_workspace");

    let _ = login_student(&mut stdin, &mut reader, "2223001", "0061234501");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "krs.submit",
        json!({ "items": ["Unit apa saja"] }),
    );
    assert_eq!(code, "no_workspace");

    // Opening an empty workspace switches reads over; the demo student is gone.
    let workspace = temp_dir("skillpass-fallback-switch");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let current = request_ok(&mut stdin, &mut reader, "8", "auth.session", json!({}));
    assert_eq!(current["authenticated"], json!(false));
    let levels = request_ok(&mut stdin, &mut reader, "9", "levels.list", json!({}));
    assert_eq!(levels["source"], json!("workspace"));
    assert_eq!(levels["levels"].as_array().map(|a| a.len()), Some(0));

    // Empty catalog still resolves to the placeholder level.
    let resolved = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "levels.resolve",
        json!({ "score": 55 }),
    );
    assert_eq!(resolved["level"]["rank"], json!(1));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn no_fallback_flag_refuses_reads_without_a_workspace() {
    let (_child, mut stdin, mut reader) = spawn_sidecar_with(&["--no-fallback"]);

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["fallbackEnabled"], json!(false));
    let code = request_err(&mut stdin, &mut reader, "2", "levels.list", json!({}));
    assert_eq!(code, "no_workspace");
}

#[test]
fn workspace_flag_opens_the_workspace_at_startup() {
    let workspace = temp_dir("skillpass-startup-workspace");
    let path = workspace.to_string_lossy().to_string();
    let (_child, mut stdin, mut reader) =
        spawn_sidecar_with(&["--workspace", &path, "--staff-password", "rahasia"]);

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["workspacePath"], json!(path));
    let _ = request_ok(&mut stdin, &mut reader, "2", "workspace.seedDemo", json!({}));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "auth.login",
        json!({ "username": "kaprog.rpl", "role": "hod", "password": "skillpass" }),
    );
    assert_eq!(code, "unauthenticated");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "auth.login",
        json!({ "username": "kaprog.rpl", "role": "hod", "password": "rahasia" }),
    );
    let set = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "settings.set",
        json!({ "key": "school.city", "value": "Garut" }),
    );
    assert_eq!(set["value"], json!("Garut"));
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "settings.get",
        json!({ "key": "school.city" }),
    );
    assert_eq!(got["value"], json!("Garut"));

    let _ = std::fs::remove_dir_all(workspace);
}
