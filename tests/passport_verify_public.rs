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

#[test]
fn passport_verification_needs_no_session_and_hides_the_nisn() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let workspace = open_seeded_workspace(&mut stdin, &mut reader, "skillpass-passport");

    let by_nis = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "passport.verify",
        json!({ "nis": "2223101" }),
    );
    assert_eq!(by_nis["student"]["name"], json!("Budi Santoso"));
    assert_eq!(by_nis["department"]["code"], json!("TKJ"));
    assert_eq!(by_nis["level"]["rank"], json!(3));
    assert_eq!(by_nis["certifiedUnits"], json!(1));
    assert_eq!(by_nis["history"][0]["certificateEligible"], json!(true));
    assert!(!by_nis.to_string().contains("0061234503"));

    let by_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "passport.verify",
        json!({ "studentId": "stu-siti" }),
    );
    assert_eq!(by_id["student"]["nis"], json!("2223002"));
    assert_eq!(by_id["certifiedUnits"], json!(1));
    assert_eq!(by_id["history"].as_array().map(|a| a.len()), Some(2));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "passport.verify",
        json!({ "nis": "9999999" }),
    );
    assert_eq!(code, "not_found");
    let code = request_err(&mut stdin, &mut reader, "4", "passport.verify", json!({}));
    assert_eq!(code, "bad_params");

    let _ = std::fs::remove_dir_all(workspace);
}
