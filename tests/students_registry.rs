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
    let exe = env!("CARGO_BIN_EXE_formagestd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn formagestd");
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

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

#[test]
fn ci_uniqueness_gate_blocks_duplicates() {
    let workspace = temp_dir("formagest-students-ci");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({
            "ciNumero": "12345678",
            "ciExpedicion": "LP",
            "nombres": "María",
            "apellidoPaterno": "Quispe",
            "apellidoMaterno": "Condori",
            "email": "maria.quispe@example.com"
        }),
    );
    let student_id = created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    // Same CI again: rejected with a uniqueness message and no row created.
    let dup = request(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({
            "ciNumero": "12345678",
            "ciExpedicion": "SC",
            "nombres": "Otro",
            "apellidoPaterno": "Estudiante"
        }),
    );
    assert_eq!(dup.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(error_code(&dup), "conflict");
    assert!(dup
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .contains("CI ya está registrado"));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.list",
        json!({}),
    );
    assert_eq!(listed.get("total").and_then(|v| v.as_i64()), Some(1));

    // Duplicate email is also a conflict.
    let dup_email = request(
        &mut stdin,
        &mut reader,
        "5",
        "students.create",
        json!({
            "ciNumero": "99887766",
            "ciExpedicion": "CB",
            "nombres": "Tercero",
            "apellidoPaterno": "Mamani",
            "email": "maria.quispe@example.com"
        }),
    );
    assert_eq!(error_code(&dup_email), "conflict");

    // Updating the original row keeping its own CI is allowed.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.update",
        json!({
            "studentId": student_id,
            "patch": { "ciNumero": "12345678", "telefono": "70711223" }
        }),
    );
}

#[test]
fn rejects_invalid_expedicion_and_ci_shape() {
    let workspace = temp_dir("formagest-students-validation");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let bad_exp = request(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({
            "ciNumero": "4455667",
            "ciExpedicion": "ZZ",
            "nombres": "Ana",
            "apellidoPaterno": "Rojas"
        }),
    );
    assert_eq!(error_code(&bad_exp), "bad_params");

    let bad_ci = request(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({
            "ciNumero": "12a",
            "ciExpedicion": "LP",
            "nombres": "Ana",
            "apellidoPaterno": "Rojas"
        }),
    );
    assert_eq!(error_code(&bad_ci), "bad_params");

    let future_birth = request(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({
            "ciNumero": "5566778",
            "ciExpedicion": "LP",
            "nombres": "Ana",
            "apellidoPaterno": "Rojas",
            "fechaNacimiento": "2099-01-01"
        }),
    );
    assert_eq!(error_code(&future_birth), "bad_params");
}

#[test]
fn search_accepts_combined_ci_form_and_soft_delete_keeps_row() {
    let workspace = temp_dir("formagest-students-search");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({
            "ciNumero": "6071234",
            "ciExpedicion": "CB",
            "nombres": "Carlos",
            "apellidoPaterno": "Fernández"
        }),
    );
    let student_id = created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let found = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.search",
        json!({ "ci": "6071234-CB" }),
    );
    assert_eq!(found.get("count").and_then(|v| v.as_i64()), Some(1));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.deactivate",
        json!({ "studentId": student_id }),
    );

    // Soft delete: the row survives, only the flag flips.
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.get",
        json!({ "studentId": student_id }),
    );
    assert_eq!(
        fetched
            .get("student")
            .and_then(|s| s.get("activo"))
            .and_then(|v| v.as_bool()),
        Some(false)
    );

    let active_only = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.search",
        json!({ "ci": "6071234", "activeOnly": true }),
    );
    assert_eq!(active_only.get("count").and_then(|v| v.as_i64()), Some(0));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.activate",
        json!({ "studentId": student_id }),
    );
    let active_again = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.search",
        json!({ "ci": "6071234", "activeOnly": true }),
    );
    assert_eq!(active_again.get("count").and_then(|v| v.as_i64()), Some(1));
}
