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
fn username_uniqueness_and_role_changes() {
    let workspace = temp_dir("formagest-users");
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
        "users.create",
        json!({
            "username": "cajero1",
            "passwordHash": "$2b$12$abcdefghijklmnopqrstuv",
            "nombreCompleto": "Cajero Uno"
        }),
    );
    let user_id = created
        .get("userId")
        .and_then(|v| v.as_str())
        .expect("userId")
        .to_string();
    assert_eq!(created.get("rol").and_then(|v| v.as_str()), Some("CAJERO"));

    let dup = request(
        &mut stdin,
        &mut reader,
        "3",
        "users.create",
        json!({
            "username": "cajero1",
            "passwordHash": "$2b$12$xxxxxxxxxxxxxxxxxxxxxx",
            "nombreCompleto": "Otro"
        }),
    );
    assert_eq!(error_code(&dup), "conflict");

    let bad_role = request(
        &mut stdin,
        &mut reader,
        "4",
        "users.create",
        json!({
            "username": "superroot",
            "passwordHash": "$2b$12$yyyyyyyyyyyyyyyyyyyyyy",
            "nombreCompleto": "Root",
            "rol": "SUPERUSUARIO"
        }),
    );
    assert_eq!(error_code(&bad_role), "bad_params");

    let promoted = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "users.changeRole",
        json!({ "userId": user_id, "rol": "COORDINADOR" }),
    );
    assert_eq!(promoted.get("rol").and_then(|v| v.as_str()), Some("COORDINADOR"));

    // The password hash stays out of every read payload.
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "users.get",
        json!({ "username": "cajero1" }),
    );
    let user = fetched.get("user").expect("user");
    assert!(user.get("passwordHash").is_none());
    assert_eq!(user.get("rol").and_then(|v| v.as_str()), Some("COORDINADOR"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "users.deactivate",
        json!({ "userId": user_id }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "users.list",
        json!({ "activeOnly": true }),
    );
    assert_eq!(
        listed.get("users").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
}

#[test]
fn config_seeds_upserts_and_editable_guard() {
    let workspace = temp_dir("formagest-config");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // Seeded defaults are present from the first open.
    let seeded = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "config.get",
        json!({ "clave": "moroso_dias_umbral" }),
    );
    assert_eq!(
        seeded
            .get("config")
            .and_then(|c| c.get("valor"))
            .and_then(|v| v.as_str()),
        Some("30")
    );

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "config.set",
        json!({ "clave": "moroso_dias_umbral", "valor": "45" }),
    );
    assert_eq!(updated.get("created").and_then(|v| v.as_bool()), Some(false));

    let inserted = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "config.set",
        json!({ "clave": "tema_ui", "valor": "oscuro", "categoria": "UI" }),
    );
    assert_eq!(inserted.get("created").and_then(|v| v.as_bool()), Some(true));

    let by_category = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "config.list",
        json!({ "categoria": "UI" }),
    );
    assert_eq!(
        by_category
            .get("configs")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );

    // A row flagged non-editable refuses both edits and deletion.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "config.set",
        json!({ "clave": "schema_version", "valor": "1", "editable": false }),
    );
    let frozen_edit = request(
        &mut stdin,
        &mut reader,
        "7",
        "config.set",
        json!({ "clave": "schema_version", "valor": "2" }),
    );
    assert_eq!(error_code(&frozen_edit), "invalid_state");
    let frozen_delete = request(
        &mut stdin,
        &mut reader,
        "8",
        "config.delete",
        json!({ "clave": "schema_version" }),
    );
    assert_eq!(error_code(&frozen_delete), "invalid_state");

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "config.delete",
        json!({ "clave": "tema_ui" }),
    );
    assert_eq!(deleted.get("deleted").and_then(|v| v.as_bool()), Some(true));
}

#[test]
fn company_single_row_upsert() {
    let workspace = temp_dir("formagest-company");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let missing = request(&mut stdin, &mut reader, "2", "company.get", json!({}));
    assert_eq!(error_code(&missing), "not_found");

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "company.save",
        json!({ "nombre": "Instituto FormaGest", "nit": "1023456789" }),
    );
    assert_eq!(first.get("created").and_then(|v| v.as_bool()), Some(true));

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "company.save",
        json!({ "nombre": "Instituto FormaGest SRL", "nit": "1023456789",
                "telefono": "2-2441122" }),
    );
    assert_eq!(second.get("created").and_then(|v| v.as_bool()), Some(false));

    let fetched = request_ok(&mut stdin, &mut reader, "5", "company.get", json!({}));
    let company = fetched.get("company").expect("company");
    assert_eq!(
        company.get("nombre").and_then(|v| v.as_str()),
        Some("Instituto FormaGest SRL")
    );
    assert_eq!(
        company.get("telefono").and_then(|v| v.as_str()),
        Some("2-2441122")
    );
}
