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

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    ci: &str,
    nombres: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({
            "ciNumero": ci,
            "ciExpedicion": "LP",
            "nombres": nombres,
            "apellidoPaterno": "Prueba"
        }),
    );
    created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string()
}

#[test]
fn last_slot_goes_to_exactly_one_student() {
    let workspace = temp_dir("formagest-slots-last");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let program = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "programs.create",
        json!({ "codigo": "CUPO-1", "nombre": "Cupo único", "duracionMeses": 3, "horasTotales": 60,
                "costoTotal": 900.0, "cuposMaximos": 1 }),
    );
    let program_id = program
        .get("programId")
        .and_then(|v| v.as_str())
        .expect("programId")
        .to_string();

    let student_a = create_student(&mut stdin, &mut reader, "3", "1000001", "Alicia");
    let student_b = create_student(&mut stdin, &mut reader, "4", "1000002", "Bruno");

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "enrollments.create",
        json!({ "programId": program_id, "studentId": student_a }),
    );
    assert_eq!(first.get("cuposDisponibles").and_then(|v| v.as_i64()), Some(0));

    let second = request(
        &mut stdin,
        &mut reader,
        "6",
        "enrollments.create",
        json!({ "programId": program_id, "studentId": student_b }),
    );
    assert_eq!(second.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(error_code(&second), "no_cupos");
    assert!(second
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .contains("no cupos disponibles"));

    // The failed attempt must not have touched the counter.
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "programs.get",
        json!({ "programId": program_id }),
    );
    assert_eq!(
        fetched
            .get("program")
            .and_then(|p| p.get("cuposInscritos"))
            .and_then(|v| v.as_i64()),
        Some(1)
    );
}

#[test]
fn unlimited_program_reports_minus_one() {
    let workspace = temp_dir("formagest-slots-unlimited");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let program = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "programs.create",
        json!({ "codigo": "SIN-CUPO", "nombre": "Sin tope", "duracionMeses": 3, "horasTotales": 60 }),
    );
    let program_id = program
        .get("programId")
        .and_then(|v| v.as_str())
        .expect("programId")
        .to_string();
    let student = create_student(&mut stdin, &mut reader, "3", "1000003", "Carmen");

    let enrolled = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "enrollments.create",
        json!({ "programId": program_id, "studentId": student }),
    );
    assert_eq!(
        enrolled.get("cuposDisponibles").and_then(|v| v.as_i64()),
        Some(-1)
    );

    let availability = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "enrollments.availability",
        json!({ "programId": program_id }),
    );
    assert_eq!(
        availability.get("disponible").and_then(|v| v.as_bool()),
        Some(true)
    );
    assert_eq!(
        availability.get("cuposDisponibles").and_then(|v| v.as_i64()),
        Some(-1)
    );
}

#[test]
fn duplicate_pair_and_cancelled_program_are_rejected() {
    let workspace = temp_dir("formagest-slots-rules");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let program = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "programs.create",
        json!({ "codigo": "REG-01", "nombre": "Reglas", "duracionMeses": 3, "horasTotales": 60,
                "cuposMaximos": 20 }),
    );
    let program_id = program
        .get("programId")
        .and_then(|v| v.as_str())
        .expect("programId")
        .to_string();
    let student = create_student(&mut stdin, &mut reader, "3", "1000004", "Diego");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "enrollments.create",
        json!({ "programId": program_id, "studentId": student }),
    );
    let dup = request(
        &mut stdin,
        &mut reader,
        "5",
        "enrollments.create",
        json!({ "programId": program_id, "studentId": student }),
    );
    assert_eq!(error_code(&dup), "conflict");

    let ghost = request(
        &mut stdin,
        &mut reader,
        "6",
        "enrollments.create",
        json!({ "programId": "no-such-program", "studentId": student }),
    );
    assert_eq!(error_code(&ghost), "not_found");

    let cancelled_program = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "programs.create",
        json!({ "codigo": "REG-02", "nombre": "Cerrado", "duracionMeses": 3, "horasTotales": 60 }),
    );
    let cancelled_id = cancelled_program
        .get("programId")
        .and_then(|v| v.as_str())
        .expect("programId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "programs.cancel",
        json!({ "programId": cancelled_id }),
    );
    let into_cancelled = request(
        &mut stdin,
        &mut reader,
        "9",
        "enrollments.create",
        json!({ "programId": cancelled_id, "studentId": student }),
    );
    assert_eq!(error_code(&into_cancelled), "invalid_state");
}

#[test]
fn withdraw_releases_the_slot() {
    let workspace = temp_dir("formagest-slots-withdraw");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let program = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "programs.create",
        json!({ "codigo": "RET-01", "nombre": "Retiros", "duracionMeses": 3, "horasTotales": 60,
                "cuposMaximos": 1 }),
    );
    let program_id = program
        .get("programId")
        .and_then(|v| v.as_str())
        .expect("programId")
        .to_string();
    let student_a = create_student(&mut stdin, &mut reader, "3", "1000005", "Elena");
    let student_b = create_student(&mut stdin, &mut reader, "4", "1000006", "Felipe");

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "enrollments.create",
        json!({ "programId": program_id, "studentId": student_a }),
    );
    let enrollment_id = first
        .get("enrollmentId")
        .and_then(|v| v.as_str())
        .expect("enrollmentId")
        .to_string();

    let full = request(
        &mut stdin,
        &mut reader,
        "6",
        "enrollments.create",
        json!({ "programId": program_id, "studentId": student_b }),
    );
    assert_eq!(error_code(&full), "no_cupos");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "enrollments.withdraw",
        json!({ "enrollmentId": enrollment_id }),
    );

    // The freed slot is takeable again.
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "enrollments.create",
        json!({ "programId": program_id, "studentId": student_b }),
    );
    assert_eq!(second.get("cuposDisponibles").and_then(|v| v.as_i64()), Some(0));
}
