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

/// Program costing exactly 1000 with the whole cost collected at
/// registration (matrícula 600 + inscripción 400).
fn seed_paid_enrollment(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> (String, String) {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let program = request_ok(
        stdin,
        reader,
        "s2",
        "programs.create",
        json!({
            "codigo": "SAL-01",
            "nombre": "Saldos",
            "duracionMeses": 4,
            "horasTotales": 80,
            "costoTotal": 1000.0,
            "costoMatricula": 600.0,
            "costoInscripcion": 400.0,
            "fechaInicio": "2024-02-01"
        }),
    );
    let program_id = program
        .get("programId")
        .and_then(|v| v.as_str())
        .expect("programId")
        .to_string();
    let student = request_ok(
        stdin,
        reader,
        "s3",
        "students.create",
        json!({
            "ciNumero": "9012345",
            "ciExpedicion": "TJ",
            "nombres": "Julia",
            "apellidoPaterno": "Arce"
        }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request_ok(
        stdin,
        reader,
        "s4",
        "enrollments.create",
        json!({ "programId": program_id, "studentId": student_id }),
    );
    (student_id, program_id)
}

#[test]
fn fully_paid_enrollment_reports_zero_balance_and_completo() {
    let workspace = temp_dir("formagest-report-completo");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (student_id, program_id) = seed_paid_enrollment(&mut stdin, &mut reader, &workspace);

    let enrollments = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "enrollments.byStudent",
        json!({ "studentId": student_id }),
    );
    let enrollment_id = enrollments
        .get("enrollments")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|e| e.get("enrollmentId"))
        .and_then(|v| v.as_str())
        .expect("enrollmentId")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "payments.register",
        json!({
            "enrollmentId": enrollment_id,
            "montoPagado": 1000.0,
            "formaPago": "EFECTIVO"
        }),
    );

    let balances = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "reports.studentBalances",
        json!({ "studentId": student_id }),
    );
    let row = balances
        .get("balances")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .expect("balance row")
        .clone();
    assert_eq!(row.get("costoTotal").and_then(|v| v.as_f64()), Some(1000.0));
    assert_eq!(row.get("totalPagado").and_then(|v| v.as_f64()), Some(1000.0));
    assert_eq!(row.get("saldoPendiente").and_then(|v| v.as_f64()), Some(0.0));
    assert_eq!(
        row.get("estadoFinanciero").and_then(|v| v.as_str()),
        Some("COMPLETO")
    );
    assert_eq!(
        row.get("porcentajePagado").and_then(|v| v.as_f64()),
        Some(100.0)
    );

    // Fully paid students never show up in the delinquency sweep.
    let overdue = request_ok(&mut stdin, &mut reader, "4", "reports.overdue", json!({}));
    assert_eq!(
        overdue.get("morosos").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    let _ = program_id;
}

#[test]
fn partial_payment_buckets_and_annulled_transactions_are_excluded() {
    let workspace = temp_dir("formagest-report-parcial");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (student_id, _program_id) = seed_paid_enrollment(&mut stdin, &mut reader, &workspace);
    let program_id = seed_program_id(&mut stdin, &mut reader, &student_id);

    // 500 of 1000 confirmed: PARCIAL at exactly 50%.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "transactions.create",
        json!({
            "studentId": student_id,
            "programId": program_id,
            "montoTotal": 500.0,
            "formaPago": "EFECTIVO",
            "estado": "CONFIRMADO",
            "detalles": [
                { "concepto": "MENSUALIDAD", "cantidad": 2, "precioUnitario": 250.0 }
            ]
        }),
    );

    let balances = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.studentBalances",
        json!({ "studentId": student_id }),
    );
    let row = balances
        .get("balances")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .expect("balance row")
        .clone();
    assert_eq!(row.get("saldoPendiente").and_then(|v| v.as_f64()), Some(500.0));
    assert_eq!(
        row.get("estadoFinanciero").and_then(|v| v.as_str()),
        Some("PARCIAL")
    );

    // A REGISTRADO (unconfirmed) transaction adds nothing to the paid total.
    let registered = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "transactions.create",
        json!({
            "studentId": student_id,
            "programId": program_id,
            "montoTotal": 100.0,
            "formaPago": "EFECTIVO",
            "detalles": [
                { "concepto": "MENSUALIDAD", "cantidad": 1, "precioUnitario": 100.0 }
            ]
        }),
    );
    let _ = registered;
    let balances = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "reports.studentBalances",
        json!({ "studentId": student_id }),
    );
    let row = balances
        .get("balances")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .expect("balance row")
        .clone();
    assert_eq!(row.get("totalPagado").and_then(|v| v.as_f64()), Some(500.0));
}

/// The seeded program id, looked up by its unique code.
fn seed_program_id(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    _student_id: &str,
) -> String {
    let programs = request_ok(
        stdin,
        reader,
        "lookup-program",
        "programs.list",
        json!({ "codigo": "SAL-01" }),
    );
    programs
        .get("programs")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|p| p.get("id"))
        .and_then(|v| v.as_str())
        .expect("program id")
        .to_string()
}

#[test]
fn overdue_sweep_honors_threshold() {
    let workspace = temp_dir("formagest-report-moroso");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    // Program started 2024-02-01 and nothing was ever paid: the enrollment
    // owes 1000 and the clock runs from the program start.
    let (_student_id, _program_id) = seed_paid_enrollment(&mut stdin, &mut reader, &workspace);

    let overdue = request_ok(&mut stdin, &mut reader, "1", "reports.overdue", json!({}));
    let morosos = overdue
        .get("morosos")
        .and_then(|v| v.as_array())
        .expect("morosos");
    assert_eq!(morosos.len(), 1);
    let dias = morosos[0]
        .get("diasSinPago")
        .and_then(|v| v.as_i64())
        .expect("diasSinPago");
    assert!(dias > 30, "expected long delinquency, got {} days", dias);
    assert_eq!(overdue.get("umbralDias").and_then(|v| v.as_i64()), Some(30));

    // With an absurdly generous threshold nobody is moroso.
    let relaxed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.overdue",
        json!({ "thresholdDays": 1000000 }),
    );
    assert_eq!(
        relaxed.get("morosos").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    // The threshold also follows the stored configuration.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "config.set",
        json!({ "clave": "moroso_dias_umbral", "valor": "999999" }),
    );
    let via_config = request_ok(&mut stdin, &mut reader, "4", "reports.overdue", json!({}));
    assert_eq!(
        via_config
            .get("morosos")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );
    assert_eq!(
        via_config.get("umbralDias").and_then(|v| v.as_i64()),
        Some(999999)
    );
}

#[test]
fn monthly_income_zero_fills_all_twelve_months() {
    let workspace = temp_dir("formagest-report-monthly");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (student_id, _program_id) = seed_paid_enrollment(&mut stdin, &mut reader, &workspace);
    let program_id = seed_program_id(&mut stdin, &mut reader, &student_id);

    for (id, fecha, monto) in [
        ("1", "2026-03-05", 200.0),
        ("2", "2026-03-25", 300.0),
        ("3", "2026-07-10", 150.0),
    ] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "transactions.create",
            json!({
                "studentId": student_id,
                "programId": program_id,
                "montoTotal": monto,
                "formaPago": "EFECTIVO",
                "estado": "CONFIRMADO",
                "fechaPago": fecha,
                "detalles": [
                    { "concepto": "MENSUALIDAD", "cantidad": 1, "precioUnitario": monto }
                ]
            }),
        );
    }

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "reports.monthlyIncome",
        json!({ "year": 2026 }),
    );
    let meses = report.get("meses").and_then(|v| v.as_array()).expect("meses");
    assert_eq!(meses.len(), 12);
    let marzo = &meses[2];
    assert_eq!(marzo.get("cantidad").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(marzo.get("monto").and_then(|v| v.as_f64()), Some(500.0));
    let julio = &meses[6];
    assert_eq!(julio.get("monto").and_then(|v| v.as_f64()), Some(150.0));
    let enero = &meses[0];
    assert_eq!(enero.get("cantidad").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(report.get("totalAnual").and_then(|v| v.as_f64()), Some(650.0));
}
