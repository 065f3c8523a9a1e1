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

#[test]
fn metrics_count_active_rows_and_current_month_income() {
    let workspace = temp_dir("formagest-dashboard-metrics");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // Two students, one of them deactivated; one teacher; one cancelled
    // program next to one live program.
    let s1 = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "ciNumero": "1112223", "ciExpedicion": "LP", "nombres": "Ana", "apellidoPaterno": "Mora" }),
    );
    let s1_id = s1.get("studentId").and_then(|v| v.as_str()).expect("id").to_string();
    let s2 = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "ciNumero": "1112224", "ciExpedicion": "LP", "nombres": "Beto", "apellidoPaterno": "Mora" }),
    );
    let s2_id = s2.get("studentId").and_then(|v| v.as_str()).expect("id").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.deactivate",
        json!({ "studentId": s2_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "teachers.create",
        json!({ "ciNumero": "2223334", "ciExpedicion": "SC", "nombres": "Rosa", "apellidos": "Paz",
                "gradoAcademico": "M.Sc.", "tarifaHora": 80.0 }),
    );
    let live = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "programs.create",
        json!({ "codigo": "DASH-01", "nombre": "Activo", "duracionMeses": 3, "horasTotales": 60,
                "costoMatricula": 100.0, "costoInscripcion": 0.0, "cuposMaximos": 10 }),
    );
    let live_id = live.get("programId").and_then(|v| v.as_str()).expect("id").to_string();
    let dead = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "programs.create",
        json!({ "codigo": "DASH-02", "nombre": "Cancelado", "duracionMeses": 3, "horasTotales": 60 }),
    );
    let dead_id = dead.get("programId").and_then(|v| v.as_str()).expect("id").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "programs.cancel",
        json!({ "programId": dead_id }),
    );

    // One enrollment today plus a confirmed payment today.
    let enrollment = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "enrollments.create",
        json!({ "programId": live_id, "studentId": s1_id }),
    );
    let enrollment_id = enrollment
        .get("enrollmentId")
        .and_then(|v| v.as_str())
        .expect("enrollmentId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "payments.register",
        json!({ "enrollmentId": enrollment_id, "montoPagado": 100.0, "formaPago": "EFECTIVO" }),
    );

    let metrics = request_ok(&mut stdin, &mut reader, "11", "dashboard.metrics", json!({}));
    assert_eq!(metrics.get("totalEstudiantes").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(metrics.get("totalDocentes").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(metrics.get("programasActivos").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(metrics.get("ingresosMes").and_then(|v| v.as_f64()), Some(100.0));
    assert_eq!(metrics.get("inscripcionesMes").and_then(|v| v.as_i64()), Some(1));
}

#[test]
fn occupancy_distribution_and_full_program_alert() {
    let workspace = temp_dir("formagest-dashboard-occupancy");
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
        json!({ "codigo": "OCU-01", "nombre": "Casi lleno", "duracionMeses": 3, "horasTotales": 60,
                "cuposMaximos": 2 }),
    );
    let program_id = program
        .get("programId")
        .and_then(|v| v.as_str())
        .expect("programId")
        .to_string();

    for (id, ci, nombre) in [("3", "3334441", "Uno"), ("4", "3334442", "Dos")] {
        let student = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "students.create",
            json!({ "ciNumero": ci, "ciExpedicion": "PT", "nombres": nombre, "apellidoPaterno": "Llenador" }),
        );
        let student_id = student
            .get("studentId")
            .and_then(|v| v.as_str())
            .expect("studentId")
            .to_string();
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("enr-{}", id),
            "enrollments.create",
            json!({ "programId": program_id, "studentId": student_id }),
        );
    }

    let occupancy = request_ok(&mut stdin, &mut reader, "5", "dashboard.occupancy", json!({}));
    assert_eq!(occupancy.get("cuposTotales").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(occupancy.get("cuposOcupados").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(
        occupancy.get("ocupacionPromedio").and_then(|v| v.as_f64()),
        Some(100.0)
    );

    let distribution = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "dashboard.studentDistribution",
        json!({}),
    );
    let rows = distribution
        .get("distribucion")
        .and_then(|v| v.as_array())
        .expect("distribucion");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("inscritos").and_then(|v| v.as_i64()), Some(2));

    // The 100%-full program must raise the capacity alert.
    let alerts = request_ok(&mut stdin, &mut reader, "7", "dashboard.alerts", json!({}));
    let alertas = alerts.get("alertas").and_then(|v| v.as_array()).expect("alertas");
    assert!(alertas
        .iter()
        .any(|a| a.get("tipo").and_then(|v| v.as_str()) == Some("programa_lleno")));
}

#[test]
fn financial_history_builds_monthly_series_from_cash_ledger() {
    let workspace = temp_dir("formagest-dashboard-history");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "ciNumero": "5556667", "ciExpedicion": "BE", "nombres": "Nadia", "apellidoPaterno": "Ríos" }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    // One confirmed payment dated today lands in the current month's bucket.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "transactions.create",
        json!({
            "studentId": student_id,
            "montoTotal": 220.0,
            "formaPago": "EFECTIVO",
            "estado": "CONFIRMADO",
            "detalles": [
                { "concepto": "OTROS", "cantidad": 1, "precioUnitario": 220.0 }
            ]
        }),
    );

    let history = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "dashboard.financialHistory",
        json!({ "months": 3 }),
    );
    let meses = history.get("meses").and_then(|v| v.as_array()).expect("meses");
    assert_eq!(meses.len(), 3);
    let actual = meses.last().expect("current month");
    assert_eq!(actual.get("ingresos").and_then(|v| v.as_f64()), Some(220.0));
    assert_eq!(actual.get("egresos").and_then(|v| v.as_f64()), Some(0.0));
    assert_eq!(
        actual.get("saldoAcumulado").and_then(|v| v.as_f64()),
        Some(220.0)
    );
}
