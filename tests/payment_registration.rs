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

/// Workspace with one program (matrícula 200, inscripción 100) and one
/// enrolled student; returns (enrollmentId, studentId, programId).
fn seed_enrollment(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> (String, String, String) {
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
            "codigo": "PAG-01",
            "nombre": "Programa de pagos",
            "duracionMeses": 6,
            "horasTotales": 120,
            "costoTotal": 1800.0,
            "costoMatricula": 200.0,
            "costoInscripcion": 100.0,
            "costoMensualidad": 250.0,
            "numeroCuotas": 6
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
            "ciNumero": "4455123",
            "ciExpedicion": "LP",
            "nombres": "Gabriela",
            "apellidoPaterno": "Torrez"
        }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let enrollment = request_ok(
        stdin,
        reader,
        "s4",
        "enrollments.create",
        json!({ "programId": program_id, "studentId": student_id }),
    );
    let enrollment_id = enrollment
        .get("enrollmentId")
        .and_then(|v| v.as_str())
        .expect("enrollmentId")
        .to_string();
    (enrollment_id, student_id, program_id)
}

#[test]
fn underpayment_writes_nothing() {
    let workspace = temp_dir("formagest-pay-underpay");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (enrollment_id, student_id, _program_id) =
        seed_enrollment(&mut stdin, &mut reader, &workspace);

    // Due is 300 (200 + 100); 250 is not enough.
    let rejected = request(
        &mut stdin,
        &mut reader,
        "1",
        "payments.register",
        json!({
            "enrollmentId": enrollment_id,
            "montoPagado": 250.0,
            "formaPago": "EFECTIVO"
        }),
    );
    assert_eq!(rejected.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(error_code(&rejected), "insufficient_amount");

    // No transaction, no details, no cash movement may exist.
    let transactions = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "transactions.list",
        json!({ "studentId": student_id }),
    );
    assert_eq!(transactions.get("total").and_then(|v| v.as_i64()), Some(0));
    let cash = request_ok(&mut stdin, &mut reader, "3", "cash.list", json!({}));
    assert_eq!(
        cash.get("movimientos").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    // The enrollment stays PREINSCRITO.
    let enrollments = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "enrollments.byStudent",
        json!({ "studentId": student_id }),
    );
    let estado = enrollments
        .get("enrollments")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|e| e.get("estado"))
        .and_then(|v| v.as_str());
    assert_eq!(estado, Some("PREINSCRITO"));
}

#[test]
fn full_payment_creates_transaction_details_and_cash_movement() {
    let workspace = temp_dir("formagest-pay-full");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (enrollment_id, student_id, _program_id) =
        seed_enrollment(&mut stdin, &mut reader, &workspace);

    let paid = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "payments.register",
        json!({
            "enrollmentId": enrollment_id,
            "montoPagado": 300.0,
            "formaPago": "EFECTIVO"
        }),
    );
    assert_eq!(paid.get("montoTotal").and_then(|v| v.as_f64()), Some(300.0));
    assert_eq!(paid.get("descuentoTotal").and_then(|v| v.as_f64()), Some(0.0));
    assert_eq!(paid.get("montoFinal").and_then(|v| v.as_f64()), Some(300.0));
    assert_eq!(paid.get("cambio").and_then(|v| v.as_f64()), Some(0.0));
    assert_eq!(paid.get("estado").and_then(|v| v.as_str()), Some("CONFIRMADO"));
    assert_eq!(
        paid.get("estadoInscripcion").and_then(|v| v.as_str()),
        Some("INSCRITO")
    );
    let transaction_id = paid
        .get("transactionId")
        .and_then(|v| v.as_str())
        .expect("transactionId")
        .to_string();
    let numero = paid
        .get("numeroTransaccion")
        .and_then(|v| v.as_str())
        .expect("numeroTransaccion")
        .to_string();
    assert!(numero.starts_with("T-"), "unexpected numero {}", numero);

    // monto_final = monto_total - descuento_total on the stored row too.
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "transactions.get",
        json!({ "transactionId": transaction_id }),
    );
    let t = fetched.get("transaction").expect("transaction");
    let monto_total = t.get("montoTotal").and_then(|v| v.as_f64()).expect("montoTotal");
    let descuento = t
        .get("descuentoTotal")
        .and_then(|v| v.as_f64())
        .expect("descuentoTotal");
    let monto_final = t.get("montoFinal").and_then(|v| v.as_f64()).expect("montoFinal");
    assert!((monto_final - (monto_total - descuento)).abs() < 0.001);

    // Detail lines cover matrícula and inscripción, each with the subtotal
    // invariant intact.
    let detalles = t.get("detalles").and_then(|v| v.as_array()).expect("detalles");
    assert_eq!(detalles.len(), 2);
    for d in detalles {
        let cantidad = d.get("cantidad").and_then(|v| v.as_f64()).expect("cantidad");
        let precio = d
            .get("precioUnitario")
            .and_then(|v| v.as_f64())
            .expect("precioUnitario");
        let subtotal = d.get("subtotal").and_then(|v| v.as_f64()).expect("subtotal");
        assert!((subtotal - cantidad * precio).abs() < 0.001);
    }
    let conceptos: Vec<&str> = detalles
        .iter()
        .filter_map(|d| d.get("concepto").and_then(|v| v.as_str()))
        .collect();
    assert!(conceptos.contains(&"MATRICULA"));
    assert!(conceptos.contains(&"INSCRIPCION"));

    // Exactly one cash movement, amount and method matching.
    let cash = request_ok(&mut stdin, &mut reader, "3", "cash.list", json!({}));
    let movimientos = cash
        .get("movimientos")
        .and_then(|v| v.as_array())
        .expect("movimientos");
    assert_eq!(movimientos.len(), 1);
    let m = &movimientos[0];
    assert_eq!(m.get("tipo").and_then(|v| v.as_str()), Some("INGRESO"));
    assert_eq!(m.get("monto").and_then(|v| v.as_f64()), Some(300.0));
    assert_eq!(m.get("formaPago").and_then(|v| v.as_str()), Some("EFECTIVO"));
    assert_eq!(
        m.get("transactionId").and_then(|v| v.as_str()),
        Some(transaction_id.as_str())
    );

    let _ = student_id;
}

#[test]
fn discount_adds_negative_line_and_lowers_the_due() {
    let workspace = temp_dir("formagest-pay-discount");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (enrollment_id, _student_id, _program_id) =
        seed_enrollment(&mut stdin, &mut reader, &workspace);

    let paid = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "payments.register",
        json!({
            "enrollmentId": enrollment_id,
            "montoPagado": 250.0,
            "descuento": 50.0,
            "formaPago": "QR"
        }),
    );
    assert_eq!(paid.get("montoTotal").and_then(|v| v.as_f64()), Some(300.0));
    assert_eq!(paid.get("descuentoTotal").and_then(|v| v.as_f64()), Some(50.0));
    assert_eq!(paid.get("montoFinal").and_then(|v| v.as_f64()), Some(250.0));

    let transaction_id = paid
        .get("transactionId")
        .and_then(|v| v.as_str())
        .expect("transactionId")
        .to_string();
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "transactions.get",
        json!({ "transactionId": transaction_id }),
    );
    let detalles = fetched
        .get("transaction")
        .and_then(|t| t.get("detalles"))
        .and_then(|v| v.as_array())
        .expect("detalles");
    assert_eq!(detalles.len(), 3);
    let descuento_line = detalles
        .iter()
        .find(|d| d.get("concepto").and_then(|v| v.as_str()) == Some("DESCUENTO"))
        .expect("discount line");
    assert_eq!(
        descuento_line.get("subtotal").and_then(|v| v.as_f64()),
        Some(-50.0)
    );

    // Detail subtotals add up to the final amount.
    let suma: f64 = detalles
        .iter()
        .filter_map(|d| d.get("subtotal").and_then(|v| v.as_f64()))
        .sum();
    assert!((suma - 250.0).abs() < 0.001);
}

#[test]
fn transfer_requires_voucher_and_withdrawn_enrollment_rejects_payment() {
    let workspace = temp_dir("formagest-pay-voucher");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (enrollment_id, _student_id, _program_id) =
        seed_enrollment(&mut stdin, &mut reader, &workspace);

    let missing_voucher = request(
        &mut stdin,
        &mut reader,
        "1",
        "payments.register",
        json!({
            "enrollmentId": enrollment_id,
            "montoPagado": 300.0,
            "formaPago": "TRANSFERENCIA"
        }),
    );
    assert_eq!(error_code(&missing_voucher), "bad_params");

    let with_voucher = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "payments.register",
        json!({
            "enrollmentId": enrollment_id,
            "montoPagado": 300.0,
            "formaPago": "TRANSFERENCIA",
            "numeroComprobante": "TRF-0001",
            "bancoOrigen": "Banco Unión"
        }),
    );
    assert_eq!(
        with_voucher.get("estado").and_then(|v| v.as_str()),
        Some("CONFIRMADO")
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "enrollments.withdraw",
        json!({ "enrollmentId": enrollment_id, "motivo": "retiro voluntario" }),
    );
    let after_withdraw = request(
        &mut stdin,
        &mut reader,
        "4",
        "payments.register",
        json!({
            "enrollmentId": enrollment_id,
            "montoPagado": 300.0,
            "formaPago": "EFECTIVO"
        }),
    );
    assert_eq!(error_code(&after_withdraw), "invalid_state");
}
