use crate::db;
use crate::finance;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_i64, opt_str, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::Datelike;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

/// One balance row per enrollment, paid totals restricted to CONFIRMADO.
fn balance_rows(
    conn: &Connection,
    where_sql: &str,
    binds: Vec<rusqlite::types::Value>,
) -> rusqlite::Result<Vec<serde_json::Value>> {
    let sql = format!(
        "SELECT
           i.id, i.estudiante_id, i.programa_id, i.estado, i.fecha_inscripcion,
           e.nombres || ' ' || e.apellido_paterno || COALESCE(' ' || e.apellido_materno, ''),
           e.ci_numero || '-' || e.ci_expedicion,
           p.codigo, p.nombre, p.fecha_inicio, p.numero_cuotas,
           COALESCE(NULLIF(i.valor_final, 0), p.costo_total),
           (SELECT COALESCE(SUM(t.monto_final), 0)
              FROM transacciones t
             WHERE t.estudiante_id = i.estudiante_id
               AND t.programa_id = i.programa_id
               AND t.estado = 'CONFIRMADO'),
           (SELECT MAX(t.fecha_pago)
              FROM transacciones t
             WHERE t.estudiante_id = i.estudiante_id
               AND t.programa_id = i.programa_id
               AND t.estado = 'CONFIRMADO'),
           (SELECT COUNT(*)
              FROM transacciones t
             WHERE t.estudiante_id = i.estudiante_id
               AND t.programa_id = i.programa_id
               AND t.estado = 'CONFIRMADO')
         FROM inscripciones i
         JOIN estudiantes e ON e.id = i.estudiante_id
         JOIN programas p ON p.id = i.programa_id
         {}
         ORDER BY e.apellido_paterno, e.nombres, p.codigo",
        where_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |row| {
            let enrollment_id: String = row.get(0)?;
            let student_id: String = row.get(1)?;
            let program_id: String = row.get(2)?;
            let estado_inscripcion: String = row.get(3)?;
            let fecha_inscripcion: String = row.get(4)?;
            let estudiante: String = row.get(5)?;
            let ci: String = row.get(6)?;
            let codigo: String = row.get(7)?;
            let programa: String = row.get(8)?;
            let fecha_inicio: Option<String> = row.get(9)?;
            let numero_cuotas: i64 = row.get(10)?;
            let costo: f64 = row.get(11)?;
            let pagado: f64 = row.get(12)?;
            let ultimo_pago: Option<String> = row.get(13)?;
            let pagos: i64 = row.get(14)?;
            Ok(json!({
                "enrollmentId": enrollment_id,
                "studentId": student_id,
                "programId": program_id,
                "estadoInscripcion": estado_inscripcion,
                "fechaInscripcion": fecha_inscripcion,
                "estudiante": estudiante,
                "estudianteCi": ci,
                "programaCodigo": codigo,
                "programaNombre": programa,
                "programaFechaInicio": fecha_inicio,
                "numeroCuotas": numero_cuotas,
                "costoTotal": finance::round_money(costo),
                "totalPagado": finance::round_money(pagado),
                "saldoPendiente": finance::saldo_pendiente(costo, pagado),
                "porcentajePagado": finance::porcentaje_pagado(costo, pagado),
                "estadoFinanciero": finance::estado_financiero(costo, pagado),
                "ultimoPago": ultimo_pago,
                "pagosConfirmados": pagos
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_reports_student_balances(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(student_id) = opt_str(req, "studentId") {
        clauses.push("i.estudiante_id = ?".into());
        binds.push(rusqlite::types::Value::Text(student_id));
    }
    if let Some(program_id) = opt_str(req, "programId") {
        clauses.push("i.programa_id = ?".into());
        binds.push(rusqlite::types::Value::Text(program_id));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    match balance_rows(conn, &where_sql, binds) {
        Ok(balances) => ok(&req.id, json!({ "balances": balances })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_reports_top_payers(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let limit = opt_i64(req, "limit").unwrap_or(10).clamp(1, 100);

    let mut clauses = vec!["t.estado = 'CONFIRMADO'".to_string()];
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(year) = opt_i64(req, "year") {
        clauses.push("substr(t.fecha_pago, 1, 4) = ?".into());
        binds.push(rusqlite::types::Value::Text(format!("{:04}", year)));
    }
    binds.push(rusqlite::types::Value::Integer(limit));

    let sql = format!(
        "SELECT
           e.id,
           e.nombres || ' ' || e.apellido_paterno || COALESCE(' ' || e.apellido_materno, ''),
           e.ci_numero || '-' || e.ci_expedicion,
           COUNT(*),
           COALESCE(SUM(t.monto_final), 0),
           MAX(t.fecha_pago)
         FROM transacciones t
         JOIN estudiantes e ON e.id = t.estudiante_id
         WHERE {}
         GROUP BY e.id
         ORDER BY SUM(t.monto_final) DESC
         LIMIT ?",
        clauses.join(" AND ")
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |row| {
            Ok(json!({
                "studentId": row.get::<_, String>(0)?,
                "estudiante": row.get::<_, String>(1)?,
                "estudianteCi": row.get::<_, String>(2)?,
                "pagos": row.get::<_, i64>(3)?,
                "totalPagado": finance::round_money(row.get::<_, f64>(4)?),
                "ultimoPago": row.get::<_, Option<String>>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(payers) => ok(&req.id, json!({ "topPayers": payers })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Delinquency sweep over enrollments that still owe money. The clock starts
/// at the last confirmed payment, or at the enrollment (or program start)
/// when nothing was ever paid.
fn handle_reports_overdue(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let umbral = opt_i64(req, "thresholdDays")
        .unwrap_or_else(|| db::config_i64(conn, "moroso_dias_umbral", 30));
    if umbral < 0 {
        return err(&req.id, "bad_params", "thresholdDays must be >= 0", None);
    }
    let hoy = finance::today();

    let rows = match balance_rows(
        conn,
        "WHERE i.estado NOT IN ('RETIRADO', 'CONCLUIDO')",
        Vec::new(),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut morosos = Vec::new();
    for row in rows {
        let saldo = row
            .get("saldoPendiente")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        if saldo <= 0.0 {
            continue;
        }
        let ultimo_pago = row
            .get("ultimoPago")
            .and_then(|v| v.as_str())
            .and_then(finance::parse_date);
        let referencia = row
            .get("programaFechaInicio")
            .and_then(|v| v.as_str())
            .and_then(finance::parse_date)
            .or_else(|| {
                row.get("fechaInscripcion")
                    .and_then(|v| v.as_str())
                    .and_then(finance::parse_date)
            })
            .unwrap_or(hoy);
        let eval = finance::evaluar_mora(ultimo_pago, referencia, hoy, umbral, saldo);
        if eval.moroso {
            let mut entry = row.clone();
            entry["diasSinPago"] = json!(eval.dias_sin_pago);
            morosos.push(entry);
        }
    }
    morosos.sort_by_key(|m| {
        std::cmp::Reverse(m.get("diasSinPago").and_then(|v| v.as_i64()).unwrap_or(0))
    });

    ok(
        &req.id,
        json!({
            "umbralDias": umbral,
            "fechaCorte": hoy.format("%Y-%m-%d").to_string(),
            "morosos": morosos
        }),
    )
}

fn handle_reports_monthly_income(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = opt_i64(req, "year").unwrap_or_else(|| finance::today().year() as i64);
    let prefix = format!("{:04}", year);

    let mut stmt = match conn.prepare(
        "SELECT substr(fecha_pago, 6, 2), COUNT(*), COALESCE(SUM(monto_final), 0)
         FROM transacciones
         WHERE estado = 'CONFIRMADO' AND substr(fecha_pago, 1, 4) = ?
         GROUP BY substr(fecha_pago, 6, 2)",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let by_month: Result<Vec<(String, i64, f64)>, _> = stmt
        .query_map([&prefix], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect());
    let by_month = match by_month {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // All twelve months appear, zero-filled, so charts stay aligned.
    let mut meses = Vec::with_capacity(12);
    let mut total_anual = 0.0;
    for month in 1..=12u32 {
        let key = format!("{:02}", month);
        let (cantidad, monto) = by_month
            .iter()
            .find(|(m, _, _)| *m == key)
            .map(|(_, c, s)| (*c, *s))
            .unwrap_or((0, 0.0));
        total_anual += monto;
        meses.push(json!({
            "mes": month,
            "cantidad": cantidad,
            "monto": finance::round_money(monto)
        }));
    }

    ok(
        &req.id,
        json!({
            "year": year,
            "meses": meses,
            "totalAnual": finance::round_money(total_anual)
        }),
    )
}

fn handle_reports_enrollment_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let program_id = match required_str(req, "programId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let program: Option<(String, String)> = match conn
        .query_row(
            "SELECT codigo, nombre FROM programas WHERE id = ?",
            [&program_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((codigo, nombre)) = program else {
        return err(&req.id, "not_found", "programa not found", None);
    };

    let rows = match balance_rows(
        conn,
        "WHERE i.programa_id = ?",
        vec![rusqlite::types::Value::Text(program_id.clone())],
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut total_esperado = 0.0;
    let mut total_recaudado = 0.0;
    for row in &rows {
        total_esperado += row.get("costoTotal").and_then(|v| v.as_f64()).unwrap_or(0.0);
        total_recaudado += row
            .get("totalPagado")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
    }

    ok(
        &req.id,
        json!({
            "program": { "id": program_id, "codigo": codigo, "nombre": nombre },
            "inscripciones": rows.len(),
            "totalEsperado": finance::round_money(total_esperado),
            "totalRecaudado": finance::round_money(total_recaudado),
            "saldoPorCobrar": finance::saldo_pendiente(total_esperado, total_recaudado),
            "estudiantes": rows
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.studentBalances" => Some(handle_reports_student_balances(state, req)),
        "reports.topPayers" => Some(handle_reports_top_payers(state, req)),
        "reports.overdue" => Some(handle_reports_overdue(state, req)),
        "reports.monthlyIncome" => Some(handle_reports_monthly_income(state, req)),
        "reports.enrollmentSummary" => Some(handle_reports_enrollment_summary(state, req)),
        _ => None,
    }
}
