use crate::finance;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_i64};
use crate::ipc::types::{AppState, Request};
use chrono::Datelike;
use serde_json::json;

fn handle_dashboard_metrics(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let hoy = finance::today();
    let inicio_mes = format!("{:04}-{:02}-01", hoy.year(), hoy.month());
    let prefix_anio = format!("{:04}", hoy.year());

    let total_estudiantes: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM estudiantes WHERE activo = 1",
        [],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let total_docentes: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM docentes WHERE activo = 1",
        [],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let programas_activos: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM programas WHERE estado NOT IN ('CANCELADO', 'CONCLUIDO')",
        [],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let programas_anio: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM programas WHERE substr(fecha_inicio, 1, 4) = ?",
        [&prefix_anio],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let ingresos_mes: f64 = match conn.query_row(
        "SELECT COALESCE(SUM(monto_final), 0) FROM transacciones
         WHERE estado = 'CONFIRMADO' AND fecha_pago >= ?",
        [&inicio_mes],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let inscripciones_mes: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM inscripciones WHERE fecha_inscripcion >= ?",
        [&inicio_mes],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "totalEstudiantes": total_estudiantes,
            "totalDocentes": total_docentes,
            "programasActivos": programas_activos,
            "programasAnioActual": programas_anio,
            "ingresosMes": finance::round_money(ingresos_mes),
            "inscripcionesMes": inscripciones_mes,
            "anioActual": hoy.year(),
            "fechaActual": hoy.format("%Y-%m-%d").to_string()
        }),
    )
}

fn handle_dashboard_student_distribution(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let limit = opt_i64(req, "limit").unwrap_or(10).clamp(1, 50);

    let mut stmt = match conn.prepare(
        "SELECT p.id, p.codigo, p.nombre, COUNT(i.id)
         FROM programas p
         LEFT JOIN inscripciones i ON i.programa_id = p.id AND i.estado != 'RETIRADO'
         WHERE p.estado NOT IN ('CANCELADO', 'CONCLUIDO')
         GROUP BY p.id
         HAVING COUNT(i.id) > 0
         ORDER BY COUNT(i.id) DESC
         LIMIT ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([limit], |row| {
            Ok(json!({
                "programId": row.get::<_, String>(0)?,
                "codigo": row.get::<_, String>(1)?,
                "nombre": row.get::<_, String>(2)?,
                "inscritos": row.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(distribucion) => ok(&req.id, json!({ "distribucion": distribucion })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_dashboard_programs_in_progress(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let limit = opt_i64(req, "limit").unwrap_or(10).clamp(1, 50);

    let mut stmt = match conn.prepare(
        "SELECT
           p.id, p.codigo, p.nombre, p.estado, p.cupos_maximos, p.cupos_inscritos,
           p.fecha_inicio, p.fecha_fin, p.duracion_meses, p.horas_totales,
           CASE WHEN d.id IS NULL THEN NULL
                ELSE d.grado_academico || ' ' || d.nombres || ' ' || d.apellidos
           END
         FROM programas p
         LEFT JOIN docentes d ON d.id = p.docente_coordinador_id
         WHERE p.estado IN ('PLANIFICADO', 'INSCRIPCIONES', 'EN_CURSO')
         ORDER BY p.fecha_inicio DESC
         LIMIT ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([limit], |row| {
            let cupos_maximos: Option<i64> = row.get(4)?;
            let cupos_inscritos: i64 = row.get(5)?;
            let ocupacion = match cupos_maximos {
                Some(max) if max > 0 => {
                    finance::round_money(100.0 * cupos_inscritos as f64 / max as f64)
                }
                _ => 0.0,
            };
            Ok(json!({
                "programId": row.get::<_, String>(0)?,
                "codigo": row.get::<_, String>(1)?,
                "nombre": row.get::<_, String>(2)?,
                "estado": row.get::<_, String>(3)?,
                "cuposMaximos": cupos_maximos,
                "cuposInscritos": cupos_inscritos,
                "porcentajeOcupacion": ocupacion,
                "fechaInicio": row.get::<_, Option<String>>(6)?,
                "fechaFin": row.get::<_, Option<String>>(7)?,
                "duracionMeses": row.get::<_, i64>(8)?,
                "horasTotales": row.get::<_, i64>(9)?,
                "coordinador": row.get::<_, Option<String>>(10)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(programas) => ok(&req.id, json!({ "programas": programas })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Month-by-month cash flow from the ledger, oldest first, with a running
/// balance. Egresos are real EGRESO movements, not an estimate.
fn handle_dashboard_financial_history(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let months = opt_i64(req, "months").unwrap_or(6).clamp(1, 36);

    let hoy = finance::today();
    let mut labels = Vec::with_capacity(months as usize);
    for i in (0..months).rev() {
        let d = finance::add_months(hoy, -i);
        labels.push(format!("{:04}-{:02}", d.year(), d.month()));
    }

    let mut stmt = match conn.prepare(
        "SELECT
           COALESCE(SUM(CASE WHEN tipo = 'INGRESO' THEN monto ELSE 0 END), 0),
           COALESCE(SUM(CASE WHEN tipo = 'EGRESO' THEN monto ELSE 0 END), 0)
         FROM movimientos_caja
         WHERE substr(fecha, 1, 7) = ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut series = Vec::with_capacity(labels.len());
    let mut saldo_acumulado = 0.0;
    for label in labels {
        let (ingresos, egresos): (f64, f64) =
            match stmt.query_row([&label], |r| Ok((r.get(0)?, r.get(1)?))) {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
        let saldo = ingresos - egresos;
        saldo_acumulado += saldo;
        series.push(json!({
            "mes": label,
            "ingresos": finance::round_money(ingresos),
            "egresos": finance::round_money(egresos),
            "saldo": finance::round_money(saldo),
            "saldoAcumulado": finance::round_money(saldo_acumulado)
        }));
    }

    ok(&req.id, json!({ "meses": series }))
}

fn handle_dashboard_occupancy(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let row: (i64, i64, i64) = match conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(cupos_maximos), 0), COALESCE(SUM(cupos_inscritos), 0)
         FROM programas
         WHERE estado NOT IN ('CANCELADO', 'CONCLUIDO') AND cupos_maximos IS NOT NULL",
        [],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (programas, cupos, inscritos) = row;
    let ocupacion = if cupos > 0 {
        finance::round_money(100.0 * inscritos as f64 / cupos as f64)
    } else {
        0.0
    };

    ok(
        &req.id,
        json!({
            "programasConCupo": programas,
            "cuposTotales": cupos,
            "cuposOcupados": inscritos,
            "ocupacionPromedio": ocupacion
        }),
    )
}

fn handle_dashboard_alerts(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let hoy = finance::today();
    let hoy_str = hoy.format("%Y-%m-%d").to_string();
    let mut alertas = Vec::new();

    // Programs at 90%+ capacity.
    let mut stmt = match conn.prepare(
        "SELECT codigo, nombre, cupos_inscritos, cupos_maximos
         FROM programas
         WHERE estado NOT IN ('CANCELADO', 'CONCLUIDO')
           AND cupos_maximos IS NOT NULL
           AND cupos_inscritos * 10 >= cupos_maximos * 9
         ORDER BY CAST(cupos_inscritos AS REAL) / cupos_maximos DESC
         LIMIT 5",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let llenos: Result<Vec<(String, String, i64, i64)>, _> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
        .and_then(|it| it.collect());
    match llenos {
        Ok(rows) => {
            for (codigo, nombre, inscritos, maximos) in rows {
                let pct = if maximos > 0 {
                    (100 * inscritos / maximos).min(100)
                } else {
                    0
                };
                alertas.push(json!({
                    "tipo": "programa_lleno",
                    "nivel": "advertencia",
                    "mensaje": format!("Programa {} - {} está al {}% de capacidad", codigo, nombre, pct)
                }));
            }
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    // Enrollments a month old with no payment at all.
    let mut stmt = match conn.prepare(
        "SELECT e.nombres || ' ' || e.apellido_paterno, p.nombre
         FROM inscripciones i
         JOIN estudiantes e ON e.id = i.estudiante_id
         JOIN programas p ON p.id = i.programa_id
         WHERE i.estado IN ('PREINSCRITO', 'INSCRITO', 'EN_CURSO')
           AND i.fecha_inscripcion <= date(?, '-30 days')
           AND NOT EXISTS (
             SELECT 1 FROM transacciones t
             WHERE t.estudiante_id = i.estudiante_id
               AND t.programa_id = i.programa_id
               AND t.estado = 'CONFIRMADO'
           )
         LIMIT 5",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let sin_pago: Result<Vec<(String, String)>, _> = stmt
        .query_map([&hoy_str], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect());
    match sin_pago {
        Ok(rows) => {
            for (estudiante, programa) in rows {
                alertas.push(json!({
                    "tipo": "pago_atrasado",
                    "nivel": "critico",
                    "mensaje": format!("Estudiante {} tiene pago pendiente en {}", estudiante, programa)
                }));
            }
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    // Programs starting within a week.
    let mut stmt = match conn.prepare(
        "SELECT codigo, nombre, fecha_inicio,
                CAST(julianday(fecha_inicio) - julianday(?) AS INTEGER)
         FROM programas
         WHERE estado = 'PLANIFICADO'
           AND fecha_inicio IS NOT NULL
           AND fecha_inicio >= ?
           AND fecha_inicio <= date(?, '+7 days')
         ORDER BY fecha_inicio",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let proximos: Result<Vec<(String, String, String, i64)>, _> = stmt
        .query_map([&hoy_str, &hoy_str, &hoy_str], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect());
    match proximos {
        Ok(rows) => {
            for (codigo, nombre, _fecha, dias) in rows {
                alertas.push(json!({
                    "tipo": "inicio_programa",
                    "nivel": "informacion",
                    "mensaje": format!("Programa {} - {} inicia en {} días", codigo, nombre, dias)
                }));
            }
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    ok(&req.id, json!({ "fecha": hoy_str, "alertas": alertas }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.metrics" => Some(handle_dashboard_metrics(state, req)),
        "dashboard.studentDistribution" => Some(handle_dashboard_student_distribution(state, req)),
        "dashboard.programsInProgress" => Some(handle_dashboard_programs_in_progress(state, req)),
        "dashboard.financialHistory" => Some(handle_dashboard_financial_history(state, req)),
        "dashboard.occupancy" => Some(handle_dashboard_occupancy(state, req)),
        "dashboard.alerts" => Some(handle_dashboard_alerts(state, req)),
        _ => None,
    }
}
