use crate::domain::EstadoInscripcion;
use crate::finance;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_date, opt_f64, opt_str, required_str, today_string};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_enrollments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let program_id = match required_str(req, "programId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let fecha_inscripcion = match opt_date(req, "fechaInscripcion") {
        Ok(v) => v
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(today_string),
        Err(e) => return e,
    };

    // The whole reservation is one transaction: the slot check, the insert
    // and the counter bump either all land or none do, so the last slot can
    // only be taken once.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let program: Option<(String, Option<i64>, i64, f64)> = match tx
        .query_row(
            "SELECT estado, cupos_maximos, cupos_inscritos, costo_total
             FROM programas WHERE id = ?",
            [&program_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((estado_programa, cupos_maximos, cupos_inscritos, costo_total)) = program else {
        return err(&req.id, "not_found", "programa not found", None);
    };
    if estado_programa == "CANCELADO" {
        return err(
            &req.id,
            "invalid_state",
            "programa cancelado no acepta inscripciones",
            None,
        );
    }

    let student_active: Option<i64> = match tx
        .query_row(
            "SELECT activo FROM estudiantes WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match student_active {
        None => return err(&req.id, "not_found", "estudiante not found", None),
        Some(0) => {
            return err(
                &req.id,
                "invalid_state",
                "estudiante inactivo no puede inscribirse",
                None,
            )
        }
        Some(_) => {}
    }

    let duplicate: Option<i64> = match tx
        .query_row(
            "SELECT 1 FROM inscripciones WHERE estudiante_id = ? AND programa_id = ?",
            (&student_id, &program_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if duplicate.is_some() {
        return err(
            &req.id,
            "conflict",
            "el estudiante ya está inscrito en este programa",
            None,
        );
    }

    if let Some(max) = cupos_maximos {
        if cupos_inscritos >= max {
            return err(
                &req.id,
                "no_cupos",
                "no cupos disponibles",
                Some(json!({ "cuposMaximos": max, "cuposInscritos": cupos_inscritos })),
            );
        }
    }

    let valor_final = opt_f64(req, "valorFinal").unwrap_or(costo_total);
    if valor_final < 0.0 {
        return err(&req.id, "bad_params", "valorFinal must be >= 0", None);
    }

    let enrollment_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO inscripciones(
            id, estudiante_id, programa_id, fecha_inscripcion, estado, valor_final, observaciones
         ) VALUES(?, ?, ?, ?, 'PREINSCRITO', ?, ?)",
        rusqlite::params![
            &enrollment_id,
            &student_id,
            &program_id,
            &fecha_inscripcion,
            finance::round_money(valor_final),
            opt_str(req, "observaciones"),
        ],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "inscripciones" })),
        );
    }
    if let Err(e) = tx.execute(
        "UPDATE programas SET cupos_inscritos = cupos_inscritos + 1 WHERE id = ?",
        [&program_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    // -1 means the program has no slot cap.
    let cupos_disponibles = cupos_maximos
        .map(|max| max - cupos_inscritos - 1)
        .unwrap_or(-1);

    ok(
        &req.id,
        json!({
            "enrollmentId": enrollment_id,
            "estado": "PREINSCRITO",
            "valorFinal": finance::round_money(valor_final),
            "fechaInscripcion": fecha_inscripcion,
            "cuposDisponibles": cupos_disponibles
        }),
    )
}

fn handle_enrollments_availability(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let program_id = match required_str(req, "programId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let program: Option<(String, Option<i64>, i64)> = match conn
        .query_row(
            "SELECT estado, cupos_maximos, cupos_inscritos FROM programas WHERE id = ?",
            [&program_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((estado, cupos_maximos, cupos_inscritos)) = program else {
        return err(&req.id, "not_found", "programa not found", None);
    };

    let (disponible, cupos_disponibles, mensaje) = if estado == "CANCELADO" {
        (false, 0, "programa cancelado".to_string())
    } else {
        match cupos_maximos {
            None => (true, -1, "cupos ilimitados".to_string()),
            Some(max) => {
                let restantes = (max - cupos_inscritos).max(0);
                if restantes > 0 {
                    (true, restantes, format!("{} cupos disponibles", restantes))
                } else {
                    (false, 0, "no cupos disponibles".to_string())
                }
            }
        }
    };

    ok(
        &req.id,
        json!({
            "programId": program_id,
            "disponible": disponible,
            "cuposDisponibles": cupos_disponibles,
            "estadoPrograma": estado,
            "mensaje": mensaje
        }),
    )
}

fn enrollment_rows(
    conn: &rusqlite::Connection,
    where_sql: &str,
    binds: Vec<rusqlite::types::Value>,
) -> rusqlite::Result<Vec<serde_json::Value>> {
    let sql = format!(
        "SELECT
           i.id, i.estudiante_id, i.programa_id, i.fecha_inscripcion, i.estado,
           COALESCE(NULLIF(i.valor_final, 0), p.costo_total), i.observaciones,
           e.nombres, e.apellido_paterno, COALESCE(e.apellido_materno, ''),
           e.ci_numero, e.ci_expedicion,
           p.codigo, p.nombre, p.estado,
           (SELECT COALESCE(SUM(t.monto_final), 0)
              FROM transacciones t
             WHERE t.estudiante_id = i.estudiante_id
               AND t.programa_id = i.programa_id
               AND t.estado = 'CONFIRMADO')
         FROM inscripciones i
         JOIN estudiantes e ON e.id = i.estudiante_id
         JOIN programas p ON p.id = i.programa_id
         {}
         ORDER BY i.fecha_inscripcion DESC",
        where_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |row| {
            let id: String = row.get(0)?;
            let estudiante_id: String = row.get(1)?;
            let programa_id: String = row.get(2)?;
            let fecha: String = row.get(3)?;
            let estado: String = row.get(4)?;
            let valor_final: f64 = row.get(5)?;
            let observaciones: Option<String> = row.get(6)?;
            let nombres: String = row.get(7)?;
            let paterno: String = row.get(8)?;
            let materno: String = row.get(9)?;
            let ci_numero: String = row.get(10)?;
            let ci_expedicion: String = row.get(11)?;
            let codigo: String = row.get(12)?;
            let programa_nombre: String = row.get(13)?;
            let programa_estado: String = row.get(14)?;
            let pagado: f64 = row.get(15)?;
            Ok(json!({
                "enrollmentId": id,
                "studentId": estudiante_id,
                "programId": programa_id,
                "fechaInscripcion": fecha,
                "estado": estado,
                "valorFinal": valor_final,
                "observaciones": observaciones,
                "estudiante": format!("{} {} {}", nombres, paterno, materno).trim_end().to_string(),
                "estudianteCi": format!("{}-{}", ci_numero, ci_expedicion),
                "programaCodigo": codigo,
                "programaNombre": programa_nombre,
                "programaEstado": programa_estado,
                "totalPagado": finance::round_money(pagado),
                "saldoPendiente": finance::saldo_pendiente(valor_final, pagado),
                "estadoFinanciero": finance::estado_financiero(valor_final, pagado)
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_enrollments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(estado) = opt_str(req, "estado") {
        if EstadoInscripcion::parse(&estado).is_none() {
            return err(&req.id, "bad_params", "estado is not a valid enrollment state", None);
        }
        clauses.push("i.estado = ?".into());
        binds.push(rusqlite::types::Value::Text(estado));
    }
    if let Some(program_id) = opt_str(req, "programId") {
        clauses.push("i.programa_id = ?".into());
        binds.push(rusqlite::types::Value::Text(program_id));
    }
    match opt_date(req, "desde") {
        Ok(Some(d)) => {
            clauses.push("i.fecha_inscripcion >= ?".into());
            binds.push(rusqlite::types::Value::Text(d.format("%Y-%m-%d").to_string()));
        }
        Ok(None) => {}
        Err(e) => return e,
    }
    match opt_date(req, "hasta") {
        Ok(Some(d)) => {
            clauses.push("i.fecha_inscripcion <= ?".into());
            binds.push(rusqlite::types::Value::Text(d.format("%Y-%m-%d").to_string()));
        }
        Ok(None) => {}
        Err(e) => return e,
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    match enrollment_rows(conn, &where_sql, binds) {
        Ok(enrollments) => ok(&req.id, json!({ "enrollments": enrollments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_enrollments_by_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match enrollment_rows(
        conn,
        "WHERE i.estudiante_id = ?",
        vec![rusqlite::types::Value::Text(student_id)],
    ) {
        Ok(enrollments) => ok(&req.id, json!({ "enrollments": enrollments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_enrollments_by_program(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let program_id = match required_str(req, "programId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match enrollment_rows(
        conn,
        "WHERE i.programa_id = ?",
        vec![rusqlite::types::Value::Text(program_id)],
    ) {
        Ok(enrollments) => ok(&req.id, json!({ "enrollments": enrollments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_enrollments_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let enrollment_id = match required_str(req, "enrollmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let current: Option<String> = match conn
        .query_row(
            "SELECT estado FROM inscripciones WHERE id = ?",
            [&enrollment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if current.is_none() {
        return err(&req.id, "not_found", "inscripción not found", None);
    }

    let mut sets: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();

    if let Some(estado) = opt_str(req, "estado") {
        let Some(parsed) = EstadoInscripcion::parse(&estado) else {
            return err(
                &req.id,
                "bad_params",
                "estado must be one of: PREINSCRITO, INSCRITO, EN_CURSO, CONCLUIDO, RETIRADO",
                Some(json!({ "estado": estado })),
            );
        };
        if parsed == EstadoInscripcion::Retirado {
            return err(
                &req.id,
                "bad_params",
                "use enrollments.withdraw to retire an enrollment",
                None,
            );
        }
        sets.push("estado = ?".into());
        binds.push(rusqlite::types::Value::Text(estado));
    }
    if let Some(valor) = opt_f64(req, "valorFinal") {
        if valor < 0.0 {
            return err(&req.id, "bad_params", "valorFinal must be >= 0", None);
        }
        sets.push("valor_final = ?".into());
        binds.push(rusqlite::types::Value::Real(finance::round_money(valor)));
    }
    if let Some(obs) = opt_str(req, "observaciones") {
        sets.push("observaciones = ?".into());
        binds.push(rusqlite::types::Value::Text(obs));
    }

    if sets.is_empty() {
        return err(&req.id, "bad_params", "nothing to update", None);
    }

    let sql = format!("UPDATE inscripciones SET {} WHERE id = ?", sets.join(", "));
    binds.push(rusqlite::types::Value::Text(enrollment_id.clone()));
    if let Err(e) = conn.execute(&sql, rusqlite::params_from_iter(binds)) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "inscripciones" })),
        );
    }
    ok(&req.id, json!({ "enrollmentId": enrollment_id }))
}

fn handle_enrollments_withdraw(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let enrollment_id = match required_str(req, "enrollmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let row: Option<(String, String)> = match tx
        .query_row(
            "SELECT estado, programa_id FROM inscripciones WHERE id = ?",
            [&enrollment_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((estado, programa_id)) = row else {
        return err(&req.id, "not_found", "inscripción not found", None);
    };
    if estado == "RETIRADO" {
        return err(&req.id, "invalid_state", "inscripción already RETIRADO", None);
    }

    let motivo = opt_str(req, "motivo");
    let observacion = motivo
        .map(|m| format!("RETIRADO: {}", m))
        .unwrap_or_else(|| "RETIRADO".to_string());

    if let Err(e) = tx.execute(
        "UPDATE inscripciones
         SET estado = 'RETIRADO',
             observaciones = CASE
               WHEN observaciones IS NULL OR observaciones = '' THEN ?
               ELSE observaciones || char(10) || ?
             END
         WHERE id = ?",
        (&observacion, &observacion, &enrollment_id),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    // The withdrawn student releases their slot.
    if let Err(e) = tx.execute(
        "UPDATE programas SET cupos_inscritos = MAX(cupos_inscritos - 1, 0) WHERE id = ?",
        [&programa_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "enrollmentId": enrollment_id, "estado": "RETIRADO" }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollments.create" => Some(handle_enrollments_create(state, req)),
        "enrollments.availability" => Some(handle_enrollments_availability(state, req)),
        "enrollments.list" => Some(handle_enrollments_list(state, req)),
        "enrollments.byStudent" => Some(handle_enrollments_by_student(state, req)),
        "enrollments.byProgram" => Some(handle_enrollments_by_program(state, req)),
        "enrollments.update" => Some(handle_enrollments_update(state, req)),
        "enrollments.withdraw" => Some(handle_enrollments_withdraw(state, req)),
        _ => None,
    }
}
