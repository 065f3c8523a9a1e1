use crate::domain::ExpedicionCi;
use crate::finance;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, limit_offset, now_timestamp, opt_bool, opt_date, opt_str, required_str, today_string,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;
use uuid::Uuid;

const STUDENT_COLUMNS: &str = "id, ci_numero, ci_expedicion, nombres, apellido_paterno,
    apellido_materno, fecha_nacimiento, telefono, email, direccion, profesion,
    universidad, fotografia_url, activo, fecha_registro";

fn student_json(row: &Row) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let ci_numero: String = row.get(1)?;
    let ci_expedicion: String = row.get(2)?;
    let nombres: String = row.get(3)?;
    let apellido_paterno: String = row.get(4)?;
    let apellido_materno: Option<String> = row.get(5)?;
    let fecha_nacimiento: Option<String> = row.get(6)?;
    let telefono: Option<String> = row.get(7)?;
    let email: Option<String> = row.get(8)?;
    let direccion: Option<String> = row.get(9)?;
    let profesion: Option<String> = row.get(10)?;
    let universidad: Option<String> = row.get(11)?;
    let fotografia_url: Option<String> = row.get(12)?;
    let activo: i64 = row.get(13)?;
    let fecha_registro: String = row.get(14)?;

    let display_name = match apellido_materno.as_deref() {
        Some(m) if !m.is_empty() => format!("{} {} {}", nombres, apellido_paterno, m),
        _ => format!("{} {}", nombres, apellido_paterno),
    };
    Ok(json!({
        "id": id,
        "ciNumero": ci_numero,
        "ciExpedicion": ci_expedicion,
        "ciCompleto": format!("{}-{}", ci_numero, ci_expedicion),
        "nombres": nombres,
        "apellidoPaterno": apellido_paterno,
        "apellidoMaterno": apellido_materno,
        "displayName": display_name,
        "fechaNacimiento": fecha_nacimiento,
        "telefono": telefono,
        "email": email,
        "direccion": direccion,
        "profesion": profesion,
        "universidad": universidad,
        "fotografiaUrl": fotografia_url,
        "activo": activo != 0,
        "fechaRegistro": fecha_registro
    }))
}

fn ci_exists(conn: &Connection, ci: &str, exclude_id: Option<&str>) -> rusqlite::Result<bool> {
    let found: Option<i64> = match exclude_id {
        Some(id) => conn
            .query_row(
                "SELECT 1 FROM estudiantes WHERE ci_numero = ? AND id != ?",
                (ci, id),
                |r| r.get(0),
            )
            .optional()?,
        None => conn
            .query_row("SELECT 1 FROM estudiantes WHERE ci_numero = ?", [ci], |r| {
                r.get(0)
            })
            .optional()?,
    };
    Ok(found.is_some())
}

fn email_exists(conn: &Connection, email: &str, exclude_id: Option<&str>) -> rusqlite::Result<bool> {
    let found: Option<i64> = match exclude_id {
        Some(id) => conn
            .query_row(
                "SELECT 1 FROM estudiantes WHERE email = ? AND id != ?",
                (email, id),
                |r| r.get(0),
            )
            .optional()?,
        None => conn
            .query_row("SELECT 1 FROM estudiantes WHERE email = ?", [email], |r| {
                r.get(0)
            })
            .optional()?,
    };
    Ok(found.is_some())
}

fn valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
}

/// CI numbers are digits only, 5 to 15 of them, dashes/spaces tolerated.
fn normalize_ci(ci: &str) -> Option<String> {
    let cleaned: String = ci.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();
    if cleaned.len() < 5 || cleaned.len() > 15 || !cleaned.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(cleaned)
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let ci_raw = match required_str(req, "ciNumero") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(ci_numero) = normalize_ci(&ci_raw) else {
        return err(
            &req.id,
            "bad_params",
            "ciNumero must be 5-15 digits",
            Some(json!({ "ciNumero": ci_raw })),
        );
    };
    let expedicion_raw = match required_str(req, "ciExpedicion") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(ci_expedicion) = ExpedicionCi::parse(&expedicion_raw) else {
        return err(
            &req.id,
            "bad_params",
            "ciExpedicion must be one of: BE, CH, CB, LP, OR, PD, PT, SC, TJ, EX",
            Some(json!({ "ciExpedicion": expedicion_raw })),
        );
    };
    let nombres = match required_str(req, "nombres") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let apellido_paterno = match required_str(req, "apellidoPaterno") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let fecha_nacimiento = match opt_date(req, "fechaNacimiento") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(nacimiento) = fecha_nacimiento {
        if nacimiento > finance::today() {
            return err(
                &req.id,
                "bad_params",
                "fechaNacimiento must not be in the future",
                None,
            );
        }
    }

    let email = opt_str(req, "email");
    if let Some(ref e_mail) = email {
        if !valid_email(e_mail) {
            return err(&req.id, "bad_params", "email is not valid", None);
        }
    }

    // Uniqueness gates run before any write.
    match ci_exists(conn, &ci_numero, None) {
        Ok(true) => {
            return err(
                &req.id,
                "conflict",
                "El número de CI ya está registrado",
                Some(json!({ "ciNumero": ci_numero })),
            )
        }
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if let Some(ref e_mail) = email {
        match email_exists(conn, e_mail, None) {
            Ok(true) => {
                return err(
                    &req.id,
                    "conflict",
                    "El email ya está registrado",
                    Some(json!({ "email": e_mail })),
                )
            }
            Ok(false) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let student_id = Uuid::new_v4().to_string();
    let activo = opt_bool(req, "activo").unwrap_or(true);
    if let Err(e) = conn.execute(
        "INSERT INTO estudiantes(
            id, ci_numero, ci_expedicion, nombres, apellido_paterno, apellido_materno,
            fecha_nacimiento, telefono, email, direccion, profesion, universidad,
            fotografia_url, activo, fecha_registro
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &student_id,
            &ci_numero,
            ci_expedicion.as_str(),
            &nombres,
            &apellido_paterno,
            opt_str(req, "apellidoMaterno"),
            fecha_nacimiento.map(|d| d.format("%Y-%m-%d").to_string()),
            opt_str(req, "telefono"),
            email,
            opt_str(req, "direccion"),
            opt_str(req, "profesion"),
            opt_str(req, "universidad"),
            opt_str(req, "fotografiaUrl"),
            activo as i64,
            now_timestamp(),
        ],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "estudiantes" })),
        );
    }

    ok(
        &req.id,
        json!({ "studentId": student_id, "ciNumero": ci_numero }),
    )
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM estudiantes WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "estudiante not found", None);
    }

    let mut sets: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();

    let str_field = |v: &serde_json::Value| -> Option<String> {
        v.as_str().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
    };

    if let Some(v) = patch.get("ciNumero") {
        let Some(ci) = str_field(v).and_then(|s| normalize_ci(&s)) else {
            return err(&req.id, "bad_params", "ciNumero must be 5-15 digits", None);
        };
        match ci_exists(conn, &ci, Some(&student_id)) {
            Ok(true) => {
                return err(
                    &req.id,
                    "conflict",
                    "El número de CI ya está registrado",
                    Some(json!({ "ciNumero": ci })),
                )
            }
            Ok(false) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
        sets.push("ci_numero = ?".into());
        binds.push(rusqlite::types::Value::Text(ci));
    }
    if let Some(v) = patch.get("ciExpedicion") {
        let Some(expedicion) = str_field(v).and_then(|s| ExpedicionCi::parse(&s)) else {
            return err(&req.id, "bad_params", "ciExpedicion is not a valid code", None);
        };
        sets.push("ci_expedicion = ?".into());
        binds.push(rusqlite::types::Value::Text(expedicion.as_str().to_string()));
    }
    if let Some(v) = patch.get("email") {
        match str_field(v) {
            Some(e_mail) => {
                if !valid_email(&e_mail) {
                    return err(&req.id, "bad_params", "email is not valid", None);
                }
                match email_exists(conn, &e_mail, Some(&student_id)) {
                    Ok(true) => {
                        return err(
                            &req.id,
                            "conflict",
                            "El email ya está registrado",
                            Some(json!({ "email": e_mail })),
                        )
                    }
                    Ok(false) => {}
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                }
                sets.push("email = ?".into());
                binds.push(rusqlite::types::Value::Text(e_mail));
            }
            None => {
                sets.push("email = NULL".into());
            }
        }
    }
    if let Some(v) = patch.get("fechaNacimiento") {
        match str_field(v) {
            Some(s) => {
                let Some(fecha) = finance::parse_date(&s) else {
                    return err(
                        &req.id,
                        "bad_params",
                        "fechaNacimiento must be a YYYY-MM-DD date",
                        None,
                    );
                };
                if fecha > finance::today() {
                    return err(
                        &req.id,
                        "bad_params",
                        "fechaNacimiento must not be in the future",
                        None,
                    );
                }
                sets.push("fecha_nacimiento = ?".into());
                binds.push(rusqlite::types::Value::Text(s));
            }
            None => sets.push("fecha_nacimiento = NULL".into()),
        }
    }
    for (key, column, required) in [
        ("nombres", "nombres", true),
        ("apellidoPaterno", "apellido_paterno", true),
        ("apellidoMaterno", "apellido_materno", false),
        ("telefono", "telefono", false),
        ("direccion", "direccion", false),
        ("profesion", "profesion", false),
        ("universidad", "universidad", false),
        ("fotografiaUrl", "fotografia_url", false),
    ] {
        if let Some(v) = patch.get(key) {
            match str_field(v) {
                Some(s) => {
                    sets.push(format!("{} = ?", column));
                    binds.push(rusqlite::types::Value::Text(s));
                }
                None if required => {
                    return err(
                        &req.id,
                        "bad_params",
                        format!("{} must not be empty", key),
                        None,
                    )
                }
                None => sets.push(format!("{} = NULL", column)),
            }
        }
    }
    if let Some(v) = patch.get("activo").and_then(|v| v.as_bool()) {
        sets.push("activo = ?".into());
        binds.push(rusqlite::types::Value::Integer(v as i64));
    }

    if sets.is_empty() {
        return err(&req.id, "bad_params", "patch contains no recognized fields", None);
    }

    let sql = format!("UPDATE estudiantes SET {} WHERE id = ?", sets.join(", "));
    binds.push(rusqlite::types::Value::Text(student_id.clone()));
    if let Err(e) = conn.execute(&sql, rusqlite::params_from_iter(binds)) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "estudiantes" })),
        );
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let sql = format!("SELECT {} FROM estudiantes WHERE id = ?", STUDENT_COLUMNS);
    match conn
        .query_row(&sql, [&student_id], |row| student_json(row))
        .optional()
    {
        Ok(Some(student)) => ok(&req.id, json!({ "student": student })),
        Ok(None) => err(&req.id, "not_found", "estudiante not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (limit, offset) = limit_offset(req, 100);
    let active_only = opt_bool(req, "activeOnly").unwrap_or(false);

    let sql = format!(
        "SELECT {} FROM estudiantes
         {}
         ORDER BY apellido_paterno, apellido_materno, nombres
         LIMIT ? OFFSET ?",
        STUDENT_COLUMNS,
        if active_only { "WHERE activo = 1" } else { "" }
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([limit, offset], |row| student_json(row))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let total: i64 = match conn.query_row(
        if active_only {
            "SELECT COUNT(*) FROM estudiantes WHERE activo = 1"
        } else {
            "SELECT COUNT(*) FROM estudiantes"
        },
        [],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    match rows {
        Ok(students) => ok(
            &req.id,
            json!({ "students": students, "total": total, "limit": limit, "offset": offset }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_search(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (limit, offset) = limit_offset(req, 100);

    let mut where_clauses: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();

    // "1234567-LP" searches number and expedition at once.
    if let Some(ci) = opt_str(req, "ci") {
        if let Some((numero, expedicion)) = ci.split_once('-') {
            where_clauses.push("ci_numero LIKE ?".into());
            binds.push(rusqlite::types::Value::Text(format!("%{}%", numero.trim())));
            if !expedicion.trim().is_empty() {
                where_clauses.push("UPPER(ci_expedicion) LIKE ?".into());
                binds.push(rusqlite::types::Value::Text(format!(
                    "%{}%",
                    expedicion.trim().to_ascii_uppercase()
                )));
            }
        } else {
            where_clauses.push("ci_numero LIKE ?".into());
            binds.push(rusqlite::types::Value::Text(format!("%{}%", ci)));
        }
    }
    if let Some(expedicion) = opt_str(req, "expedicion") {
        where_clauses.push("ci_expedicion = ?".into());
        binds.push(rusqlite::types::Value::Text(expedicion.to_ascii_uppercase()));
    }
    for (key, column) in [
        ("nombre", "nombres"),
        ("apellidoPaterno", "apellido_paterno"),
        ("apellidoMaterno", "apellido_materno"),
    ] {
        if let Some(v) = opt_str(req, key) {
            where_clauses.push(format!("{} LIKE ?", column));
            binds.push(rusqlite::types::Value::Text(format!("%{}%", v)));
        }
    }
    if opt_bool(req, "activeOnly").unwrap_or(false) {
        where_clauses.push("activo = 1".into());
    }

    let where_sql = if where_clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", where_clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT {} FROM estudiantes {} ORDER BY apellido_paterno, apellido_materno, nombres
         LIMIT ? OFFSET ?",
        STUDENT_COLUMNS, where_sql
    );
    binds.push(rusqlite::types::Value::Integer(limit));
    binds.push(rusqlite::types::Value::Integer(offset));

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |row| student_json(row))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => {
            let count = students.len();
            ok(&req.id, json!({ "students": students, "count": count }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn set_student_active(state: &mut AppState, req: &Request, active: bool) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let changed = match conn.execute(
        "UPDATE estudiantes SET activo = ? WHERE id = ?",
        (active as i64, &student_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "estudiante not found", None);
    }
    ok(&req.id, json!({ "studentId": student_id, "activo": active }))
}

fn handle_students_programs(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT
           i.id,
           p.id,
           p.codigo,
           p.nombre,
           p.estado,
           i.estado,
           i.fecha_inscripcion,
           p.fecha_inicio,
           p.fecha_fin,
           COALESCE(NULLIF(i.valor_final, 0), p.costo_total),
           (SELECT COALESCE(SUM(t.monto_final), 0)
              FROM transacciones t
             WHERE t.estudiante_id = i.estudiante_id
               AND t.programa_id = i.programa_id
               AND t.estado = 'CONFIRMADO')
         FROM inscripciones i
         JOIN programas p ON p.id = i.programa_id
         WHERE i.estudiante_id = ?
         ORDER BY i.fecha_inscripcion DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&student_id], |row| {
            let inscripcion_id: String = row.get(0)?;
            let programa_id: String = row.get(1)?;
            let codigo: String = row.get(2)?;
            let nombre: String = row.get(3)?;
            let estado_programa: String = row.get(4)?;
            let estado_inscripcion: String = row.get(5)?;
            let fecha_inscripcion: String = row.get(6)?;
            let fecha_inicio: Option<String> = row.get(7)?;
            let fecha_fin: Option<String> = row.get(8)?;
            let costo: f64 = row.get(9)?;
            let pagado: f64 = row.get(10)?;
            Ok(json!({
                "enrollmentId": inscripcion_id,
                "programId": programa_id,
                "codigo": codigo,
                "nombre": nombre,
                "estadoPrograma": estado_programa,
                "estadoInscripcion": estado_inscripcion,
                "fechaInscripcion": fecha_inscripcion,
                "fechaInicio": fecha_inicio,
                "fechaFin": fecha_fin,
                "costoTotal": costo,
                "totalPagado": finance::round_money(pagado),
                "saldoPendiente": finance::saldo_pendiente(costo, pagado),
                "porcentajePagado": finance::porcentaje_pagado(costo, pagado),
                "estadoFinanciero": finance::estado_financiero(costo, pagado)
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(programs) => ok(&req.id, json!({ "programs": programs })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_financial_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM estudiantes WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "estudiante not found", None);
    }

    let totals: (i64, f64) = match conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(COALESCE(NULLIF(i.valor_final, 0), p.costo_total)), 0)
         FROM inscripciones i
         JOIN programas p ON p.id = i.programa_id
         WHERE i.estudiante_id = ? AND i.estado != 'RETIRADO'",
        [&student_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (total_programas, total_inscrito) = totals;

    let pagos: (i64, f64, Option<String>) = match conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(monto_final), 0), MAX(fecha_pago)
         FROM transacciones
         WHERE estudiante_id = ? AND estado = 'CONFIRMADO'",
        [&student_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (transacciones_totales, total_pagado, ultimo_pago) = pagos;

    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "totalProgramas": total_programas,
            "totalInscrito": finance::round_money(total_inscrito),
            "totalPagado": finance::round_money(total_pagado),
            "totalDeuda": finance::saldo_pendiente(total_inscrito, total_pagado),
            "transaccionesTotales": transacciones_totales,
            "ultimoPago": ultimo_pago,
            "estadoFinanciero": finance::estado_financiero(total_inscrito, total_pagado)
        }),
    )
}

fn handle_students_payment_schedule(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT p.id, p.nombre, p.fecha_inicio, i.fecha_inscripcion,
                p.costo_matricula, p.costo_inscripcion, p.costo_mensualidad, p.numero_cuotas
         FROM inscripciones i
         JOIN programas p ON p.id = i.programa_id
         WHERE i.estudiante_id = ? AND i.estado NOT IN ('RETIRADO', 'CONCLUIDO')
         ORDER BY i.fecha_inscripcion",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows: Result<Vec<_>, _> = stmt
        .query_map([&student_id], |row| {
            let programa_id: String = row.get(0)?;
            let nombre: String = row.get(1)?;
            let fecha_inicio: Option<String> = row.get(2)?;
            let fecha_inscripcion: String = row.get(3)?;
            let matricula: f64 = row.get(4)?;
            let inscripcion: f64 = row.get(5)?;
            let mensualidad: f64 = row.get(6)?;
            let cuotas: i64 = row.get(7)?;
            Ok((
                programa_id,
                nombre,
                fecha_inicio,
                fecha_inscripcion,
                matricula,
                inscripcion,
                mensualidad,
                cuotas,
            ))
        })
        .and_then(|it| it.collect());

    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut schedule = Vec::with_capacity(rows.len());
    for (programa_id, nombre, fecha_inicio, fecha_inscripcion, matricula, inscripcion, mensualidad, cuotas) in rows
    {
        // The plan anchors on the program start when set, else the enrollment date.
        let base = fecha_inicio
            .as_deref()
            .and_then(finance::parse_date)
            .or_else(|| finance::parse_date(&fecha_inscripcion))
            .unwrap_or_else(finance::today);
        let cuotas_programadas =
            finance::cronograma_pagos(base, matricula, inscripcion, mensualidad, cuotas);
        schedule.push(json!({
            "programId": programa_id,
            "programa": nombre,
            "cuotas": cuotas_programadas,
        }));
    }

    ok(&req.id, json!({ "studentId": student_id, "schedule": schedule, "generatedAt": today_string() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.get" => Some(handle_students_get(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.search" => Some(handle_students_search(state, req)),
        "students.deactivate" => Some(set_student_active(state, req, false)),
        "students.activate" => Some(set_student_active(state, req, true)),
        "students.programs" => Some(handle_students_programs(state, req)),
        "students.financialSummary" => Some(handle_students_financial_summary(state, req)),
        "students.paymentSchedule" => Some(handle_students_payment_schedule(state, req)),
        _ => None,
    }
}
