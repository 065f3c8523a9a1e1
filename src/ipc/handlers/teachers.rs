use crate::domain::{self, ExpedicionCi};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, limit_offset, now_timestamp, opt_bool, opt_f64, opt_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;
use uuid::Uuid;

const TEACHER_COLUMNS: &str = "id, ci_numero, ci_expedicion, nombres, apellidos,
    grado_academico, tarifa_hora, telefono, email, activo, fecha_registro";

fn teacher_json(row: &Row) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let ci_numero: String = row.get(1)?;
    let ci_expedicion: String = row.get(2)?;
    let nombres: String = row.get(3)?;
    let apellidos: String = row.get(4)?;
    let grado_academico: String = row.get(5)?;
    let tarifa_hora: f64 = row.get(6)?;
    let telefono: Option<String> = row.get(7)?;
    let email: Option<String> = row.get(8)?;
    let activo: i64 = row.get(9)?;
    let fecha_registro: String = row.get(10)?;
    Ok(json!({
        "id": id,
        "ciNumero": ci_numero,
        "ciExpedicion": ci_expedicion,
        "nombres": nombres,
        "apellidos": apellidos,
        "displayName": format!("{} {} {}", grado_academico, nombres, apellidos),
        "gradoAcademico": grado_academico,
        "tarifaHora": tarifa_hora,
        "telefono": telefono,
        "email": email,
        "activo": activo != 0,
        "fechaRegistro": fecha_registro
    }))
}

fn ci_exists(conn: &Connection, ci: &str, exclude_id: Option<&str>) -> rusqlite::Result<bool> {
    let found: Option<i64> = match exclude_id {
        Some(id) => conn
            .query_row(
                "SELECT 1 FROM docentes WHERE ci_numero = ? AND id != ?",
                (ci, id),
                |r| r.get(0),
            )
            .optional()?,
        None => conn
            .query_row("SELECT 1 FROM docentes WHERE ci_numero = ?", [ci], |r| {
                r.get(0)
            })
            .optional()?,
    };
    Ok(found.is_some())
}

fn handle_teachers_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let ci_numero = match required_str(req, "ciNumero") {
        Ok(v) => v,
        Err(e) => return e,
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
    let apellidos = match required_str(req, "apellidos") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grado = match required_str(req, "gradoAcademico") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !domain::is_grado_academico(&grado) {
        return err(
            &req.id,
            "bad_params",
            "gradoAcademico must be one of: LIC., ING., M.Sc., Mg., MBA, Ph.D., Dr.",
            Some(json!({ "gradoAcademico": grado })),
        );
    }
    let tarifa_hora = opt_f64(req, "tarifaHora").unwrap_or(0.0);
    if tarifa_hora < 0.0 {
        return err(&req.id, "bad_params", "tarifaHora must be >= 0", None);
    }

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

    let teacher_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO docentes(
            id, ci_numero, ci_expedicion, nombres, apellidos, grado_academico,
            tarifa_hora, telefono, email, activo, fecha_registro
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        rusqlite::params![
            &teacher_id,
            &ci_numero,
            ci_expedicion.as_str(),
            &nombres,
            &apellidos,
            &grado,
            tarifa_hora,
            opt_str(req, "telefono"),
            opt_str(req, "email"),
            now_timestamp(),
        ],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "docentes" })),
        );
    }

    ok(&req.id, json!({ "teacherId": teacher_id }))
}

fn handle_teachers_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM docentes WHERE id = ?", [&teacher_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "docente not found", None);
    }

    let mut sets: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    let str_field = |v: &serde_json::Value| -> Option<String> {
        v.as_str().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
    };

    if let Some(v) = patch.get("ciNumero") {
        let Some(ci) = str_field(v) else {
            return err(&req.id, "bad_params", "ciNumero must not be empty", None);
        };
        match ci_exists(conn, &ci, Some(&teacher_id)) {
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
    if let Some(v) = patch.get("gradoAcademico") {
        let Some(grado) = str_field(v).filter(|g| domain::is_grado_academico(g)) else {
            return err(&req.id, "bad_params", "gradoAcademico is not a valid grade", None);
        };
        sets.push("grado_academico = ?".into());
        binds.push(rusqlite::types::Value::Text(grado));
    }
    if let Some(v) = patch.get("tarifaHora") {
        let Some(tarifa) = v.as_f64().filter(|t| *t >= 0.0) else {
            return err(&req.id, "bad_params", "tarifaHora must be >= 0", None);
        };
        sets.push("tarifa_hora = ?".into());
        binds.push(rusqlite::types::Value::Real(tarifa));
    }
    for (key, column, required) in [
        ("nombres", "nombres", true),
        ("apellidos", "apellidos", true),
        ("telefono", "telefono", false),
        ("email", "email", false),
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

    let sql = format!("UPDATE docentes SET {} WHERE id = ?", sets.join(", "));
    binds.push(rusqlite::types::Value::Text(teacher_id.clone()));
    if let Err(e) = conn.execute(&sql, rusqlite::params_from_iter(binds)) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "docentes" })),
        );
    }

    ok(&req.id, json!({ "teacherId": teacher_id }))
}

fn handle_teachers_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let sql = format!("SELECT {} FROM docentes WHERE id = ?", TEACHER_COLUMNS);
    match conn
        .query_row(&sql, [&teacher_id], |row| teacher_json(row))
        .optional()
    {
        Ok(Some(teacher)) => ok(&req.id, json!({ "teacher": teacher })),
        Ok(None) => err(&req.id, "not_found", "docente not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_teachers_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (limit, offset) = limit_offset(req, 100);
    let active_only = opt_bool(req, "activeOnly").unwrap_or(false);

    let sql = format!(
        "SELECT {} FROM docentes {} ORDER BY apellidos, nombres LIMIT ? OFFSET ?",
        TEACHER_COLUMNS,
        if active_only { "WHERE activo = 1" } else { "" }
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([limit, offset], |row| teacher_json(row))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(teachers) => ok(&req.id, json!({ "teachers": teachers })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_teachers_search(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (limit, offset) = limit_offset(req, 100);

    let mut where_clauses: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(ci) = opt_str(req, "ci") {
        where_clauses.push("ci_numero LIKE ?".into());
        binds.push(rusqlite::types::Value::Text(format!("%{}%", ci)));
    }
    if let Some(nombre) = opt_str(req, "nombre") {
        where_clauses.push("(nombres LIKE ? OR apellidos LIKE ?)".into());
        binds.push(rusqlite::types::Value::Text(format!("%{}%", nombre)));
        binds.push(rusqlite::types::Value::Text(format!("%{}%", nombre)));
    }
    if let Some(grado) = opt_str(req, "gradoAcademico") {
        where_clauses.push("grado_academico = ?".into());
        binds.push(rusqlite::types::Value::Text(grado));
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
        "SELECT {} FROM docentes {} ORDER BY apellidos, nombres LIMIT ? OFFSET ?",
        TEACHER_COLUMNS, where_sql
    );
    binds.push(rusqlite::types::Value::Integer(limit));
    binds.push(rusqlite::types::Value::Integer(offset));

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |row| teacher_json(row))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(teachers) => {
            let count = teachers.len();
            ok(&req.id, json!({ "teachers": teachers, "count": count }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn set_teacher_active(state: &mut AppState, req: &Request, active: bool) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let changed = match conn.execute(
        "UPDATE docentes SET activo = ? WHERE id = ?",
        (active as i64, &teacher_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "docente not found", None);
    }
    ok(&req.id, json!({ "teacherId": teacher_id, "activo": active }))
}

fn handle_teachers_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let row: (i64, i64, f64, i64) = match conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN activo = 1 THEN 1 ELSE 0 END), 0),
                COALESCE(AVG(tarifa_hora), 0),
                COALESCE(SUM(CASE WHEN email IS NOT NULL THEN 1 ELSE 0 END), 0)
         FROM docentes",
        [],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let coordinando: i64 = match conn.query_row(
        "SELECT COUNT(DISTINCT docente_coordinador_id) FROM programas
         WHERE docente_coordinador_id IS NOT NULL
           AND estado NOT IN ('CANCELADO', 'CONCLUIDO')",
        [],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "total": row.0,
            "activos": row.1,
            "inactivos": row.0 - row.1,
            "tarifaPromedio": crate::finance::round_money(row.2),
            "conEmail": row.3,
            "coordinandoProgramas": coordinando
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.create" => Some(handle_teachers_create(state, req)),
        "teachers.update" => Some(handle_teachers_update(state, req)),
        "teachers.get" => Some(handle_teachers_get(state, req)),
        "teachers.list" => Some(handle_teachers_list(state, req)),
        "teachers.search" => Some(handle_teachers_search(state, req)),
        "teachers.deactivate" => Some(set_teacher_active(state, req, false)),
        "teachers.activate" => Some(set_teacher_active(state, req, true)),
        "teachers.stats" => Some(handle_teachers_stats(state, req)),
        _ => None,
    }
}
