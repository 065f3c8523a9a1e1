use crate::domain::EstadoPrograma;
use crate::finance;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, limit_offset, opt_str, required_str, today_string};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;
use uuid::Uuid;

const PROGRAM_COLUMNS: &str = "id, codigo, nombre, descripcion, duracion_meses, horas_totales,
    costo_total, costo_matricula, costo_inscripcion, costo_mensualidad, numero_cuotas,
    cupos_maximos, cupos_inscritos, estado, fecha_inicio, fecha_fin,
    docente_coordinador_id, promocion_descuento, promocion_descripcion, promocion_valido_hasta";

fn program_json(row: &Row) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let codigo: String = row.get(1)?;
    let nombre: String = row.get(2)?;
    let descripcion: Option<String> = row.get(3)?;
    let duracion_meses: i64 = row.get(4)?;
    let horas_totales: i64 = row.get(5)?;
    let costo_total: f64 = row.get(6)?;
    let costo_matricula: f64 = row.get(7)?;
    let costo_inscripcion: f64 = row.get(8)?;
    let costo_mensualidad: f64 = row.get(9)?;
    let numero_cuotas: i64 = row.get(10)?;
    let cupos_maximos: Option<i64> = row.get(11)?;
    let cupos_inscritos: i64 = row.get(12)?;
    let estado: String = row.get(13)?;
    let fecha_inicio: Option<String> = row.get(14)?;
    let fecha_fin: Option<String> = row.get(15)?;
    let coordinador: Option<String> = row.get(16)?;
    let promocion_descuento: f64 = row.get(17)?;
    let promocion_descripcion: Option<String> = row.get(18)?;
    let promocion_valido_hasta: Option<String> = row.get(19)?;

    let cupos_disponibles = cupos_maximos.map(|max| (max - cupos_inscritos).max(0));
    Ok(json!({
        "id": id,
        "codigo": codigo,
        "nombre": nombre,
        "descripcion": descripcion,
        "duracionMeses": duracion_meses,
        "horasTotales": horas_totales,
        "costoTotal": costo_total,
        "costoMatricula": costo_matricula,
        "costoInscripcion": costo_inscripcion,
        "costoMensualidad": costo_mensualidad,
        "numeroCuotas": numero_cuotas,
        "cuposMaximos": cupos_maximos,
        "cuposInscritos": cupos_inscritos,
        "cuposDisponibles": cupos_disponibles,
        "estado": estado,
        "fechaInicio": fecha_inicio,
        "fechaFin": fecha_fin,
        "docenteCoordinadorId": coordinador,
        "promocionDescuento": promocion_descuento,
        "promocionDescripcion": promocion_descripcion,
        "promocionValidoHasta": promocion_valido_hasta
    }))
}

fn codigo_exists(conn: &Connection, codigo: &str, exclude_id: Option<&str>) -> rusqlite::Result<bool> {
    let found: Option<i64> = match exclude_id {
        Some(id) => conn
            .query_row(
                "SELECT 1 FROM programas WHERE codigo = ? AND id != ?",
                (codigo, id),
                |r| r.get(0),
            )
            .optional()?,
        None => conn
            .query_row("SELECT 1 FROM programas WHERE codigo = ?", [codigo], |r| {
                r.get(0)
            })
            .optional()?,
    };
    Ok(found.is_some())
}

/// Candidate row assembled from create params or from an existing row merged
/// with an update patch. Validated as a whole before any write.
struct ProgramCandidate {
    codigo: String,
    nombre: String,
    descripcion: Option<String>,
    duracion_meses: i64,
    horas_totales: i64,
    costo_total: f64,
    costo_matricula: f64,
    costo_inscripcion: f64,
    costo_mensualidad: f64,
    numero_cuotas: i64,
    cupos_maximos: Option<i64>,
    cupos_inscritos: i64,
    estado: String,
    fecha_inicio: Option<String>,
    fecha_fin: Option<String>,
    docente_coordinador_id: Option<String>,
    promocion_descuento: f64,
    promocion_descripcion: Option<String>,
    promocion_valido_hasta: Option<String>,
}

fn validate_candidate(
    conn: &Connection,
    req: &Request,
    c: &mut ProgramCandidate,
) -> Result<(), serde_json::Value> {
    if c.duracion_meses <= 0 {
        return Err(err(&req.id, "bad_params", "duracionMeses must be > 0", None));
    }
    if c.horas_totales <= 0 {
        return Err(err(&req.id, "bad_params", "horasTotales must be > 0", None));
    }
    if c.numero_cuotas <= 0 {
        return Err(err(&req.id, "bad_params", "numeroCuotas must be > 0", None));
    }
    for (name, v) in [
        ("costoTotal", c.costo_total),
        ("costoMatricula", c.costo_matricula),
        ("costoInscripcion", c.costo_inscripcion),
        ("costoMensualidad", c.costo_mensualidad),
    ] {
        if v < 0.0 {
            return Err(err(
                &req.id,
                "bad_params",
                format!("{} must be >= 0", name),
                None,
            ));
        }
    }
    if !(0.0..=100.0).contains(&c.promocion_descuento) {
        return Err(err(
            &req.id,
            "bad_params",
            "promocionDescuento must be between 0 and 100",
            None,
        ));
    }
    if c.cupos_inscritos < 0 {
        return Err(err(&req.id, "bad_params", "cuposInscritos must be >= 0", None));
    }
    if let Some(max) = c.cupos_maximos {
        if max <= 0 {
            return Err(err(&req.id, "bad_params", "cuposMaximos must be > 0", None));
        }
        if c.cupos_inscritos > max {
            return Err(err(
                &req.id,
                "bad_params",
                "cuposInscritos must not exceed cuposMaximos",
                Some(json!({ "cuposInscritos": c.cupos_inscritos, "cuposMaximos": max })),
            ));
        }
    }
    if EstadoPrograma::parse(&c.estado).is_none() {
        return Err(err(
            &req.id,
            "bad_params",
            "estado must be one of: PLANIFICADO, INSCRIPCIONES, EN_CURSO, CONCLUIDO, CANCELADO",
            Some(json!({ "estado": c.estado })),
        ));
    }

    let inicio = match c.fecha_inicio.as_deref() {
        Some(s) => Some(finance::parse_date(s).ok_or_else(|| {
            err(&req.id, "bad_params", "fechaInicio must be a YYYY-MM-DD date", None)
        })?),
        None => None,
    };
    let fin = match c.fecha_fin.as_deref() {
        Some(s) => Some(finance::parse_date(s).ok_or_else(|| {
            err(&req.id, "bad_params", "fechaFin must be a YYYY-MM-DD date", None)
        })?),
        None => None,
    };
    match (inicio, fin) {
        (Some(i), Some(f)) => {
            if f < i {
                return Err(err(
                    &req.id,
                    "bad_params",
                    "fechaFin must not precede fechaInicio",
                    None,
                ));
            }
        }
        (Some(i), None) => {
            // Derived end date: start plus the program duration in months.
            c.fecha_fin = Some(
                finance::add_months(i, c.duracion_meses)
                    .format("%Y-%m-%d")
                    .to_string(),
            );
        }
        _ => {}
    }

    if let Some(valido) = c.promocion_valido_hasta.as_deref() {
        if finance::parse_date(valido).is_none() {
            return Err(err(
                &req.id,
                "bad_params",
                "promocionValidoHasta must be a YYYY-MM-DD date",
                None,
            ));
        }
    }

    if let Some(coordinador_id) = c.docente_coordinador_id.as_deref() {
        let activo: Option<i64> = conn
            .query_row(
                "SELECT activo FROM docentes WHERE id = ?",
                [coordinador_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
        match activo {
            None => {
                return Err(err(
                    &req.id,
                    "not_found",
                    "docente coordinador not found",
                    Some(json!({ "docenteCoordinadorId": coordinador_id })),
                ))
            }
            Some(0) => {
                return Err(err(
                    &req.id,
                    "invalid_state",
                    "docente coordinador is inactive",
                    Some(json!({ "docenteCoordinadorId": coordinador_id })),
                ))
            }
            Some(_) => {}
        }
    }

    Ok(())
}

fn handle_programs_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let codigo = match required_str(req, "codigo") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let nombre = match required_str(req, "nombre") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let duracion_meses = match req.params.get("duracionMeses").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing duracionMeses", None),
    };
    let horas_totales = match req.params.get("horasTotales").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing horasTotales", None),
    };

    let mut candidate = ProgramCandidate {
        codigo: codigo.clone(),
        nombre,
        descripcion: opt_str(req, "descripcion"),
        duracion_meses,
        horas_totales,
        costo_total: req.params.get("costoTotal").and_then(|v| v.as_f64()).unwrap_or(0.0),
        costo_matricula: req
            .params
            .get("costoMatricula")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0),
        costo_inscripcion: req
            .params
            .get("costoInscripcion")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0),
        costo_mensualidad: req
            .params
            .get("costoMensualidad")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0),
        numero_cuotas: req.params.get("numeroCuotas").and_then(|v| v.as_i64()).unwrap_or(1),
        cupos_maximos: req.params.get("cuposMaximos").and_then(|v| v.as_i64()),
        cupos_inscritos: req
            .params
            .get("cuposInscritos")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        estado: opt_str(req, "estado").unwrap_or_else(|| "PLANIFICADO".to_string()),
        fecha_inicio: opt_str(req, "fechaInicio"),
        fecha_fin: opt_str(req, "fechaFin"),
        docente_coordinador_id: opt_str(req, "docenteCoordinadorId"),
        promocion_descuento: req
            .params
            .get("promocionDescuento")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0),
        promocion_descripcion: opt_str(req, "promocionDescripcion"),
        promocion_valido_hasta: opt_str(req, "promocionValidoHasta"),
    };

    match codigo_exists(conn, &codigo, None) {
        Ok(true) => {
            return err(
                &req.id,
                "conflict",
                "El código de programa ya está registrado",
                Some(json!({ "codigo": codigo })),
            )
        }
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if let Err(e) = validate_candidate(conn, req, &mut candidate) {
        return e;
    }

    let program_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO programas(
            id, codigo, nombre, descripcion, duracion_meses, horas_totales,
            costo_total, costo_matricula, costo_inscripcion, costo_mensualidad,
            numero_cuotas, cupos_maximos, cupos_inscritos, estado,
            fecha_inicio, fecha_fin, docente_coordinador_id,
            promocion_descuento, promocion_descripcion, promocion_valido_hasta
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &program_id,
            &candidate.codigo,
            &candidate.nombre,
            &candidate.descripcion,
            candidate.duracion_meses,
            candidate.horas_totales,
            candidate.costo_total,
            candidate.costo_matricula,
            candidate.costo_inscripcion,
            candidate.costo_mensualidad,
            candidate.numero_cuotas,
            candidate.cupos_maximos,
            candidate.cupos_inscritos,
            &candidate.estado,
            &candidate.fecha_inicio,
            &candidate.fecha_fin,
            &candidate.docente_coordinador_id,
            candidate.promocion_descuento,
            &candidate.promocion_descripcion,
            &candidate.promocion_valido_hasta,
        ],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "programas" })),
        );
    }

    ok(
        &req.id,
        json!({
            "programId": program_id,
            "codigo": candidate.codigo,
            "fechaFin": candidate.fecha_fin
        }),
    )
}

fn load_candidate(conn: &Connection, program_id: &str) -> rusqlite::Result<Option<ProgramCandidate>> {
    let sql = format!("SELECT {} FROM programas WHERE id = ?", PROGRAM_COLUMNS);
    conn.query_row(&sql, [program_id], |row| {
        Ok(ProgramCandidate {
            codigo: row.get(1)?,
            nombre: row.get(2)?,
            descripcion: row.get(3)?,
            duracion_meses: row.get(4)?,
            horas_totales: row.get(5)?,
            costo_total: row.get(6)?,
            costo_matricula: row.get(7)?,
            costo_inscripcion: row.get(8)?,
            costo_mensualidad: row.get(9)?,
            numero_cuotas: row.get(10)?,
            cupos_maximos: row.get(11)?,
            cupos_inscritos: row.get(12)?,
            estado: row.get(13)?,
            fecha_inicio: row.get(14)?,
            fecha_fin: row.get(15)?,
            docente_coordinador_id: row.get(16)?,
            promocion_descuento: row.get(17)?,
            promocion_descripcion: row.get(18)?,
            promocion_valido_hasta: row.get(19)?,
        })
    })
    .optional()
}

fn handle_programs_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let program_id = match required_str(req, "programId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let mut candidate = match load_candidate(conn, &program_id) {
        Ok(Some(c)) => c,
        Ok(None) => return err(&req.id, "not_found", "programa not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Estado changes go through programs.setState, which owns the
    // transition rules; the generic patch rejects them.
    if patch.contains_key("estado") {
        return err(
            &req.id,
            "bad_params",
            "use programs.setState to change estado",
            None,
        );
    }
    // Slots move through enrollments, not direct edits.
    if patch.contains_key("cuposInscritos") {
        return err(
            &req.id,
            "bad_params",
            "cuposInscritos is maintained by enrollment operations",
            None,
        );
    }

    let str_field = |v: &serde_json::Value| -> Option<String> {
        v.as_str().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
    };

    if let Some(v) = patch.get("codigo") {
        let Some(codigo) = str_field(v) else {
            return err(&req.id, "bad_params", "codigo must not be empty", None);
        };
        match codigo_exists(conn, &codigo, Some(&program_id)) {
            Ok(true) => {
                return err(
                    &req.id,
                    "conflict",
                    "El código de programa ya está registrado",
                    Some(json!({ "codigo": codigo })),
                )
            }
            Ok(false) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
        candidate.codigo = codigo;
    }
    if let Some(v) = patch.get("nombre") {
        let Some(nombre) = str_field(v) else {
            return err(&req.id, "bad_params", "nombre must not be empty", None);
        };
        candidate.nombre = nombre;
    }
    if let Some(v) = patch.get("descripcion") {
        candidate.descripcion = str_field(v);
    }
    if let Some(v) = patch.get("duracionMeses") {
        candidate.duracion_meses = v.as_i64().unwrap_or(0);
    }
    if let Some(v) = patch.get("horasTotales") {
        candidate.horas_totales = v.as_i64().unwrap_or(0);
    }
    if let Some(v) = patch.get("numeroCuotas") {
        candidate.numero_cuotas = v.as_i64().unwrap_or(0);
    }
    if let Some(v) = patch.get("costoTotal") {
        candidate.costo_total = v.as_f64().unwrap_or(-1.0);
    }
    if let Some(v) = patch.get("costoMatricula") {
        candidate.costo_matricula = v.as_f64().unwrap_or(-1.0);
    }
    if let Some(v) = patch.get("costoInscripcion") {
        candidate.costo_inscripcion = v.as_f64().unwrap_or(-1.0);
    }
    if let Some(v) = patch.get("costoMensualidad") {
        candidate.costo_mensualidad = v.as_f64().unwrap_or(-1.0);
    }
    if let Some(v) = patch.get("cuposMaximos") {
        candidate.cupos_maximos = if v.is_null() { None } else { v.as_i64() };
    }
    if let Some(v) = patch.get("fechaInicio") {
        candidate.fecha_inicio = str_field(v);
        if patch.get("fechaFin").is_none() {
            // Re-derive the end date against the new start.
            candidate.fecha_fin = None;
        }
    }
    if let Some(v) = patch.get("fechaFin") {
        candidate.fecha_fin = str_field(v);
    }
    if let Some(v) = patch.get("docenteCoordinadorId") {
        candidate.docente_coordinador_id = str_field(v);
    }
    if let Some(v) = patch.get("promocionDescuento") {
        candidate.promocion_descuento = v.as_f64().unwrap_or(-1.0);
    }
    if let Some(v) = patch.get("promocionDescripcion") {
        candidate.promocion_descripcion = str_field(v);
    }
    if let Some(v) = patch.get("promocionValidoHasta") {
        candidate.promocion_valido_hasta = str_field(v);
    }

    if let Err(e) = validate_candidate(conn, req, &mut candidate) {
        return e;
    }

    if let Err(e) = conn.execute(
        "UPDATE programas SET
            codigo = ?, nombre = ?, descripcion = ?, duracion_meses = ?, horas_totales = ?,
            costo_total = ?, costo_matricula = ?, costo_inscripcion = ?, costo_mensualidad = ?,
            numero_cuotas = ?, cupos_maximos = ?, fecha_inicio = ?, fecha_fin = ?,
            docente_coordinador_id = ?, promocion_descuento = ?, promocion_descripcion = ?,
            promocion_valido_hasta = ?
         WHERE id = ?",
        rusqlite::params![
            &candidate.codigo,
            &candidate.nombre,
            &candidate.descripcion,
            candidate.duracion_meses,
            candidate.horas_totales,
            candidate.costo_total,
            candidate.costo_matricula,
            candidate.costo_inscripcion,
            candidate.costo_mensualidad,
            candidate.numero_cuotas,
            candidate.cupos_maximos,
            &candidate.fecha_inicio,
            &candidate.fecha_fin,
            &candidate.docente_coordinador_id,
            candidate.promocion_descuento,
            &candidate.promocion_descripcion,
            &candidate.promocion_valido_hasta,
            &program_id,
        ],
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "programas" })),
        );
    }

    ok(
        &req.id,
        json!({ "programId": program_id, "fechaFin": candidate.fecha_fin }),
    )
}

fn handle_programs_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let program_id = match required_str(req, "programId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let sql = format!("SELECT {} FROM programas WHERE id = ?", PROGRAM_COLUMNS);
    match conn
        .query_row(&sql, [&program_id], |row| program_json(row))
        .optional()
    {
        Ok(Some(program)) => ok(&req.id, json!({ "program": program })),
        Ok(None) => err(&req.id, "not_found", "programa not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_programs_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (limit, offset) = limit_offset(req, 100);

    let mut where_clauses: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(estado) = opt_str(req, "estado") {
        if EstadoPrograma::parse(&estado).is_none() {
            return err(&req.id, "bad_params", "estado is not a valid program state", None);
        }
        where_clauses.push("estado = ?".into());
        binds.push(rusqlite::types::Value::Text(estado));
    }
    if let Some(codigo) = opt_str(req, "codigo") {
        where_clauses.push("codigo LIKE ?".into());
        binds.push(rusqlite::types::Value::Text(format!("%{}%", codigo)));
    }
    if let Some(nombre) = opt_str(req, "nombre") {
        where_clauses.push("nombre LIKE ?".into());
        binds.push(rusqlite::types::Value::Text(format!("%{}%", nombre)));
    }
    if let Some(coordinador) = opt_str(req, "docenteCoordinadorId") {
        where_clauses.push("docente_coordinador_id = ?".into());
        binds.push(rusqlite::types::Value::Text(coordinador));
    }

    let where_sql = if where_clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", where_clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT {} FROM programas {} ORDER BY codigo LIMIT ? OFFSET ?",
        PROGRAM_COLUMNS, where_sql
    );
    binds.push(rusqlite::types::Value::Integer(limit));
    binds.push(rusqlite::types::Value::Integer(offset));

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |row| program_json(row))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(programs) => ok(&req.id, json!({ "programs": programs })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn apply_state_change(
    conn: &Connection,
    req: &Request,
    program_id: &str,
    target: EstadoPrograma,
) -> serde_json::Value {
    let row: Option<(String, i64)> = match conn
        .query_row(
            "SELECT estado, cupos_inscritos FROM programas WHERE id = ?",
            [program_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((estado_actual_raw, cupos_inscritos)) = row else {
        return err(&req.id, "not_found", "programa not found", None);
    };
    let Some(estado_actual) = EstadoPrograma::parse(&estado_actual_raw) else {
        return err(
            &req.id,
            "server_error",
            format!("stored estado is invalid: {}", estado_actual_raw),
            None,
        );
    };

    if estado_actual == target {
        return err(
            &req.id,
            "invalid_state",
            format!("programa already in estado {}", target.as_str()),
            None,
        );
    }

    let allowed = match target {
        EstadoPrograma::Cancelado => {
            if estado_actual.is_terminal() {
                false
            } else if cupos_inscritos != 0 {
                return err(
                    &req.id,
                    "invalid_state",
                    "programa with enrolled students cannot be cancelled",
                    Some(json!({ "cuposInscritos": cupos_inscritos })),
                );
            } else {
                true
            }
        }
        _ => estado_actual.can_advance_to(target),
    };
    if !allowed {
        return err(
            &req.id,
            "invalid_state",
            format!(
                "transition {} -> {} is not allowed",
                estado_actual.as_str(),
                target.as_str()
            ),
            None,
        );
    }

    if let Err(e) = conn.execute(
        "UPDATE programas SET estado = ? WHERE id = ?",
        (target.as_str(), program_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "programId": program_id,
            "estadoAnterior": estado_actual.as_str(),
            "estadoNuevo": target.as_str()
        }),
    )
}

fn handle_programs_set_state(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let program_id = match required_str(req, "programId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let estado_raw = match required_str(req, "estado") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(target) = EstadoPrograma::parse(&estado_raw) else {
        return err(
            &req.id,
            "bad_params",
            "estado must be one of: PLANIFICADO, INSCRIPCIONES, EN_CURSO, CONCLUIDO, CANCELADO",
            Some(json!({ "estado": estado_raw })),
        );
    };
    if target == EstadoPrograma::Planificado {
        return err(
            &req.id,
            "bad_params",
            "use programs.activate to return a programa to PLANIFICADO",
            None,
        );
    }
    apply_state_change(conn, req, &program_id, target)
}

fn handle_programs_cancel(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let program_id = match required_str(req, "programId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    apply_state_change(conn, req, &program_id, EstadoPrograma::Cancelado)
}

fn handle_programs_activate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let program_id = match required_str(req, "programId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let estado: Option<String> = match conn
        .query_row("SELECT estado FROM programas WHERE id = ?", [&program_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(estado) = estado else {
        return err(&req.id, "not_found", "programa not found", None);
    };
    if estado == "PLANIFICADO" {
        return err(&req.id, "invalid_state", "programa already PLANIFICADO", None);
    }

    if let Err(e) = conn.execute(
        "UPDATE programas SET estado = 'PLANIFICADO' WHERE id = ?",
        [&program_id],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({
            "programId": program_id,
            "estadoAnterior": estado,
            "estadoNuevo": "PLANIFICADO"
        }),
    )
}

/// Sweeps every non-terminal program whose end date has passed into
/// CONCLUIDO. CANCELADO rows stay cancelled; that was a manual decision.
fn handle_programs_auto_conclude(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let hoy = today_string();

    let mut stmt = match conn.prepare(
        "SELECT id, codigo, nombre, fecha_fin FROM programas
         WHERE estado NOT IN ('CONCLUIDO', 'CANCELADO')
           AND fecha_fin IS NOT NULL
           AND fecha_fin <= ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let due: Result<Vec<(String, String, String, String)>, _> = stmt
        .query_map([&hoy], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect());
    let due = match due {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut concluded = Vec::with_capacity(due.len());
    for (id, codigo, nombre, fecha_fin) in due {
        if let Err(e) = conn.execute("UPDATE programas SET estado = 'CONCLUIDO' WHERE id = ?", [&id])
        {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        concluded.push(json!({
            "programId": id,
            "codigo": codigo,
            "nombre": nombre,
            "fechaFin": fecha_fin
        }));
    }

    ok(
        &req.id,
        json!({
            "fechaVerificacion": hoy,
            "actualizados": concluded.len(),
            "programas": concluded
        }),
    )
}

fn handle_programs_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let row: (i64, i64, i64, i64, i64, i64, f64, f64) = match conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN estado = 'PLANIFICADO' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN estado = 'INSCRIPCIONES' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN estado = 'EN_CURSO' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN estado = 'CONCLUIDO' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN estado = 'CANCELADO' THEN 1 ELSE 0 END), 0),
                COALESCE(AVG(duracion_meses), 0),
                COALESCE(AVG(costo_total), 0)
         FROM programas",
        [],
        |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
                r.get(7)?,
            ))
        },
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let cupos: (i64, i64) = match conn.query_row(
        "SELECT COALESCE(SUM(cupos_maximos), 0), COALESCE(SUM(cupos_inscritos), 0)
         FROM programas
         WHERE cupos_maximos IS NOT NULL AND estado NOT IN ('CANCELADO', 'CONCLUIDO')",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "totalProgramas": row.0,
            "planificados": row.1,
            "enInscripciones": row.2,
            "enCurso": row.3,
            "concluidos": row.4,
            "cancelados": row.5,
            "promedioDuracionMeses": finance::round_money(row.6),
            "promedioCosto": finance::round_money(row.7),
            "cuposTotales": cupos.0,
            "cuposOcupados": cupos.1,
            "cuposDisponibles": (cupos.0 - cupos.1).max(0)
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "programs.create" => Some(handle_programs_create(state, req)),
        "programs.update" => Some(handle_programs_update(state, req)),
        "programs.get" => Some(handle_programs_get(state, req)),
        "programs.list" | "programs.search" => Some(handle_programs_list(state, req)),
        "programs.setState" => Some(handle_programs_set_state(state, req)),
        "programs.cancel" => Some(handle_programs_cancel(state, req)),
        "programs.activate" => Some(handle_programs_activate(state, req)),
        "programs.autoConclude" => Some(handle_programs_auto_conclude(state, req)),
        "programs.stats" => Some(handle_programs_stats(state, req)),
        _ => None,
    }
}
