use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_bool, opt_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_config_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let clave = match required_str(req, "clave") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn
        .query_row(
            "SELECT clave, valor, descripcion, tipo, categoria, editable
             FROM configuraciones WHERE clave = ?",
            [&clave],
            |row| {
                Ok(json!({
                    "clave": row.get::<_, String>(0)?,
                    "valor": row.get::<_, String>(1)?,
                    "descripcion": row.get::<_, Option<String>>(2)?,
                    "tipo": row.get::<_, String>(3)?,
                    "categoria": row.get::<_, String>(4)?,
                    "editable": row.get::<_, i64>(5)? != 0,
                }))
            },
        )
        .optional()
    {
        Ok(Some(config)) => ok(&req.id, json!({ "config": config })),
        Ok(None) => err(&req.id, "not_found", "configuración not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_config_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let clave = match required_str(req, "clave") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let valor = match required_str(req, "valor") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let existing: Option<(String, i64)> = match conn
        .query_row(
            "SELECT id, editable FROM configuraciones WHERE clave = ?",
            [&clave],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    match existing {
        Some((_, 0)) => err(
            &req.id,
            "invalid_state",
            "la configuración no es editable",
            Some(json!({ "clave": clave })),
        ),
        Some((config_id, _)) => {
            let mut sets = vec!["valor = ?".to_string()];
            let mut binds = vec![rusqlite::types::Value::Text(valor.clone())];
            if let Some(descripcion) = opt_str(req, "descripcion") {
                sets.push("descripcion = ?".into());
                binds.push(rusqlite::types::Value::Text(descripcion));
            }
            if let Some(tipo) = opt_str(req, "tipo") {
                sets.push("tipo = ?".into());
                binds.push(rusqlite::types::Value::Text(tipo));
            }
            if let Some(categoria) = opt_str(req, "categoria") {
                sets.push("categoria = ?".into());
                binds.push(rusqlite::types::Value::Text(categoria));
            }
            if let Some(editable) = opt_bool(req, "editable") {
                sets.push("editable = ?".into());
                binds.push(rusqlite::types::Value::Integer(editable as i64));
            }
            let sql = format!("UPDATE configuraciones SET {} WHERE id = ?", sets.join(", "));
            binds.push(rusqlite::types::Value::Text(config_id));
            if let Err(e) = conn.execute(&sql, rusqlite::params_from_iter(binds)) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
            ok(&req.id, json!({ "clave": clave, "valor": valor, "created": false }))
        }
        None => {
            if let Err(e) = conn.execute(
                "INSERT INTO configuraciones(id, clave, valor, descripcion, tipo, categoria, editable)
                 VALUES(?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    &clave,
                    &valor,
                    opt_str(req, "descripcion"),
                    opt_str(req, "tipo").unwrap_or_else(|| "TEXTO".to_string()),
                    opt_str(req, "categoria").unwrap_or_else(|| "GENERAL".to_string()),
                    opt_bool(req, "editable").unwrap_or(true) as i64,
                ],
            ) {
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "configuraciones" })),
                );
            }
            ok(&req.id, json!({ "clave": clave, "valor": valor, "created": true }))
        }
    }
}

fn handle_config_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let categoria = opt_str(req, "categoria");
    let sql = match categoria {
        Some(_) => {
            "SELECT clave, valor, descripcion, tipo, categoria, editable
             FROM configuraciones WHERE categoria = ? ORDER BY clave"
        }
        None => {
            "SELECT clave, valor, descripcion, tipo, categoria, editable
             FROM configuraciones ORDER BY categoria, clave"
        }
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let map_row = |row: &rusqlite::Row| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "clave": row.get::<_, String>(0)?,
            "valor": row.get::<_, String>(1)?,
            "descripcion": row.get::<_, Option<String>>(2)?,
            "tipo": row.get::<_, String>(3)?,
            "categoria": row.get::<_, String>(4)?,
            "editable": row.get::<_, i64>(5)? != 0,
        }))
    };
    let rows = match categoria {
        Some(cat) => stmt
            .query_map([&cat], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    };

    match rows {
        Ok(configs) => ok(&req.id, json!({ "configs": configs })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_config_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let clave = match required_str(req, "clave") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let editable: Option<i64> = match conn
        .query_row(
            "SELECT editable FROM configuraciones WHERE clave = ?",
            [&clave],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match editable {
        None => return err(&req.id, "not_found", "configuración not found", None),
        Some(0) => {
            return err(
                &req.id,
                "invalid_state",
                "la configuración no es editable",
                Some(json!({ "clave": clave })),
            )
        }
        Some(_) => {}
    }

    if let Err(e) = conn.execute("DELETE FROM configuraciones WHERE clave = ?", [&clave]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "clave": clave, "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "config.get" => Some(handle_config_get(state, req)),
        "config.set" => Some(handle_config_set(state, req)),
        "config.list" => Some(handle_config_list(state, req)),
        "config.delete" => Some(handle_config_delete(state, req)),
        _ => None,
    }
}
