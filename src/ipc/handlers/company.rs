use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_company_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn
        .query_row(
            "SELECT id, nombre, nit, direccion, telefono, email, logo_url FROM empresa LIMIT 1",
            [],
            |row| {
                Ok(json!({
                    "id": row.get::<_, String>(0)?,
                    "nombre": row.get::<_, String>(1)?,
                    "nit": row.get::<_, String>(2)?,
                    "direccion": row.get::<_, Option<String>>(3)?,
                    "telefono": row.get::<_, Option<String>>(4)?,
                    "email": row.get::<_, Option<String>>(5)?,
                    "logoUrl": row.get::<_, Option<String>>(6)?,
                }))
            },
        )
        .optional()
    {
        Ok(Some(company)) => ok(&req.id, json!({ "company": company })),
        Ok(None) => err(&req.id, "not_found", "empresa no registrada", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Inserts the single empresa row or updates it in place; the table never
/// holds more than one row.
fn handle_company_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let nombre = match required_str(req, "nombre") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let nit = match required_str(req, "nit") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let existing: Option<String> = match conn
        .query_row("SELECT id FROM empresa LIMIT 1", [], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    match existing {
        Some(company_id) => {
            if let Err(e) = conn.execute(
                "UPDATE empresa SET nombre = ?, nit = ?, direccion = ?, telefono = ?, email = ?, logo_url = ?
                 WHERE id = ?",
                rusqlite::params![
                    &nombre,
                    &nit,
                    opt_str(req, "direccion"),
                    opt_str(req, "telefono"),
                    opt_str(req, "email"),
                    opt_str(req, "logoUrl"),
                    &company_id,
                ],
            ) {
                return err(
                    &req.id,
                    "db_update_failed",
                    e.to_string(),
                    Some(json!({ "table": "empresa" })),
                );
            }
            ok(&req.id, json!({ "companyId": company_id, "created": false }))
        }
        None => {
            let company_id = Uuid::new_v4().to_string();
            if let Err(e) = conn.execute(
                "INSERT INTO empresa(id, nombre, nit, direccion, telefono, email, logo_url)
                 VALUES(?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    &company_id,
                    &nombre,
                    &nit,
                    opt_str(req, "direccion"),
                    opt_str(req, "telefono"),
                    opt_str(req, "email"),
                    opt_str(req, "logoUrl"),
                ],
            ) {
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "empresa" })),
                );
            }
            ok(&req.id, json!({ "companyId": company_id, "created": true }))
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "company.get" => Some(handle_company_get(state, req)),
        "company.save" => Some(handle_company_save(state, req)),
        _ => None,
    }
}
