use crate::domain::RolUsuario;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, now_timestamp, opt_bool, opt_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;
use uuid::Uuid;

const USER_COLUMNS: &str = "id, username, nombre_completo, email, rol, activo, fecha_registro";

fn user_json(row: &Row) -> rusqlite::Result<serde_json::Value> {
    // password_hash never leaves the storage layer.
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "username": row.get::<_, String>(1)?,
        "nombreCompleto": row.get::<_, String>(2)?,
        "email": row.get::<_, Option<String>>(3)?,
        "rol": row.get::<_, String>(4)?,
        "activo": row.get::<_, i64>(5)? != 0,
        "fechaRegistro": row.get::<_, String>(6)?,
    }))
}

fn username_exists(conn: &Connection, username: &str, exclude_id: Option<&str>) -> rusqlite::Result<bool> {
    let found: Option<i64> = match exclude_id {
        Some(id) => conn
            .query_row(
                "SELECT 1 FROM usuarios WHERE username = ? AND id != ?",
                (username, id),
                |r| r.get(0),
            )
            .optional()?,
        None => conn
            .query_row("SELECT 1 FROM usuarios WHERE username = ?", [username], |r| {
                r.get(0)
            })
            .optional()?,
    };
    Ok(found.is_some())
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let username = match required_str(req, "username") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let password_hash = match required_str(req, "passwordHash") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let nombre_completo = match required_str(req, "nombreCompleto") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let rol_raw = opt_str(req, "rol").unwrap_or_else(|| "CAJERO".to_string());
    let Some(rol) = RolUsuario::parse(&rol_raw) else {
        return err(
            &req.id,
            "bad_params",
            "rol must be one of: ADMINISTRADOR, COORDINADOR, CAJERO, CONSULTA",
            Some(json!({ "rol": rol_raw })),
        );
    };

    match username_exists(conn, &username, None) {
        Ok(true) => {
            return err(
                &req.id,
                "conflict",
                "el nombre de usuario ya está registrado",
                Some(json!({ "username": username })),
            )
        }
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let user_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO usuarios(id, username, password_hash, nombre_completo, email, rol, activo, fecha_registro)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?)",
        rusqlite::params![
            &user_id,
            &username,
            &password_hash,
            &nombre_completo,
            opt_str(req, "email"),
            rol.as_str(),
            now_timestamp(),
        ],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "usuarios" })),
        );
    }

    ok(
        &req.id,
        json!({ "userId": user_id, "username": username, "rol": rol.as_str() }),
    )
}

fn handle_users_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM usuarios WHERE id = ?", [&user_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "usuario not found", None);
    }

    let str_field = |v: &serde_json::Value| -> Option<String> {
        v.as_str().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
    };

    let mut sets: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();

    if let Some(v) = patch.get("username") {
        let Some(username) = str_field(v) else {
            return err(&req.id, "bad_params", "username must not be empty", None);
        };
        match username_exists(conn, &username, Some(&user_id)) {
            Ok(true) => {
                return err(
                    &req.id,
                    "conflict",
                    "el nombre de usuario ya está registrado",
                    Some(json!({ "username": username })),
                )
            }
            Ok(false) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
        sets.push("username = ?".into());
        binds.push(rusqlite::types::Value::Text(username));
    }
    if let Some(v) = patch.get("passwordHash") {
        let Some(hash) = str_field(v) else {
            return err(&req.id, "bad_params", "passwordHash must not be empty", None);
        };
        sets.push("password_hash = ?".into());
        binds.push(rusqlite::types::Value::Text(hash));
    }
    if let Some(v) = patch.get("nombreCompleto") {
        let Some(nombre) = str_field(v) else {
            return err(&req.id, "bad_params", "nombreCompleto must not be empty", None);
        };
        sets.push("nombre_completo = ?".into());
        binds.push(rusqlite::types::Value::Text(nombre));
    }
    if let Some(v) = patch.get("email") {
        match str_field(v) {
            Some(email) => {
                sets.push("email = ?".into());
                binds.push(rusqlite::types::Value::Text(email));
            }
            None => sets.push("email = NULL".into()),
        }
    }
    if patch.contains_key("rol") {
        return err(&req.id, "bad_params", "use users.changeRole to change rol", None);
    }
    if let Some(v) = patch.get("activo").and_then(|v| v.as_bool()) {
        sets.push("activo = ?".into());
        binds.push(rusqlite::types::Value::Integer(v as i64));
    }

    if sets.is_empty() {
        return err(&req.id, "bad_params", "patch contains no recognized fields", None);
    }

    let sql = format!("UPDATE usuarios SET {} WHERE id = ?", sets.join(", "));
    binds.push(rusqlite::types::Value::Text(user_id.clone()));
    if let Err(e) = conn.execute(&sql, rusqlite::params_from_iter(binds)) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "usuarios" })),
        );
    }

    ok(&req.id, json!({ "userId": user_id }))
}

fn handle_users_change_role(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let rol_raw = match required_str(req, "rol") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(rol) = RolUsuario::parse(&rol_raw) else {
        return err(
            &req.id,
            "bad_params",
            "rol must be one of: ADMINISTRADOR, COORDINADOR, CAJERO, CONSULTA",
            Some(json!({ "rol": rol_raw })),
        );
    };

    let changed = match conn.execute(
        "UPDATE usuarios SET rol = ? WHERE id = ?",
        (rol.as_str(), &user_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "usuario not found", None);
    }
    ok(&req.id, json!({ "userId": user_id, "rol": rol.as_str() }))
}

fn handle_users_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let (sql, key) = if let Some(id) = opt_str(req, "userId") {
        (format!("SELECT {} FROM usuarios WHERE id = ?", USER_COLUMNS), id)
    } else if let Some(username) = opt_str(req, "username") {
        (
            format!("SELECT {} FROM usuarios WHERE username = ?", USER_COLUMNS),
            username,
        )
    } else {
        return err(&req.id, "bad_params", "missing userId or username", None);
    };

    match conn.query_row(&sql, [&key], |row| user_json(row)).optional() {
        Ok(Some(user)) => ok(&req.id, json!({ "user": user })),
        Ok(None) => err(&req.id, "not_found", "usuario not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(rol) = opt_str(req, "rol") {
        if RolUsuario::parse(&rol).is_none() {
            return err(&req.id, "bad_params", "rol is not a valid role", None);
        }
        clauses.push("rol = ?".into());
        binds.push(rusqlite::types::Value::Text(rol));
    }
    if opt_bool(req, "activeOnly").unwrap_or(false) {
        clauses.push("activo = 1".into());
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT {} FROM usuarios {} ORDER BY username",
        USER_COLUMNS, where_sql
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |row| user_json(row))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(users) => ok(&req.id, json!({ "users": users })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn set_user_active(state: &mut AppState, req: &Request, active: bool) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let changed = match conn.execute(
        "UPDATE usuarios SET activo = ? WHERE id = ?",
        (active as i64, &user_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "usuario not found", None);
    }
    ok(&req.id, json!({ "userId": user_id, "activo": active }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.create" => Some(handle_users_create(state, req)),
        "users.update" => Some(handle_users_update(state, req)),
        "users.changeRole" => Some(handle_users_change_role(state, req)),
        "users.get" => Some(handle_users_get(state, req)),
        "users.list" => Some(handle_users_list(state, req)),
        "users.deactivate" => Some(set_user_active(state, req, false)),
        "users.activate" => Some(set_user_active(state, req, true)),
        _ => None,
    }
}
