use crate::domain;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, now_timestamp, opt_i64, opt_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

const MAX_DOCUMENT_BYTES: i64 = 10 * 1024 * 1024;

fn handle_documents_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let transaccion_id = match required_str(req, "transactionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let tipo_documento = match required_str(req, "tipoDocumento") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let nombre_original = match required_str(req, "nombreOriginal") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let nombre_archivo = match required_str(req, "nombreArchivo") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let extension = match required_str(req, "extension") {
        Ok(v) => v.trim_start_matches('.').to_ascii_lowercase(),
        Err(e) => return e,
    };
    let ruta_archivo = match required_str(req, "rutaArchivo") {
        Ok(v) => v,
        Err(e) => return e,
    };

    if !domain::is_extension_documento(&extension) {
        return err(
            &req.id,
            "bad_params",
            "tipo de archivo no permitido",
            Some(json!({ "extension": extension })),
        );
    }
    let tamano_bytes = opt_i64(req, "tamanoBytes");
    if let Some(bytes) = tamano_bytes {
        if bytes < 0 {
            return err(&req.id, "bad_params", "tamanoBytes must be >= 0", None);
        }
        if bytes > MAX_DOCUMENT_BYTES {
            return err(
                &req.id,
                "bad_params",
                "el archivo es demasiado grande (máximo 10MB)",
                Some(json!({ "tamanoBytes": bytes, "maximo": MAX_DOCUMENT_BYTES })),
            );
        }
    }

    let transaction_exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM transacciones WHERE id = ?",
            [&transaccion_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if transaction_exists.is_none() {
        return err(&req.id, "not_found", "transacción not found", None);
    }
    if let Some(ref user_id) = opt_str(req, "subidoPor") {
        let found: Option<i64> = match conn
            .query_row("SELECT 1 FROM usuarios WHERE id = ?", [user_id], |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if found.is_none() {
            return err(&req.id, "not_found", "usuario subidoPor not found", None);
        }
    }

    let document_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO documentos_respaldo(
            id, transaccion_id, tipo_documento, nombre_original, nombre_archivo,
            extension, ruta_archivo, tamano_bytes, observaciones, subido_por, fecha_subida
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &document_id,
            &transaccion_id,
            &tipo_documento,
            &nombre_original,
            &nombre_archivo,
            &extension,
            &ruta_archivo,
            tamano_bytes,
            opt_str(req, "observaciones"),
            opt_str(req, "subidoPor"),
            now_timestamp(),
        ],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "documentos_respaldo" })),
        );
    }

    ok(
        &req.id,
        json!({ "documentId": document_id, "transactionId": transaccion_id }),
    )
}

fn handle_documents_list_by_transaction(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let transaccion_id = match required_str(req, "transactionId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, tipo_documento, nombre_original, nombre_archivo, extension,
                ruta_archivo, tamano_bytes, observaciones, subido_por, fecha_subida
         FROM documentos_respaldo
         WHERE transaccion_id = ?
         ORDER BY fecha_subida",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&transaccion_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "tipoDocumento": row.get::<_, String>(1)?,
                "nombreOriginal": row.get::<_, String>(2)?,
                "nombreArchivo": row.get::<_, String>(3)?,
                "extension": row.get::<_, String>(4)?,
                "rutaArchivo": row.get::<_, String>(5)?,
                "tamanoBytes": row.get::<_, Option<i64>>(6)?,
                "observaciones": row.get::<_, Option<String>>(7)?,
                "subidoPor": row.get::<_, Option<String>>(8)?,
                "fechaSubida": row.get::<_, String>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(documents) => ok(&req.id, json!({ "documents": documents })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "documents.register" => Some(handle_documents_register(state, req)),
        "documents.listByTransaction" => Some(handle_documents_list_by_transaction(state, req)),
        _ => None,
    }
}
