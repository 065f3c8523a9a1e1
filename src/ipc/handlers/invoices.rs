use crate::db;
use crate::finance;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_date, opt_f64, opt_str, required_str, today_string};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;
use uuid::Uuid;

fn next_numero_factura(conn: &Connection, year: i32) -> rusqlite::Result<String> {
    let prefix = format!("F-{}-%", year);
    let max: Option<String> = conn
        .query_row(
            "SELECT MAX(numero_factura) FROM facturas WHERE numero_factura LIKE ?",
            [&prefix],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    let next = max
        .as_deref()
        .and_then(|n| finance::parse_numero_seq(n, 'F', year))
        .unwrap_or(0)
        + 1;
    Ok(finance::format_numero('F', year, next))
}

fn invoice_json(row: &Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "transactionId": row.get::<_, String>(1)?,
        "numeroFactura": row.get::<_, String>(2)?,
        "nit": row.get::<_, Option<String>>(3)?,
        "razonSocial": row.get::<_, String>(4)?,
        "subtotal": row.get::<_, f64>(5)?,
        "iva": row.get::<_, f64>(6)?,
        "it": row.get::<_, f64>(7)?,
        "total": row.get::<_, f64>(8)?,
        "fechaEmision": row.get::<_, String>(9)?,
    }))
}

const INVOICE_COLUMNS: &str =
    "id, transaccion_id, numero_factura, nit, razon_social, subtotal, iva, it, total, fecha_emision";

fn handle_invoices_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let transaccion_id = match required_str(req, "transactionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let razon_social = match required_str(req, "razonSocial") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let transaccion: Option<(String, f64)> = match tx
        .query_row(
            "SELECT estado, monto_final FROM transacciones WHERE id = ?",
            [&transaccion_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((estado, monto_final)) = transaccion else {
        return err(&req.id, "not_found", "transacción not found", None);
    };
    if estado != "CONFIRMADO" {
        return err(
            &req.id,
            "invalid_state",
            "solo se facturan transacciones confirmadas",
            Some(json!({ "estado": estado })),
        );
    }

    let existing: Option<String> = match tx
        .query_row(
            "SELECT numero_factura FROM facturas WHERE transaccion_id = ?",
            [&transaccion_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(numero) = existing {
        return err(
            &req.id,
            "conflict",
            "la transacción ya tiene factura",
            Some(json!({ "numeroFactura": numero })),
        );
    }

    let subtotal = finance::round_money(opt_f64(req, "subtotal").unwrap_or(monto_final));
    if subtotal < 0.0 {
        return err(&req.id, "bad_params", "subtotal must be >= 0", None);
    }
    let iva_pct = db::config_f64(&tx, "factura_iva_porcentaje", 13.0);
    let it_pct = db::config_f64(&tx, "factura_it_porcentaje", 3.0);
    let iva = finance::round_money(subtotal * iva_pct / 100.0);
    let it = finance::round_money(subtotal * it_pct / 100.0);
    let total = finance::round_money(subtotal + iva + it);

    let fecha_emision = match opt_date(req, "fechaEmision") {
        Ok(v) => v
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(today_string),
        Err(e) => return e,
    };
    let year: i32 = fecha_emision[..4].parse().unwrap_or(finance::today_year());
    let numero_factura = match next_numero_factura(&tx, year) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let invoice_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO facturas(
            id, transaccion_id, numero_factura, nit, razon_social,
            subtotal, iva, it, total, fecha_emision
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &invoice_id,
            &transaccion_id,
            &numero_factura,
            opt_str(req, "nit"),
            &razon_social,
            subtotal,
            iva,
            it,
            total,
            &fecha_emision,
        ],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "facturas" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "invoiceId": invoice_id,
            "numeroFactura": numero_factura,
            "subtotal": subtotal,
            "iva": iva,
            "it": it,
            "total": total,
            "fechaEmision": fecha_emision
        }),
    )
}

fn handle_invoices_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let (sql, key) = if let Some(id) = opt_str(req, "invoiceId") {
        (
            format!("SELECT {} FROM facturas WHERE id = ?", INVOICE_COLUMNS),
            id,
        )
    } else if let Some(tid) = opt_str(req, "transactionId") {
        (
            format!(
                "SELECT {} FROM facturas WHERE transaccion_id = ?",
                INVOICE_COLUMNS
            ),
            tid,
        )
    } else if let Some(numero) = opt_str(req, "numero") {
        (
            format!(
                "SELECT {} FROM facturas WHERE numero_factura = ?",
                INVOICE_COLUMNS
            ),
            numero,
        )
    } else {
        return err(
            &req.id,
            "bad_params",
            "missing invoiceId, transactionId or numero",
            None,
        );
    };

    match conn.query_row(&sql, [&key], |row| invoice_json(row)).optional() {
        Ok(Some(invoice)) => ok(&req.id, json!({ "invoice": invoice })),
        Ok(None) => err(&req.id, "not_found", "factura not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_invoices_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    match opt_date(req, "desde") {
        Ok(Some(d)) => {
            clauses.push("fecha_emision >= ?".into());
            binds.push(rusqlite::types::Value::Text(d.format("%Y-%m-%d").to_string()));
        }
        Ok(None) => {}
        Err(e) => return e,
    }
    match opt_date(req, "hasta") {
        Ok(Some(d)) => {
            clauses.push("fecha_emision <= ?".into());
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
    let sql = format!(
        "SELECT {} FROM facturas {} ORDER BY numero_factura DESC",
        INVOICE_COLUMNS, where_sql
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |row| invoice_json(row))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(invoices) => ok(&req.id, json!({ "invoices": invoices })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "invoices.create" => Some(handle_invoices_create(state, req)),
        "invoices.get" => Some(handle_invoices_get(state, req)),
        "invoices.list" => Some(handle_invoices_list(state, req)),
        _ => None,
    }
}
