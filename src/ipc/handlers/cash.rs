use crate::domain::{FormaPago, TipoMovimiento};
use crate::finance;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_date, opt_str, today_string};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_cash_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    match opt_date(req, "desde") {
        Ok(Some(d)) => {
            clauses.push("m.fecha >= ?".into());
            binds.push(rusqlite::types::Value::Text(d.format("%Y-%m-%d").to_string()));
        }
        Ok(None) => {}
        Err(e) => return e,
    }
    match opt_date(req, "hasta") {
        Ok(Some(d)) => {
            clauses.push("m.fecha <= ?".into());
            binds.push(rusqlite::types::Value::Text(d.format("%Y-%m-%d").to_string()));
        }
        Ok(None) => {}
        Err(e) => return e,
    }
    if let Some(tipo) = opt_str(req, "tipo") {
        if TipoMovimiento::parse(&tipo).is_none() {
            return err(&req.id, "bad_params", "tipo must be INGRESO or EGRESO", None);
        }
        clauses.push("m.tipo = ?".into());
        binds.push(rusqlite::types::Value::Text(tipo));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT m.id, m.transaccion_id, m.tipo, m.monto, m.forma_pago, m.descripcion, m.fecha,
                t.numero_transaccion
         FROM movimientos_caja m
         LEFT JOIN transacciones t ON t.id = m.transaccion_id
         {}
         ORDER BY m.fecha DESC, m.id",
        where_sql
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "transactionId": row.get::<_, Option<String>>(1)?,
                "tipo": row.get::<_, String>(2)?,
                "monto": row.get::<_, f64>(3)?,
                "formaPago": row.get::<_, String>(4)?,
                "descripcion": row.get::<_, String>(5)?,
                "fecha": row.get::<_, String>(6)?,
                "numeroTransaccion": row.get::<_, Option<String>>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(movimientos) => ok(&req.id, json!({ "movimientos": movimientos })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn summarize_range(
    conn: &rusqlite::Connection,
    req: &Request,
    desde: &str,
    hasta: &str,
) -> Result<serde_json::Value, serde_json::Value> {
    let totals: (f64, f64, i64) = conn
        .query_row(
            "SELECT
               COALESCE(SUM(CASE WHEN tipo = 'INGRESO' THEN monto ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN tipo = 'EGRESO' THEN monto ELSE 0 END), 0),
               COUNT(*)
             FROM movimientos_caja
             WHERE fecha >= ? AND fecha <= ?",
            (desde, hasta),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;

    let mut por_forma_pago = serde_json::Map::new();
    for forma in FormaPago::ALL {
        let row: (i64, f64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(monto), 0)
                 FROM movimientos_caja
                 WHERE fecha >= ? AND fecha <= ? AND forma_pago = ? AND tipo = 'INGRESO'",
                (desde, hasta, forma.as_str()),
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
        por_forma_pago.insert(
            forma.as_str().to_string(),
            json!({ "cantidad": row.0, "monto": finance::round_money(row.1) }),
        );
    }

    Ok(json!({
        "ingresos": finance::round_money(totals.0),
        "egresos": finance::round_money(totals.1),
        "saldo": finance::round_money(totals.0 - totals.1),
        "movimientos": totals.2,
        "porFormaPago": por_forma_pago
    }))
}

fn handle_cash_daily_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let fecha = match opt_date(req, "fecha") {
        Ok(v) => v
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(today_string),
        Err(e) => return e,
    };

    match summarize_range(conn, req, &fecha, &fecha) {
        Ok(mut summary) => {
            summary["fecha"] = json!(fecha);
            ok(&req.id, summary)
        }
        Err(e) => e,
    }
}

fn handle_cash_monthly_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = match req.params.get("year").and_then(|v| v.as_i64()) {
        Some(v) if (2000..=2100).contains(&v) => v,
        _ => return err(&req.id, "bad_params", "missing or invalid year", None),
    };
    let month = match req.params.get("month").and_then(|v| v.as_i64()) {
        Some(v) if (1..=12).contains(&v) => v,
        _ => return err(&req.id, "bad_params", "missing or invalid month", None),
    };

    // Inclusive day range of the calendar month.
    let desde = format!("{:04}-{:02}-01", year, month);
    let hasta = format!("{:04}-{:02}-31", year, month);

    match summarize_range(conn, req, &desde, &hasta) {
        Ok(mut summary) => {
            summary["year"] = json!(year);
            summary["month"] = json!(month);
            ok(&req.id, summary)
        }
        Err(e) => e,
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "cash.list" => Some(handle_cash_list(state, req)),
        "cash.dailySummary" => Some(handle_cash_daily_summary(state, req)),
        "cash.monthlySummary" => Some(handle_cash_monthly_summary(state, req)),
        _ => None,
    }
}
