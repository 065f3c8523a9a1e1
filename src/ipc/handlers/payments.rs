use crate::domain::{EstadoTransaccion, FormaPago, TipoMovimiento};
use crate::finance;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, limit_offset, now_timestamp, opt_bool, opt_date, opt_f64, opt_str, required_f64,
    required_str,
};
use crate::ipc::types::{AppState, Request};
use chrono::Datelike;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

// Two monto figures that should match may each carry rounding noise.
const MONTO_EPSILON: f64 = 0.01;

/// Next `T-YYYY-NNNNNN` under the year of the payment date. Runs inside the
/// caller's transaction so max+1 is race-free; the UNIQUE column backstops it.
fn next_numero_transaccion(conn: &Connection, year: i32) -> rusqlite::Result<String> {
    let prefix = format!("T-{}-%", year);
    let max: Option<String> = conn
        .query_row(
            "SELECT MAX(numero_transaccion) FROM transacciones WHERE numero_transaccion LIKE ?",
            [&prefix],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    let next = max
        .as_deref()
        .and_then(|n| finance::parse_numero_seq(n, 'T', year))
        .unwrap_or(0)
        + 1;
    Ok(finance::format_numero('T', year, next))
}

fn concepto_by_codigo(conn: &Connection, codigo: &str) -> rusqlite::Result<Option<(String, String)>> {
    conn.query_row(
        "SELECT id, nombre FROM conceptos_pago WHERE codigo = ? AND activo = 1",
        [codigo],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .optional()
}

/// Cash-ledger posting for a transaction that reached CONFIRMADO. At most one
/// movement per transaction (UNIQUE transaccion_id).
fn post_cash_movement(
    conn: &Connection,
    transaccion_id: &str,
    monto_final: f64,
    forma_pago: &str,
    descripcion: &str,
    fecha: &str,
) -> rusqlite::Result<()> {
    let tipo = if monto_final < 0.0 {
        TipoMovimiento::Egreso
    } else {
        TipoMovimiento::Ingreso
    };
    conn.execute(
        "INSERT INTO movimientos_caja(id, transaccion_id, tipo, monto, forma_pago, descripcion, fecha)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            transaccion_id,
            tipo.as_str(),
            monto_final.abs(),
            forma_pago,
            descripcion,
            fecha,
        ],
    )?;
    Ok(())
}

fn handle_payments_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let enrollment_id = match required_str(req, "enrollmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let monto_pagado = match required_f64(req, "montoPagado") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let forma_pago_raw = match required_str(req, "formaPago") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(forma_pago) = FormaPago::parse(&forma_pago_raw) else {
        return err(
            &req.id,
            "bad_params",
            "formaPago must be one of: EFECTIVO, TRANSFERENCIA, TARJETA, DEPOSITO, QR",
            Some(json!({ "formaPago": forma_pago_raw })),
        );
    };
    let numero_comprobante = opt_str(req, "numeroComprobante");
    if forma_pago.requires_comprobante() && numero_comprobante.is_none() {
        return err(
            &req.id,
            "bad_params",
            format!(
                "numeroComprobante is required for {}",
                forma_pago.as_str()
            ),
            None,
        );
    }
    let fecha_pago = match opt_date(req, "fechaPago") {
        Ok(v) => v.unwrap_or_else(finance::today),
        Err(e) => return e,
    };
    let descuento = finance::round_money(opt_f64(req, "descuento").unwrap_or(0.0));
    if descuento < 0.0 {
        return err(&req.id, "bad_params", "descuento must be >= 0", None);
    }
    let confirmar = opt_bool(req, "confirmar").unwrap_or(true);
    let registrado_por = opt_str(req, "registradoPor");

    if let Some(ref user_id) = registrado_por {
        let found: Option<i64> = match conn
            .query_row("SELECT 1 FROM usuarios WHERE id = ?", [user_id], |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if found.is_none() {
            return err(&req.id, "not_found", "usuario registradoPor not found", None);
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let enrollment: Option<(String, String, String)> = match tx
        .query_row(
            "SELECT estudiante_id, programa_id, estado FROM inscripciones WHERE id = ?",
            [&enrollment_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((estudiante_id, programa_id, estado_inscripcion)) = enrollment else {
        return err(&req.id, "not_found", "inscripción not found", None);
    };
    if estado_inscripcion == "RETIRADO" {
        return err(
            &req.id,
            "invalid_state",
            "inscripción retirada no acepta pagos",
            None,
        );
    }

    let program: Option<(String, f64, f64)> = match tx
        .query_row(
            "SELECT nombre, costo_matricula, costo_inscripcion FROM programas WHERE id = ?",
            [&programa_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((programa_nombre, costo_matricula, costo_inscripcion)) = program else {
        return err(&req.id, "not_found", "programa not found", None);
    };

    let monto_total = finance::round_money(costo_matricula + costo_inscripcion);
    if descuento > monto_total + MONTO_EPSILON {
        return err(
            &req.id,
            "bad_params",
            "descuento must not exceed the amount due",
            Some(json!({ "descuento": descuento, "montoTotal": monto_total })),
        );
    }
    let monto_final = finance::round_money(monto_total - descuento);
    if monto_pagado + MONTO_EPSILON < monto_final {
        return err(
            &req.id,
            "insufficient_amount",
            "monto pagado insuficiente",
            Some(json!({ "montoPagado": monto_pagado, "montoRequerido": monto_final })),
        );
    }

    let estado = if confirmar {
        EstadoTransaccion::Confirmado
    } else {
        EstadoTransaccion::Registrado
    };
    let fecha_pago_str = fecha_pago.format("%Y-%m-%d").to_string();
    let numero = match next_numero_transaccion(&tx, fecha_pago.year()) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let transaccion_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO transacciones(
            id, numero_transaccion, estudiante_id, programa_id, fecha_pago,
            monto_total, descuento_total, monto_final, forma_pago, estado,
            numero_comprobante, banco_origen, cuenta_origen, observaciones,
            registrado_por, fecha_registro
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &transaccion_id,
            &numero,
            &estudiante_id,
            &programa_id,
            &fecha_pago_str,
            monto_total,
            descuento,
            monto_final,
            forma_pago.as_str(),
            estado.as_str(),
            numero_comprobante,
            opt_str(req, "bancoOrigen"),
            opt_str(req, "cuentaOrigen"),
            opt_str(req, "observaciones"),
            registrado_por,
            now_timestamp(),
        ],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "transacciones" })),
        );
    }

    // Detail lines: matricula, inscripcion, then the discount as a negative
    // line so the detail subtotals sum to monto_final.
    let mut lineas: Vec<(&str, String, f64)> = Vec::new();
    if costo_matricula > 0.0 {
        lineas.push((
            "MATRICULA",
            format!("Matrícula - {}", programa_nombre),
            costo_matricula,
        ));
    }
    if costo_inscripcion > 0.0 {
        lineas.push((
            "INSCRIPCION",
            format!("Inscripción - {}", programa_nombre),
            costo_inscripcion,
        ));
    }
    if descuento > 0.0 {
        lineas.push((
            "DESCUENTO",
            format!("Descuento - {}", programa_nombre),
            -descuento,
        ));
    }

    for (orden, (codigo, descripcion, precio)) in lineas.iter().enumerate() {
        let concepto = match concepto_by_codigo(&tx, codigo) {
            Ok(Some(c)) => c,
            Ok(None) => {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "not_found",
                    format!("concepto de pago {} not found", codigo),
                    None,
                );
            }
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        };
        if let Err(e) = tx.execute(
            "INSERT INTO detalles_transaccion(
                id, transaccion_id, concepto_pago_id, descripcion, cantidad,
                precio_unitario, subtotal, orden
             ) VALUES(?, ?, ?, ?, 1, ?, ?, ?)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                &transaccion_id,
                concepto.0,
                descripcion,
                precio,
                precio,
                orden as i64,
            ],
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "detalles_transaccion" })),
            );
        }
    }

    // A paid enrollment moves out of PREINSCRITO.
    if estado_inscripcion == "PREINSCRITO" {
        if let Err(e) = tx.execute(
            "UPDATE inscripciones SET estado = 'INSCRITO' WHERE id = ?",
            [&enrollment_id],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    if estado == EstadoTransaccion::Confirmado {
        if let Err(e) = post_cash_movement(
            &tx,
            &transaccion_id,
            monto_final,
            forma_pago.as_str(),
            &format!("Pago inscripción {} - {}", numero, programa_nombre),
            &fecha_pago_str,
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "movimientos_caja" })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "transactionId": transaccion_id,
            "numeroTransaccion": numero,
            "enrollmentId": enrollment_id,
            "montoTotal": monto_total,
            "descuentoTotal": descuento,
            "montoFinal": monto_final,
            "cambio": finance::round_money(monto_pagado - monto_final),
            "estado": estado.as_str(),
            "estadoInscripcion": if estado_inscripcion == "PREINSCRITO" {
                "INSCRITO"
            } else {
                estado_inscripcion.as_str()
            }
        }),
    )
}

fn handle_transactions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let estudiante_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let monto_total = finance::round_money(match required_f64(req, "montoTotal") {
        Ok(v) => v,
        Err(e) => return e,
    });
    let forma_pago_raw = match required_str(req, "formaPago") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(forma_pago) = FormaPago::parse(&forma_pago_raw) else {
        return err(
            &req.id,
            "bad_params",
            "formaPago must be one of: EFECTIVO, TRANSFERENCIA, TARJETA, DEPOSITO, QR",
            Some(json!({ "formaPago": forma_pago_raw })),
        );
    };
    let descuento_total = finance::round_money(opt_f64(req, "descuentoTotal").unwrap_or(0.0));
    if monto_total < 0.0 || descuento_total < 0.0 {
        return err(&req.id, "bad_params", "los montos no pueden ser negativos", None);
    }
    if descuento_total > monto_total + MONTO_EPSILON {
        return err(
            &req.id,
            "bad_params",
            "el descuento no puede ser mayor al monto total",
            None,
        );
    }
    let monto_final = finance::round_money(monto_total - descuento_total);
    if let Some(declared) = opt_f64(req, "montoFinal") {
        if (declared - monto_final).abs() > MONTO_EPSILON {
            return err(
                &req.id,
                "bad_params",
                "el monto final debe ser igual a monto total menos descuento",
                Some(json!({ "montoFinal": declared, "esperado": monto_final })),
            );
        }
    }
    let numero_comprobante = opt_str(req, "numeroComprobante");
    if forma_pago.requires_comprobante() && numero_comprobante.is_none() {
        return err(
            &req.id,
            "bad_params",
            format!("numeroComprobante is required for {}", forma_pago.as_str()),
            None,
        );
    }
    let estado_raw = opt_str(req, "estado").unwrap_or_else(|| "REGISTRADO".to_string());
    let Some(estado) = EstadoTransaccion::parse(&estado_raw) else {
        return err(
            &req.id,
            "bad_params",
            "estado must be one of: REGISTRADO, CONFIRMADO, ANULADO",
            Some(json!({ "estado": estado_raw })),
        );
    };
    if estado == EstadoTransaccion::Anulado {
        return err(&req.id, "bad_params", "cannot create a transaction as ANULADO", None);
    }
    let fecha_pago = match opt_date(req, "fechaPago") {
        Ok(v) => v.unwrap_or_else(finance::today),
        Err(e) => return e,
    };

    let student: Option<i64> = match conn
        .query_row("SELECT 1 FROM estudiantes WHERE id = ?", [&estudiante_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if student.is_none() {
        return err(&req.id, "not_found", "estudiante not found", None);
    }
    let programa_id = opt_str(req, "programId");
    if let Some(ref pid) = programa_id {
        let found: Option<i64> = match conn
            .query_row("SELECT 1 FROM programas WHERE id = ?", [pid], |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if found.is_none() {
            return err(&req.id, "not_found", "programa not found", None);
        }
    }

    // Detail lines come in explicitly; each subtotal must match cantidad ×
    // precio before anything is written.
    let detalles_in = req
        .params
        .get("detalles")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    if detalles_in.is_empty() {
        return err(&req.id, "bad_params", "detalles must contain at least one line", None);
    }
    struct Linea {
        concepto_codigo: String,
        descripcion: String,
        cantidad: f64,
        precio_unitario: f64,
        subtotal: f64,
    }
    let mut lineas = Vec::with_capacity(detalles_in.len());
    for (i, d) in detalles_in.iter().enumerate() {
        let concepto_codigo = d
            .get("concepto")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_ascii_uppercase())
            .unwrap_or_default();
        if concepto_codigo.is_empty() {
            return err(
                &req.id,
                "bad_params",
                format!("detalles[{}] missing concepto", i),
                None,
            );
        }
        let cantidad = d.get("cantidad").and_then(|v| v.as_f64()).unwrap_or(1.0);
        if cantidad <= 0.0 {
            return err(
                &req.id,
                "bad_params",
                format!("detalles[{}] cantidad must be > 0", i),
                None,
            );
        }
        let Some(precio_unitario) = d.get("precioUnitario").and_then(|v| v.as_f64()) else {
            return err(
                &req.id,
                "bad_params",
                format!("detalles[{}] missing precioUnitario", i),
                None,
            );
        };
        let subtotal = finance::round_money(cantidad * precio_unitario);
        if let Some(declared) = d.get("subtotal").and_then(|v| v.as_f64()) {
            if (declared - subtotal).abs() > MONTO_EPSILON {
                return err(
                    &req.id,
                    "bad_params",
                    format!("detalles[{}] subtotal must equal cantidad * precioUnitario", i),
                    Some(json!({ "subtotal": declared, "esperado": subtotal })),
                );
            }
        }
        let descripcion = d
            .get("descripcion")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| concepto_codigo.clone());
        lineas.push(Linea {
            concepto_codigo,
            descripcion,
            cantidad,
            precio_unitario,
            subtotal,
        });
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let fecha_pago_str = fecha_pago.format("%Y-%m-%d").to_string();
    let numero = match next_numero_transaccion(&tx, fecha_pago.year()) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let transaccion_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO transacciones(
            id, numero_transaccion, estudiante_id, programa_id, fecha_pago,
            monto_total, descuento_total, monto_final, forma_pago, estado,
            numero_comprobante, banco_origen, cuenta_origen, observaciones,
            registrado_por, fecha_registro
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &transaccion_id,
            &numero,
            &estudiante_id,
            &programa_id,
            &fecha_pago_str,
            monto_total,
            descuento_total,
            monto_final,
            forma_pago.as_str(),
            estado.as_str(),
            numero_comprobante,
            opt_str(req, "bancoOrigen"),
            opt_str(req, "cuentaOrigen"),
            opt_str(req, "observaciones"),
            opt_str(req, "registradoPor"),
            now_timestamp(),
        ],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "transacciones" })),
        );
    }

    for (orden, linea) in lineas.iter().enumerate() {
        let concepto = match concepto_by_codigo(&tx, &linea.concepto_codigo) {
            Ok(Some(c)) => c,
            Ok(None) => {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "not_found",
                    format!("concepto de pago {} not found", linea.concepto_codigo),
                    None,
                );
            }
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        };
        if let Err(e) = tx.execute(
            "INSERT INTO detalles_transaccion(
                id, transaccion_id, concepto_pago_id, descripcion, cantidad,
                precio_unitario, subtotal, orden
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                &transaccion_id,
                concepto.0,
                &linea.descripcion,
                linea.cantidad,
                linea.precio_unitario,
                linea.subtotal,
                orden as i64,
            ],
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "detalles_transaccion" })),
            );
        }
    }

    if estado == EstadoTransaccion::Confirmado {
        if let Err(e) = post_cash_movement(
            &tx,
            &transaccion_id,
            monto_final,
            forma_pago.as_str(),
            &format!("Pago {} confirmado", numero),
            &fecha_pago_str,
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "movimientos_caja" })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "transactionId": transaccion_id,
            "numeroTransaccion": numero,
            "montoTotal": monto_total,
            "descuentoTotal": descuento_total,
            "montoFinal": monto_final,
            "estado": estado.as_str()
        }),
    )
}

fn transaction_json(conn: &Connection, transaccion_id: &str) -> rusqlite::Result<Option<serde_json::Value>> {
    let head = conn
        .query_row(
            "SELECT
               t.id, t.numero_transaccion, t.estudiante_id, t.programa_id, t.fecha_pago,
               t.monto_total, t.descuento_total, t.monto_final, t.forma_pago, t.estado,
               t.numero_comprobante, t.banco_origen, t.cuenta_origen, t.observaciones,
               t.registrado_por, t.fecha_registro,
               e.nombres || ' ' || e.apellido_paterno || COALESCE(' ' || e.apellido_materno, ''),
               e.ci_numero || '-' || e.ci_expedicion,
               p.nombre, p.codigo,
               u.nombre_completo
             FROM transacciones t
             JOIN estudiantes e ON e.id = t.estudiante_id
             LEFT JOIN programas p ON p.id = t.programa_id
             LEFT JOIN usuarios u ON u.id = t.registrado_por
             WHERE t.id = ?",
            [transaccion_id],
            |row| {
                Ok(json!({
                    "id": row.get::<_, String>(0)?,
                    "numeroTransaccion": row.get::<_, String>(1)?,
                    "studentId": row.get::<_, String>(2)?,
                    "programId": row.get::<_, Option<String>>(3)?,
                    "fechaPago": row.get::<_, String>(4)?,
                    "montoTotal": row.get::<_, f64>(5)?,
                    "descuentoTotal": row.get::<_, f64>(6)?,
                    "montoFinal": row.get::<_, f64>(7)?,
                    "formaPago": row.get::<_, String>(8)?,
                    "estado": row.get::<_, String>(9)?,
                    "numeroComprobante": row.get::<_, Option<String>>(10)?,
                    "bancoOrigen": row.get::<_, Option<String>>(11)?,
                    "cuentaOrigen": row.get::<_, Option<String>>(12)?,
                    "observaciones": row.get::<_, Option<String>>(13)?,
                    "registradoPor": row.get::<_, Option<String>>(14)?,
                    "fechaRegistro": row.get::<_, String>(15)?,
                    "estudiante": row.get::<_, String>(16)?,
                    "estudianteCi": row.get::<_, String>(17)?,
                    "programaNombre": row.get::<_, Option<String>>(18)?,
                    "programaCodigo": row.get::<_, Option<String>>(19)?,
                    "registradoPorNombre": row.get::<_, Option<String>>(20)?,
                }))
            },
        )
        .optional()?;
    let Some(mut head) = head else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT d.id, c.codigo, d.descripcion, d.cantidad, d.precio_unitario, d.subtotal, d.orden
         FROM detalles_transaccion d
         JOIN conceptos_pago c ON c.id = d.concepto_pago_id
         WHERE d.transaccion_id = ?
         ORDER BY d.orden",
    )?;
    let detalles = stmt
        .query_map([transaccion_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "concepto": row.get::<_, String>(1)?,
                "descripcion": row.get::<_, String>(2)?,
                "cantidad": row.get::<_, f64>(3)?,
                "precioUnitario": row.get::<_, f64>(4)?,
                "subtotal": row.get::<_, f64>(5)?,
                "orden": row.get::<_, i64>(6)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    head["detalles"] = json!(detalles);
    Ok(Some(head))
}

fn handle_transactions_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let transaccion_id = match opt_str(req, "transactionId") {
        Some(id) => id,
        None => {
            // Lookup by business number is the cashier-facing path.
            let Some(numero) = opt_str(req, "numero") else {
                return err(&req.id, "bad_params", "missing transactionId or numero", None);
            };
            match conn
                .query_row(
                    "SELECT id FROM transacciones WHERE numero_transaccion = ?",
                    [&numero],
                    |r| r.get::<_, String>(0),
                )
                .optional()
            {
                Ok(Some(id)) => id,
                Ok(None) => return err(&req.id, "not_found", "transacción not found", None),
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        }
    };

    match transaction_json(conn, &transaccion_id) {
        Ok(Some(t)) => ok(&req.id, json!({ "transaction": t })),
        Ok(None) => err(&req.id, "not_found", "transacción not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_transactions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (limit, offset) = limit_offset(req, 100);

    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(v) = opt_str(req, "studentId") {
        clauses.push("t.estudiante_id = ?".into());
        binds.push(rusqlite::types::Value::Text(v));
    }
    if let Some(v) = opt_str(req, "programId") {
        clauses.push("t.programa_id = ?".into());
        binds.push(rusqlite::types::Value::Text(v));
    }
    if let Some(v) = opt_str(req, "estado") {
        if EstadoTransaccion::parse(&v).is_none() {
            return err(&req.id, "bad_params", "estado is not a valid transaction state", None);
        }
        clauses.push("t.estado = ?".into());
        binds.push(rusqlite::types::Value::Text(v));
    }
    if let Some(v) = opt_str(req, "formaPago") {
        if FormaPago::parse(&v).is_none() {
            return err(&req.id, "bad_params", "formaPago is not a valid payment method", None);
        }
        clauses.push("t.forma_pago = ?".into());
        binds.push(rusqlite::types::Value::Text(v));
    }
    match opt_date(req, "desde") {
        Ok(Some(d)) => {
            clauses.push("t.fecha_pago >= ?".into());
            binds.push(rusqlite::types::Value::Text(d.format("%Y-%m-%d").to_string()));
        }
        Ok(None) => {}
        Err(e) => return e,
    }
    match opt_date(req, "hasta") {
        Ok(Some(d)) => {
            clauses.push("t.fecha_pago <= ?".into());
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

    let count_sql = format!("SELECT COUNT(*) FROM transacciones t {}", where_sql);
    let total: i64 = match conn.query_row(
        &count_sql,
        rusqlite::params_from_iter(binds.clone()),
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let sql = format!(
        "SELECT
           t.id, t.numero_transaccion, t.fecha_pago, t.monto_total, t.descuento_total,
           t.monto_final, t.forma_pago, t.estado, t.numero_comprobante,
           e.nombres || ' ' || e.apellido_paterno || COALESCE(' ' || e.apellido_materno, ''),
           e.ci_numero || '-' || e.ci_expedicion,
           p.nombre, p.codigo
         FROM transacciones t
         JOIN estudiantes e ON e.id = t.estudiante_id
         LEFT JOIN programas p ON p.id = t.programa_id
         {}
         ORDER BY t.fecha_pago DESC, t.numero_transaccion DESC
         LIMIT ? OFFSET ?",
        where_sql
    );
    binds.push(rusqlite::types::Value::Integer(limit));
    binds.push(rusqlite::types::Value::Integer(offset));

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "numeroTransaccion": row.get::<_, String>(1)?,
                "fechaPago": row.get::<_, String>(2)?,
                "montoTotal": row.get::<_, f64>(3)?,
                "descuentoTotal": row.get::<_, f64>(4)?,
                "montoFinal": row.get::<_, f64>(5)?,
                "formaPago": row.get::<_, String>(6)?,
                "estado": row.get::<_, String>(7)?,
                "numeroComprobante": row.get::<_, Option<String>>(8)?,
                "estudiante": row.get::<_, String>(9)?,
                "estudianteCi": row.get::<_, String>(10)?,
                "programaNombre": row.get::<_, Option<String>>(11)?,
                "programaCodigo": row.get::<_, Option<String>>(12)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(transactions) => ok(
            &req.id,
            json!({
                "transactions": transactions,
                "total": total,
                "limit": limit,
                "offset": offset
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_transactions_confirm(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let transaccion_id = match required_str(req, "transactionId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let row: Option<(String, String, f64, String, String)> = match tx
        .query_row(
            "SELECT estado, numero_transaccion, monto_final, forma_pago, fecha_pago
             FROM transacciones WHERE id = ?",
            [&transaccion_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                ))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((estado, numero, monto_final, forma_pago, fecha_pago)) = row else {
        return err(&req.id, "not_found", "transacción not found", None);
    };
    match estado.as_str() {
        "ANULADO" => {
            return err(
                &req.id,
                "invalid_state",
                "no se puede confirmar una transacción anulada",
                None,
            )
        }
        "CONFIRMADO" => {
            return err(
                &req.id,
                "invalid_state",
                "la transacción ya está confirmada",
                None,
            )
        }
        _ => {}
    }

    if let Err(e) = tx.execute(
        "UPDATE transacciones SET estado = 'CONFIRMADO' WHERE id = ?",
        [&transaccion_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = post_cash_movement(
        &tx,
        &transaccion_id,
        monto_final,
        &forma_pago,
        &format!("Pago {} confirmado", numero),
        &fecha_pago,
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "movimientos_caja" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "transactionId": transaccion_id,
            "numeroTransaccion": numero,
            "estado": "CONFIRMADO"
        }),
    )
}

fn handle_transactions_annul(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let transaccion_id = match required_str(req, "transactionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let motivo = match required_str(req, "motivo") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let estado: Option<String> = match conn
        .query_row(
            "SELECT estado FROM transacciones WHERE id = ?",
            [&transaccion_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(estado) = estado else {
        return err(&req.id, "not_found", "transacción not found", None);
    };
    match estado.as_str() {
        "ANULADO" => {
            return err(&req.id, "invalid_state", "la transacción ya está anulada", None)
        }
        "CONFIRMADO" => {
            return err(
                &req.id,
                "invalid_state",
                "no se puede anular una transacción confirmada",
                None,
            )
        }
        _ => {}
    }

    let anotacion = format!("ANULADO: {}", motivo);
    if let Err(e) = conn.execute(
        "UPDATE transacciones
         SET estado = 'ANULADO',
             observaciones = CASE
               WHEN observaciones IS NULL OR observaciones = '' THEN ?
               ELSE observaciones || char(10) || ?
             END
         WHERE id = ?",
        (&anotacion, &anotacion, &transaccion_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "transactionId": transaccion_id, "estado": "ANULADO" }),
    )
}

fn handle_transactions_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let transaccion_id = match required_str(req, "transactionId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let estado: Option<String> = match conn
        .query_row(
            "SELECT estado FROM transacciones WHERE id = ?",
            [&transaccion_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(estado) = estado else {
        return err(&req.id, "not_found", "transacción not found", None);
    };
    if estado != "REGISTRADO" {
        return err(
            &req.id,
            "invalid_state",
            format!("no se puede eliminar una transacción en estado {}", estado),
            None,
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (sql, table) in [
        (
            "DELETE FROM documentos_respaldo WHERE transaccion_id = ?",
            "documentos_respaldo",
        ),
        (
            "DELETE FROM detalles_transaccion WHERE transaccion_id = ?",
            "detalles_transaccion",
        ),
        ("DELETE FROM transacciones WHERE id = ?", "transacciones"),
    ] {
        if let Err(e) = tx.execute(sql, [&transaccion_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "transactionId": transaccion_id, "deleted": true }))
}

fn handle_transactions_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = req
        .params
        .get("year")
        .and_then(|v| v.as_i64())
        .unwrap_or_else(|| finance::today().year() as i64);
    let prefix = format!("{:04}", year);

    let head: (i64, f64, f64, i64) = match conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(monto_final), 0),
                COALESCE(AVG(monto_final), 0),
                COUNT(DISTINCT estudiante_id)
         FROM transacciones
         WHERE substr(fecha_pago, 1, 4) = ?",
        [&prefix],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut por_estado = serde_json::Map::new();
    for estado in EstadoTransaccion::ALL {
        let row: (i64, f64) = match conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(monto_final), 0)
             FROM transacciones
             WHERE substr(fecha_pago, 1, 4) = ? AND estado = ?",
            (&prefix, estado.as_str()),
            |r| Ok((r.get(0)?, r.get(1)?)),
        ) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        por_estado.insert(
            estado.as_str().to_string(),
            json!({ "cantidad": row.0, "monto": finance::round_money(row.1) }),
        );
    }

    let mut por_forma_pago = serde_json::Map::new();
    for forma in FormaPago::ALL {
        let row: (i64, f64) = match conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(monto_final), 0)
             FROM transacciones
             WHERE substr(fecha_pago, 1, 4) = ? AND forma_pago = ?",
            (&prefix, forma.as_str()),
            |r| Ok((r.get(0)?, r.get(1)?)),
        ) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        por_forma_pago.insert(
            forma.as_str().to_string(),
            json!({ "cantidad": row.0, "monto": finance::round_money(row.1) }),
        );
    }

    let mut stmt = match conn.prepare(
        "SELECT substr(fecha_pago, 6, 2), COUNT(*), COALESCE(SUM(monto_final), 0)
         FROM transacciones
         WHERE substr(fecha_pago, 1, 4) = ?
         GROUP BY substr(fecha_pago, 6, 2)
         ORDER BY 1",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mensual = stmt
        .query_map([&prefix], |row| {
            let mes: String = row.get(0)?;
            let cantidad: i64 = row.get(1)?;
            let monto: f64 = row.get(2)?;
            Ok(json!({
                "mes": mes.parse::<i64>().unwrap_or(0),
                "cantidad": cantidad,
                "monto": finance::round_money(monto)
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let mensual = match mensual {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "year": year,
            "totalTransacciones": head.0,
            "montoTotal": finance::round_money(head.1),
            "montoPromedio": finance::round_money(head.2),
            "estudiantesConPagos": head.3,
            "porEstado": por_estado,
            "porFormaPago": por_forma_pago,
            "distribucionMensual": mensual
        }),
    )
}

fn handle_concepts_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let active_only = opt_bool(req, "activeOnly").unwrap_or(true);
    let sql = format!(
        "SELECT id, codigo, nombre, aplica_programa, aplica_estudiante, activo
         FROM conceptos_pago {} ORDER BY codigo",
        if active_only { "WHERE activo = 1" } else { "" }
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "codigo": row.get::<_, String>(1)?,
                "nombre": row.get::<_, String>(2)?,
                "aplicaPrograma": row.get::<_, i64>(3)? != 0,
                "aplicaEstudiante": row.get::<_, i64>(4)? != 0,
                "activo": row.get::<_, i64>(5)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(conceptos) => ok(&req.id, json!({ "conceptos": conceptos })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_concepts_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let codigo = match required_str(req, "codigo") {
        Ok(v) => v.to_ascii_uppercase(),
        Err(e) => return e,
    };
    match conn
        .query_row(
            "SELECT id, codigo, nombre, aplica_programa, aplica_estudiante, activo
             FROM conceptos_pago WHERE codigo = ?",
            [&codigo],
            |row| {
                Ok(json!({
                    "id": row.get::<_, String>(0)?,
                    "codigo": row.get::<_, String>(1)?,
                    "nombre": row.get::<_, String>(2)?,
                    "aplicaPrograma": row.get::<_, i64>(3)? != 0,
                    "aplicaEstudiante": row.get::<_, i64>(4)? != 0,
                    "activo": row.get::<_, i64>(5)? != 0,
                }))
            },
        )
        .optional()
    {
        Ok(Some(concepto)) => ok(&req.id, json!({ "concepto": concepto })),
        Ok(None) => err(&req.id, "not_found", "concepto not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "payments.register" => Some(handle_payments_register(state, req)),
        "transactions.create" => Some(handle_transactions_create(state, req)),
        "transactions.get" => Some(handle_transactions_get(state, req)),
        "transactions.list" => Some(handle_transactions_list(state, req)),
        "transactions.confirm" => Some(handle_transactions_confirm(state, req)),
        "transactions.annul" => Some(handle_transactions_annul(state, req)),
        "transactions.delete" => Some(handle_transactions_delete(state, req)),
        "transactions.stats" => Some(handle_transactions_stats(state, req)),
        "concepts.list" => Some(handle_concepts_list(state, req)),
        "concepts.get" => Some(handle_concepts_get(state, req)),
        _ => None,
    }
}
