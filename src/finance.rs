use chrono::{Datelike, NaiveDate};
use serde::Serialize;

/// Currency rounding used everywhere money is derived:
/// half-up to 2 decimals, matching the NUMERIC(10,2) storage of the ledger.
pub fn round_money(x: f64) -> f64 {
    ((100.0 * x) + 0.5_f64.copysign(x)).trunc() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct FinanceError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl FinanceError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// Calendar month addition with day-of-month clamped to the target month's
/// length (Jan 31 + 1 month = Feb 28/29). Used to derive fecha_fin from
/// fecha_inicio + duracion_meses.
pub fn add_months(date: NaiveDate, months: i64) -> NaiveDate {
    let total = date.year() as i64 * 12 + (date.month0() as i64) + months;
    let year = total.div_euclid(12) as i32;
    let month = (total.rem_euclid(12) + 1) as u32;
    let day = date.day().min(days_in_month(year, month));
    // Clamped day always lands inside the month.
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(date)
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub fn today_year() -> i32 {
    today().year()
}

/// Business numbers share one shape: `P-YYYY-NNNNNN`, sequential per calendar
/// year under the prefix. `T` for transactions, `F` for invoices.
pub fn format_numero(prefix: char, year: i32, seq: i64) -> String {
    format!("{}-{}-{:06}", prefix, year, seq)
}

/// Extracts the sequence of a number carrying the given prefix and year.
/// Foreign prefixes/years return None so a MAX scan can skip them.
pub fn parse_numero_seq(numero: &str, prefix: char, year: i32) -> Option<i64> {
    let expected = format!("{}-{}-", prefix, year);
    numero
        .strip_prefix(&expected)
        .filter(|rest| rest.len() == 6 && rest.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|rest| rest.parse().ok())
}

pub const ESTADO_COMPLETO: &str = "COMPLETO";
pub const ESTADO_PARCIAL: &str = "PARCIAL";
pub const ESTADO_INICIAL: &str = "INICIAL";
pub const ESTADO_SIN_PAGOS: &str = "SIN_PAGOS";

/// Buckets a paid-vs-owed pair by percentage paid. A zero-cost enrollment
/// owes nothing and reports COMPLETO.
pub fn estado_financiero(costo: f64, pagado: f64) -> &'static str {
    if costo <= 0.0 {
        return ESTADO_COMPLETO;
    }
    let pct = 100.0 * pagado / costo;
    if pct >= 100.0 {
        ESTADO_COMPLETO
    } else if pct >= 50.0 {
        ESTADO_PARCIAL
    } else if pct > 0.0 {
        ESTADO_INICIAL
    } else {
        ESTADO_SIN_PAGOS
    }
}

pub fn saldo_pendiente(costo: f64, pagado: f64) -> f64 {
    round_money((costo - pagado).max(0.0))
}

pub fn porcentaje_pagado(costo: f64, pagado: f64) -> f64 {
    if costo <= 0.0 {
        100.0
    } else {
        round_money(100.0 * pagado / costo)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CuotaProgramada {
    pub numero: u32,
    pub concepto: String,
    pub monto: f64,
    pub fecha_sugerida: String,
}

/// Suggested payment plan for one enrollment: matricula and inscripcion up
/// front on the start date, then numero_cuotas monthly installments of
/// costo_mensualidad.
pub fn cronograma_pagos(
    fecha_inicio: NaiveDate,
    costo_matricula: f64,
    costo_inscripcion: f64,
    costo_mensualidad: f64,
    numero_cuotas: i64,
) -> Vec<CuotaProgramada> {
    let mut cuotas = Vec::new();
    let mut numero = 0u32;
    if costo_matricula > 0.0 {
        numero += 1;
        cuotas.push(CuotaProgramada {
            numero,
            concepto: "MATRICULA".to_string(),
            monto: round_money(costo_matricula),
            fecha_sugerida: fecha_inicio.format("%Y-%m-%d").to_string(),
        });
    }
    if costo_inscripcion > 0.0 {
        numero += 1;
        cuotas.push(CuotaProgramada {
            numero,
            concepto: "INSCRIPCION".to_string(),
            monto: round_money(costo_inscripcion),
            fecha_sugerida: fecha_inicio.format("%Y-%m-%d").to_string(),
        });
    }
    if costo_mensualidad > 0.0 {
        for i in 0..numero_cuotas.max(0) {
            numero += 1;
            cuotas.push(CuotaProgramada {
                numero,
                concepto: "MENSUALIDAD".to_string(),
                monto: round_money(costo_mensualidad),
                fecha_sugerida: add_months(fecha_inicio, i + 1).format("%Y-%m-%d").to_string(),
            });
        }
    }
    cuotas
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluacionMora {
    pub dias_sin_pago: i64,
    pub moroso: bool,
}

/// Delinquency rule: a debtor enrollment is moroso once the days elapsed
/// since its last confirmed payment (or since the enrollment/program start
/// when it never paid) exceed the configured threshold.
pub fn evaluar_mora(
    ultimo_pago: Option<NaiveDate>,
    referencia: NaiveDate,
    hoy: NaiveDate,
    umbral_dias: i64,
    saldo: f64,
) -> EvaluacionMora {
    let desde = ultimo_pago.unwrap_or(referencia);
    let dias = (hoy - desde).num_days().max(0);
    EvaluacionMora {
        dias_sin_pago: dias,
        moroso: saldo > 0.0 && dias > umbral_dias,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).expect("valid date")
    }

    #[test]
    fn round_money_half_up() {
        assert_eq!(round_money(10.004), 10.0);
        assert_eq!(round_money(10.006), 10.01);
        assert_eq!(round_money(-10.006), -10.01);
        assert_eq!(round_money(0.0), 0.0);
        assert_eq!(round_money(349.999), 350.0);
    }

    #[test]
    fn add_months_clamps_to_month_end() {
        assert_eq!(add_months(d(2025, 1, 31), 1), d(2025, 2, 28));
        assert_eq!(add_months(d(2024, 1, 31), 1), d(2024, 2, 29));
        assert_eq!(add_months(d(2025, 3, 15), 6), d(2025, 9, 15));
        assert_eq!(add_months(d(2025, 10, 1), 12), d(2026, 10, 1));
        assert_eq!(add_months(d(2025, 11, 30), 3), d(2026, 2, 28));
    }

    #[test]
    fn numero_format_and_parse_round() {
        assert_eq!(format_numero('T', 2026, 1), "T-2026-000001");
        assert_eq!(parse_numero_seq("T-2026-000123", 'T', 2026), Some(123));
        assert_eq!(parse_numero_seq("T-2025-000123", 'T', 2026), None);
        assert_eq!(parse_numero_seq("F-2026-000123", 'T', 2026), None);
        assert_eq!(parse_numero_seq("T-2026-12", 'T', 2026), None);
        assert_eq!(parse_numero_seq("T-2026-abc123", 'T', 2026), None);
    }

    #[test]
    fn estado_financiero_buckets() {
        assert_eq!(estado_financiero(1000.0, 1000.0), ESTADO_COMPLETO);
        assert_eq!(estado_financiero(1000.0, 1250.0), ESTADO_COMPLETO);
        assert_eq!(estado_financiero(1000.0, 999.99), ESTADO_PARCIAL);
        assert_eq!(estado_financiero(1000.0, 500.0), ESTADO_PARCIAL);
        assert_eq!(estado_financiero(1000.0, 499.99), ESTADO_INICIAL);
        assert_eq!(estado_financiero(1000.0, 0.01), ESTADO_INICIAL);
        assert_eq!(estado_financiero(1000.0, 0.0), ESTADO_SIN_PAGOS);
        assert_eq!(estado_financiero(0.0, 0.0), ESTADO_COMPLETO);
    }

    #[test]
    fn saldo_never_negative() {
        assert_eq!(saldo_pendiente(1000.0, 400.0), 600.0);
        assert_eq!(saldo_pendiente(1000.0, 1000.0), 0.0);
        assert_eq!(saldo_pendiente(1000.0, 1500.0), 0.0);
    }

    #[test]
    fn cronograma_orders_upfront_then_monthly() {
        let cuotas = cronograma_pagos(d(2026, 3, 1), 200.0, 100.0, 350.0, 3);
        assert_eq!(cuotas.len(), 5);
        assert_eq!(cuotas[0].concepto, "MATRICULA");
        assert_eq!(cuotas[0].fecha_sugerida, "2026-03-01");
        assert_eq!(cuotas[1].concepto, "INSCRIPCION");
        assert_eq!(cuotas[2].concepto, "MENSUALIDAD");
        assert_eq!(cuotas[2].fecha_sugerida, "2026-04-01");
        assert_eq!(cuotas[4].fecha_sugerida, "2026-06-01");
        assert_eq!(cuotas[4].numero, 5);
    }

    #[test]
    fn mora_requires_debt_and_elapsed_days() {
        let hoy = d(2026, 8, 4);
        let eval = evaluar_mora(Some(d(2026, 7, 10)), d(2026, 1, 1), hoy, 30, 500.0);
        assert_eq!(eval.dias_sin_pago, 25);
        assert!(!eval.moroso);

        let eval = evaluar_mora(Some(d(2026, 6, 1)), d(2026, 1, 1), hoy, 30, 500.0);
        assert_eq!(eval.dias_sin_pago, 64);
        assert!(eval.moroso);

        // Fully paid is never moroso, however old the last payment.
        let eval = evaluar_mora(Some(d(2025, 1, 1)), d(2025, 1, 1), hoy, 30, 0.0);
        assert!(!eval.moroso);

        // Never paid: counts from the reference date.
        let eval = evaluar_mora(None, d(2026, 7, 20), hoy, 30, 500.0);
        assert_eq!(eval.dias_sin_pago, 15);
        assert!(!eval.moroso);
    }
}
