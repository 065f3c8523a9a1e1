//! Closed domain sets shared by validation and reporting.
//!
//! Every set here mirrors a CHECK-style domain in the persisted schema, so a
//! value that parses is always safe to write.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpedicionCi {
    Be,
    Ch,
    Cb,
    Lp,
    Or,
    Pd,
    Pt,
    Sc,
    Tj,
    Ex,
}

impl ExpedicionCi {
    pub const ALL: [ExpedicionCi; 10] = [
        ExpedicionCi::Be,
        ExpedicionCi::Ch,
        ExpedicionCi::Cb,
        ExpedicionCi::Lp,
        ExpedicionCi::Or,
        ExpedicionCi::Pd,
        ExpedicionCi::Pt,
        ExpedicionCi::Sc,
        ExpedicionCi::Tj,
        ExpedicionCi::Ex,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExpedicionCi::Be => "BE",
            ExpedicionCi::Ch => "CH",
            ExpedicionCi::Cb => "CB",
            ExpedicionCi::Lp => "LP",
            ExpedicionCi::Or => "OR",
            ExpedicionCi::Pd => "PD",
            ExpedicionCi::Pt => "PT",
            ExpedicionCi::Sc => "SC",
            ExpedicionCi::Tj => "TJ",
            ExpedicionCi::Ex => "EX",
        }
    }

    pub fn parse(s: &str) -> Option<ExpedicionCi> {
        Self::ALL
            .iter()
            .copied()
            .find(|e| e.as_str() == s.to_ascii_uppercase())
    }
}

/// Academic grades accepted for docentes. The dotted forms are stored verbatim.
pub const GRADOS_ACADEMICOS: [&str; 7] = ["LIC.", "ING.", "M.Sc.", "Mg.", "MBA", "Ph.D.", "Dr."];

pub fn is_grado_academico(s: &str) -> bool {
    GRADOS_ACADEMICOS.contains(&s)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstadoPrograma {
    Planificado,
    Inscripciones,
    EnCurso,
    Concluido,
    Cancelado,
}

impl EstadoPrograma {
    pub const ALL: [EstadoPrograma; 5] = [
        EstadoPrograma::Planificado,
        EstadoPrograma::Inscripciones,
        EstadoPrograma::EnCurso,
        EstadoPrograma::Concluido,
        EstadoPrograma::Cancelado,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EstadoPrograma::Planificado => "PLANIFICADO",
            EstadoPrograma::Inscripciones => "INSCRIPCIONES",
            EstadoPrograma::EnCurso => "EN_CURSO",
            EstadoPrograma::Concluido => "CONCLUIDO",
            EstadoPrograma::Cancelado => "CANCELADO",
        }
    }

    pub fn parse(s: &str) -> Option<EstadoPrograma> {
        Self::ALL.iter().copied().find(|e| e.as_str() == s)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EstadoPrograma::Concluido | EstadoPrograma::Cancelado)
    }

    /// Forward transitions only. CANCELADO is handled separately because it
    /// also requires the program to have zero enrolled students.
    pub fn can_advance_to(self, next: EstadoPrograma) -> bool {
        use EstadoPrograma::*;
        matches!(
            (self, next),
            (Planificado, Inscripciones) | (Inscripciones, EnCurso) | (EnCurso, Concluido)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstadoInscripcion {
    Preinscrito,
    Inscrito,
    EnCurso,
    Concluido,
    Retirado,
}

impl EstadoInscripcion {
    pub const ALL: [EstadoInscripcion; 5] = [
        EstadoInscripcion::Preinscrito,
        EstadoInscripcion::Inscrito,
        EstadoInscripcion::EnCurso,
        EstadoInscripcion::Concluido,
        EstadoInscripcion::Retirado,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EstadoInscripcion::Preinscrito => "PREINSCRITO",
            EstadoInscripcion::Inscrito => "INSCRITO",
            EstadoInscripcion::EnCurso => "EN_CURSO",
            EstadoInscripcion::Concluido => "CONCLUIDO",
            EstadoInscripcion::Retirado => "RETIRADO",
        }
    }

    pub fn parse(s: &str) -> Option<EstadoInscripcion> {
        Self::ALL.iter().copied().find(|e| e.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormaPago {
    Efectivo,
    Transferencia,
    Tarjeta,
    Deposito,
    Qr,
}

impl FormaPago {
    pub const ALL: [FormaPago; 5] = [
        FormaPago::Efectivo,
        FormaPago::Transferencia,
        FormaPago::Tarjeta,
        FormaPago::Deposito,
        FormaPago::Qr,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FormaPago::Efectivo => "EFECTIVO",
            FormaPago::Transferencia => "TRANSFERENCIA",
            FormaPago::Tarjeta => "TARJETA",
            FormaPago::Deposito => "DEPOSITO",
            FormaPago::Qr => "QR",
        }
    }

    pub fn parse(s: &str) -> Option<FormaPago> {
        Self::ALL.iter().copied().find(|e| e.as_str() == s)
    }

    /// Bank-mediated methods need a voucher number before registration.
    pub fn requires_comprobante(self) -> bool {
        matches!(self, FormaPago::Transferencia | FormaPago::Deposito)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstadoTransaccion {
    Registrado,
    Confirmado,
    Anulado,
}

impl EstadoTransaccion {
    pub const ALL: [EstadoTransaccion; 3] = [
        EstadoTransaccion::Registrado,
        EstadoTransaccion::Confirmado,
        EstadoTransaccion::Anulado,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EstadoTransaccion::Registrado => "REGISTRADO",
            EstadoTransaccion::Confirmado => "CONFIRMADO",
            EstadoTransaccion::Anulado => "ANULADO",
        }
    }

    pub fn parse(s: &str) -> Option<EstadoTransaccion> {
        Self::ALL.iter().copied().find(|e| e.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolUsuario {
    Administrador,
    Coordinador,
    Cajero,
    Consulta,
}

impl RolUsuario {
    pub const ALL: [RolUsuario; 4] = [
        RolUsuario::Administrador,
        RolUsuario::Coordinador,
        RolUsuario::Cajero,
        RolUsuario::Consulta,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RolUsuario::Administrador => "ADMINISTRADOR",
            RolUsuario::Coordinador => "COORDINADOR",
            RolUsuario::Cajero => "CAJERO",
            RolUsuario::Consulta => "CONSULTA",
        }
    }

    pub fn parse(s: &str) -> Option<RolUsuario> {
        Self::ALL.iter().copied().find(|e| e.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TipoMovimiento {
    Ingreso,
    Egreso,
}

impl TipoMovimiento {
    pub fn as_str(self) -> &'static str {
        match self {
            TipoMovimiento::Ingreso => "INGRESO",
            TipoMovimiento::Egreso => "EGRESO",
        }
    }

    pub fn parse(s: &str) -> Option<TipoMovimiento> {
        match s {
            "INGRESO" => Some(TipoMovimiento::Ingreso),
            "EGRESO" => Some(TipoMovimiento::Egreso),
            _ => None,
        }
    }
}

/// Receipt/attachment extensions accepted for documentos_respaldo.
pub const EXTENSIONES_DOCUMENTO: [&str; 8] =
    ["jpg", "jpeg", "png", "pdf", "doc", "docx", "xls", "xlsx"];

pub fn is_extension_documento(ext: &str) -> bool {
    let lower = ext.trim_start_matches('.').to_ascii_lowercase();
    EXTENSIONES_DOCUMENTO.contains(&lower.as_str())
}
