use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "formagest.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS estudiantes(
            id TEXT PRIMARY KEY,
            ci_numero TEXT NOT NULL UNIQUE,
            ci_expedicion TEXT NOT NULL,
            nombres TEXT NOT NULL,
            apellido_paterno TEXT NOT NULL,
            apellido_materno TEXT,
            fecha_nacimiento TEXT,
            telefono TEXT,
            email TEXT,
            direccion TEXT,
            profesion TEXT,
            universidad TEXT,
            fotografia_url TEXT,
            activo INTEGER NOT NULL DEFAULT 1,
            fecha_registro TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_estudiantes_apellidos
         ON estudiantes(apellido_paterno, apellido_materno, nombres)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS docentes(
            id TEXT PRIMARY KEY,
            ci_numero TEXT NOT NULL UNIQUE,
            ci_expedicion TEXT NOT NULL,
            nombres TEXT NOT NULL,
            apellidos TEXT NOT NULL,
            grado_academico TEXT NOT NULL,
            tarifa_hora REAL NOT NULL DEFAULT 0,
            telefono TEXT,
            email TEXT,
            activo INTEGER NOT NULL DEFAULT 1,
            fecha_registro TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS programas(
            id TEXT PRIMARY KEY,
            codigo TEXT NOT NULL UNIQUE,
            nombre TEXT NOT NULL,
            descripcion TEXT,
            duracion_meses INTEGER NOT NULL,
            horas_totales INTEGER NOT NULL,
            costo_total REAL NOT NULL DEFAULT 0,
            costo_matricula REAL NOT NULL DEFAULT 0,
            costo_inscripcion REAL NOT NULL DEFAULT 0,
            costo_mensualidad REAL NOT NULL DEFAULT 0,
            numero_cuotas INTEGER NOT NULL DEFAULT 1,
            cupos_maximos INTEGER,
            cupos_inscritos INTEGER NOT NULL DEFAULT 0,
            estado TEXT NOT NULL DEFAULT 'PLANIFICADO',
            fecha_inicio TEXT,
            fecha_fin TEXT,
            docente_coordinador_id TEXT,
            promocion_descuento REAL NOT NULL DEFAULT 0,
            promocion_descripcion TEXT,
            promocion_valido_hasta TEXT,
            FOREIGN KEY(docente_coordinador_id) REFERENCES docentes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_programas_estado ON programas(estado)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS inscripciones(
            id TEXT PRIMARY KEY,
            estudiante_id TEXT NOT NULL,
            programa_id TEXT NOT NULL,
            fecha_inscripcion TEXT NOT NULL,
            estado TEXT NOT NULL DEFAULT 'PREINSCRITO',
            valor_final REAL NOT NULL DEFAULT 0,
            observaciones TEXT,
            FOREIGN KEY(estudiante_id) REFERENCES estudiantes(id),
            FOREIGN KEY(programa_id) REFERENCES programas(id),
            UNIQUE(estudiante_id, programa_id)
        )",
        [],
    )?;
    // Older workspaces carried a descuento_aplicado column instead of
    // valor_final. The valor_final schema is authoritative.
    migrate_inscripciones_valor_final(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_inscripciones_estudiante ON inscripciones(estudiante_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_inscripciones_programa ON inscripciones(programa_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS conceptos_pago(
            id TEXT PRIMARY KEY,
            codigo TEXT NOT NULL UNIQUE,
            nombre TEXT NOT NULL,
            aplica_programa INTEGER NOT NULL DEFAULT 1,
            aplica_estudiante INTEGER NOT NULL DEFAULT 1,
            activo INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;
    seed_conceptos_pago(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS transacciones(
            id TEXT PRIMARY KEY,
            numero_transaccion TEXT NOT NULL UNIQUE,
            estudiante_id TEXT NOT NULL,
            programa_id TEXT,
            fecha_pago TEXT NOT NULL,
            monto_total REAL NOT NULL,
            descuento_total REAL NOT NULL DEFAULT 0,
            monto_final REAL NOT NULL,
            forma_pago TEXT NOT NULL,
            estado TEXT NOT NULL DEFAULT 'REGISTRADO',
            numero_comprobante TEXT,
            banco_origen TEXT,
            cuenta_origen TEXT,
            observaciones TEXT,
            registrado_por TEXT,
            fecha_registro TEXT NOT NULL,
            FOREIGN KEY(estudiante_id) REFERENCES estudiantes(id),
            FOREIGN KEY(programa_id) REFERENCES programas(id),
            FOREIGN KEY(registrado_por) REFERENCES usuarios(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transacciones_estudiante ON transacciones(estudiante_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transacciones_programa ON transacciones(programa_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transacciones_fecha ON transacciones(fecha_pago)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS detalles_transaccion(
            id TEXT PRIMARY KEY,
            transaccion_id TEXT NOT NULL,
            concepto_pago_id TEXT NOT NULL,
            descripcion TEXT NOT NULL,
            cantidad REAL NOT NULL DEFAULT 1,
            precio_unitario REAL NOT NULL,
            subtotal REAL NOT NULL,
            orden INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(transaccion_id) REFERENCES transacciones(id),
            FOREIGN KEY(concepto_pago_id) REFERENCES conceptos_pago(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_detalles_transaccion ON detalles_transaccion(transaccion_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS movimientos_caja(
            id TEXT PRIMARY KEY,
            transaccion_id TEXT UNIQUE,
            tipo TEXT NOT NULL,
            monto REAL NOT NULL,
            forma_pago TEXT NOT NULL,
            descripcion TEXT NOT NULL,
            fecha TEXT NOT NULL,
            FOREIGN KEY(transaccion_id) REFERENCES transacciones(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_movimientos_fecha ON movimientos_caja(fecha)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS facturas(
            id TEXT PRIMARY KEY,
            transaccion_id TEXT NOT NULL UNIQUE,
            numero_factura TEXT NOT NULL UNIQUE,
            nit TEXT,
            razon_social TEXT NOT NULL,
            subtotal REAL NOT NULL,
            iva REAL NOT NULL,
            it REAL NOT NULL,
            total REAL NOT NULL,
            fecha_emision TEXT NOT NULL,
            FOREIGN KEY(transaccion_id) REFERENCES transacciones(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS documentos_respaldo(
            id TEXT PRIMARY KEY,
            transaccion_id TEXT NOT NULL,
            tipo_documento TEXT NOT NULL,
            nombre_original TEXT NOT NULL,
            nombre_archivo TEXT NOT NULL,
            extension TEXT NOT NULL,
            ruta_archivo TEXT NOT NULL,
            tamano_bytes INTEGER,
            observaciones TEXT,
            subido_por TEXT,
            fecha_subida TEXT NOT NULL,
            FOREIGN KEY(transaccion_id) REFERENCES transacciones(id),
            FOREIGN KEY(subido_por) REFERENCES usuarios(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_documentos_transaccion
         ON documentos_respaldo(transaccion_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS usuarios(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            nombre_completo TEXT NOT NULL,
            email TEXT,
            rol TEXT NOT NULL DEFAULT 'CAJERO',
            activo INTEGER NOT NULL DEFAULT 1,
            fecha_registro TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS configuraciones(
            id TEXT PRIMARY KEY,
            clave TEXT NOT NULL UNIQUE,
            valor TEXT NOT NULL,
            descripcion TEXT,
            tipo TEXT NOT NULL DEFAULT 'TEXTO',
            categoria TEXT NOT NULL DEFAULT 'GENERAL',
            editable INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;
    seed_configuraciones(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS empresa(
            id TEXT PRIMARY KEY,
            nombre TEXT NOT NULL,
            nit TEXT NOT NULL,
            direccion TEXT,
            telefono TEXT,
            email TEXT,
            logo_url TEXT
        )",
        [],
    )?;

    Ok(conn)
}

/// v0 -> v1 enrollment pricing:
/// - v0 stored a money discount per enrollment (descuento_aplicado)
/// - v1 stores the final agreed price (valor_final)
/// Existing rows convert as valor_final = programa.costo_total - descuento.
fn migrate_inscripciones_valor_final(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "inscripciones", "descuento_aplicado")? {
        return Ok(());
    }
    if !table_has_column(conn, "inscripciones", "valor_final")? {
        conn.execute(
            "ALTER TABLE inscripciones ADD COLUMN valor_final REAL NOT NULL DEFAULT 0",
            [],
        )?;
    }
    conn.execute(
        "UPDATE inscripciones SET valor_final = MAX(
           (SELECT p.costo_total FROM programas p WHERE p.id = inscripciones.programa_id)
             - COALESCE(descuento_aplicado, 0),
           0
         )
         WHERE valor_final = 0",
        [],
    )?;
    // SQLite can't drop the legacy column on old versions; neutralize it so
    // the two discount models never coexist.
    conn.execute("UPDATE inscripciones SET descuento_aplicado = NULL", [])?;
    Ok(())
}

fn seed_conceptos_pago(conn: &Connection) -> anyhow::Result<()> {
    let seeds: [(&str, &str, i64, i64); 5] = [
        ("MATRICULA", "Matrícula", 1, 0),
        ("INSCRIPCION", "Inscripción", 1, 0),
        ("MENSUALIDAD", "Mensualidad", 1, 0),
        ("DESCUENTO", "Descuento aplicado", 1, 1),
        ("OTROS", "Otros conceptos", 1, 1),
    ];
    for (codigo, nombre, aplica_programa, aplica_estudiante) in seeds {
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM conceptos_pago WHERE codigo = ?",
                [codigo],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_none() {
            conn.execute(
                "INSERT INTO conceptos_pago(id, codigo, nombre, aplica_programa, aplica_estudiante, activo)
                 VALUES(?, ?, ?, ?, ?, 1)",
                (
                    uuid::Uuid::new_v4().to_string(),
                    codigo,
                    nombre,
                    aplica_programa,
                    aplica_estudiante,
                ),
            )?;
        }
    }
    Ok(())
}

fn seed_configuraciones(conn: &Connection) -> anyhow::Result<()> {
    let seeds: [(&str, &str, &str, &str, &str); 3] = [
        (
            "moroso_dias_umbral",
            "30",
            "Días sin pago antes de marcar una inscripción como morosa",
            "ENTERO",
            "PAGOS",
        ),
        (
            "factura_iva_porcentaje",
            "13",
            "Porcentaje IVA aplicado en facturas",
            "ENTERO",
            "FACTURACION",
        ),
        (
            "factura_it_porcentaje",
            "3",
            "Porcentaje IT aplicado en facturas",
            "ENTERO",
            "FACTURACION",
        ),
    ];
    for (clave, valor, descripcion, tipo, categoria) in seeds {
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM configuraciones WHERE clave = ?",
                [clave],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_none() {
            conn.execute(
                "INSERT INTO configuraciones(id, clave, valor, descripcion, tipo, categoria, editable)
                 VALUES(?, ?, ?, ?, ?, ?, 1)",
                (
                    uuid::Uuid::new_v4().to_string(),
                    clave,
                    valor,
                    descripcion,
                    tipo,
                    categoria,
                ),
            )?;
        }
    }
    Ok(())
}

/// Reads a numeric configuration value, falling back when the row is missing
/// or unparsable.
pub fn config_i64(conn: &Connection, clave: &str, default: i64) -> i64 {
    conn.query_row(
        "SELECT valor FROM configuraciones WHERE clave = ?",
        [clave],
        |r| r.get::<_, String>(0),
    )
    .optional()
    .ok()
    .flatten()
    .and_then(|v| v.trim().parse().ok())
    .unwrap_or(default)
}

pub fn config_f64(conn: &Connection, clave: &str, default: f64) -> f64 {
    conn.query_row(
        "SELECT valor FROM configuraciones WHERE clave = ?",
        [clave],
        |r| r.get::<_, String>(0),
    )
    .optional()
    .ok()
    .flatten()
    .and_then(|v| v.trim().parse().ok())
    .unwrap_or(default)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
