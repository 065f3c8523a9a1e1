use anyhow::{bail, Context};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/formagest.sqlite3";
const META_WORKSPACE_ENTRY: &str = "meta/workspace.json";
pub const BUNDLE_FORMAT_V1: &str = "formagest-workspace-v1";

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub db_sha256: String,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
}

fn write_json_entry(
    zip: &mut ZipWriter<File>,
    opts: FileOptions,
    name: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    zip.start_file(name, opts)
        .with_context(|| format!("cannot start bundle entry {name}"))?;
    let text = serde_json::to_string_pretty(value)
        .with_context(|| format!("cannot serialize bundle entry {name}"))?;
    zip.write_all(text.as_bytes())
        .with_context(|| format!("cannot write bundle entry {name}"))?;
    Ok(())
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(crate::db::DB_FILE_NAME);
    if !db_path.is_file() {
        bail!("workspace database not found: {}", db_path.to_string_lossy());
    }
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create directory {}", parent.to_string_lossy()))?;
    }

    let db_bytes = std::fs::read(&db_path)
        .with_context(|| format!("cannot read database {}", db_path.to_string_lossy()))?;
    let db_sha256 = format!("{:x}", Sha256::digest(&db_bytes));

    let out_file = File::create(out_path)
        .with_context(|| format!("cannot create bundle {}", out_path.to_string_lossy()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let exported_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    write_json_entry(
        &mut zip,
        opts,
        MANIFEST_ENTRY,
        &json!({
            "format": BUNDLE_FORMAT_V1,
            "version": 1,
            "appVersion": env!("CARGO_PKG_VERSION"),
            "exportedAt": exported_at,
            "dbSha256": db_sha256,
        }),
    )?;

    zip.start_file(DB_ENTRY, opts)
        .context("cannot start database entry")?;
    zip.write_all(&db_bytes)
        .context("cannot write database entry")?;

    write_json_entry(
        &mut zip,
        opts,
        META_WORKSPACE_ENTRY,
        &json!({ "sourceWorkspace": workspace_path.to_string_lossy() }),
    )?;

    zip.finish().context("cannot finalize bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count: 3,
        db_sha256,
    })
}

pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path)
        .with_context(|| format!("cannot create workspace {}", workspace_path.to_string_lossy()))?;
    let dst = workspace_path.join(crate::db::DB_FILE_NAME);

    // Bare .sqlite3 files from hand-made backups are accepted as-is.
    if !is_zip_file(in_path)? {
        std::fs::copy(in_path, &dst).with_context(|| {
            format!(
                "cannot copy sqlite backup {} into the workspace",
                in_path.to_string_lossy()
            )
        })?;
        return Ok(ImportSummary {
            bundle_format_detected: "legacy-sqlite3".to_string(),
        });
    }

    let in_file = File::open(in_path)
        .with_context(|| format!("cannot open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let manifest = read_manifest(&mut archive)?;
    let format = manifest.get("format").and_then(|v| v.as_str()).unwrap_or("");
    if format != BUNDLE_FORMAT_V1 {
        bail!("unsupported bundle format: {format}");
    }

    let mut db_bytes = Vec::new();
    archive
        .by_name(DB_ENTRY)
        .with_context(|| format!("bundle missing {DB_ENTRY}"))?
        .read_to_end(&mut db_bytes)
        .context("cannot extract database entry")?;

    // The manifest checksum guards against truncated or tampered bundles.
    if let Some(expected) = manifest.get("dbSha256").and_then(|v| v.as_str()) {
        let actual = format!("{:x}", Sha256::digest(&db_bytes));
        if actual != expected {
            bail!("bundle checksum mismatch: manifest {expected} but database {actual}");
        }
    }

    // Stage next to the destination, then swap, so a failed extract never
    // leaves a half-written database behind.
    let staging = workspace_path.join(format!("{}.importing", crate::db::DB_FILE_NAME));
    std::fs::write(&staging, &db_bytes)
        .with_context(|| format!("cannot stage database at {}", staging.to_string_lossy()))?;
    if dst.exists() {
        std::fs::remove_file(&dst)
            .with_context(|| format!("cannot replace database {}", dst.to_string_lossy()))?;
    }
    std::fs::rename(&staging, &dst)
        .with_context(|| format!("cannot move staged database to {}", dst.to_string_lossy()))?;

    Ok(ImportSummary {
        bundle_format_detected: BUNDLE_FORMAT_V1.to_string(),
    })
}

fn read_manifest(archive: &mut ZipArchive<File>) -> anyhow::Result<serde_json::Value> {
    let mut text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .with_context(|| format!("bundle missing {MANIFEST_ENTRY}"))?
        .read_to_string(&mut text)
        .with_context(|| format!("cannot read {MANIFEST_ENTRY}"))?;
    serde_json::from_str(&text).with_context(|| format!("{MANIFEST_ENTRY} is invalid JSON"))
}

fn is_zip_file(path: &Path) -> anyhow::Result<bool> {
    let mut f = File::open(path)
        .with_context(|| format!("cannot open input file {}", path.to_string_lossy()))?;
    let mut sig = [0u8; 4];
    let read = f.read(&mut sig).context("cannot read file signature")?;
    Ok(read == 4 && sig == ZIP_MAGIC)
}
