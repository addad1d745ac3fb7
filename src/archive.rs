use crate::error::{GradeError, StoreError};
use crate::store::{
    GradeStore, RosterProvider, ScoreRow, SheetKey, SqliteStore, SubmissionRecord,
};
use crate::submission::SubmissionStatus;
use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const ARCHIVE_FORMAT: &str = "gradesheet-sheet-v1";
const ARCHIVE_VERSION: u32 = 1;
const MANIFEST_ENTRY: &str = "manifest.json";
const ROWS_ENTRY: &str = "rows.json";
const SUBMISSIONS_ENTRY: &str = "submissions.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    format: String,
    version: u32,
    app_version: String,
    exported_at: String,
    sheet: SheetKey,
    row_count: usize,
    submission_count: usize,
    rows_sha256: String,
    submissions_sha256: String,
}

/// The stored state of one sheet: every grade row under its key and every
/// submission record, as read back from an archive.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetArchive {
    pub key: SheetKey,
    pub exported_at: String,
    pub rows: Vec<ScoreRow>,
    pub submissions: Vec<SubmissionRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub format: &'static str,
    pub row_count: usize,
    pub submission_count: usize,
    pub rows_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub rows_imported: usize,
    pub submissions_imported: usize,
    /// Rows whose student or subject is not on this workspace's roster.
    /// They are stored but no sheet shows them.
    pub off_roster_rows: usize,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Writes the persisted rows and submissions of `key` to a zip archive.
pub fn export_sheet_archive(
    store: &SqliteStore<'_>,
    key: &SheetKey,
    out_path: &Path,
    now: DateTime<Utc>,
) -> anyhow::Result<ExportSummary> {
    let rows = store.fetch(key).context("read grade rows")?;
    let submissions = store.submissions_for(key).context("read submissions")?;

    let rows_json = serde_json::to_vec_pretty(&rows)?;
    let submissions_json = serde_json::to_vec_pretty(&submissions)?;
    let manifest = Manifest {
        format: ARCHIVE_FORMAT.to_string(),
        version: ARCHIVE_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        exported_at: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        sheet: key.clone(),
        row_count: rows.len(),
        submission_count: submissions.len(),
        rows_sha256: sha256_hex(&rows_json),
        submissions_sha256: sha256_hex(&submissions_json),
    };

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.to_string_lossy()))?;
    }
    let file = File::create(out_path)
        .with_context(|| format!("create {}", out_path.to_string_lossy()))?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, bytes) in [
        (MANIFEST_ENTRY, serde_json::to_vec_pretty(&manifest)?),
        (ROWS_ENTRY, rows_json),
        (SUBMISSIONS_ENTRY, submissions_json),
    ] {
        zip.start_file(name, options)?;
        zip.write_all(&bytes)?;
    }
    zip.finish()?;

    Ok(ExportSummary {
        format: ARCHIVE_FORMAT,
        row_count: manifest.row_count,
        submission_count: manifest.submission_count,
        rows_sha256: manifest.rows_sha256,
    })
}

fn read_entry(zip: &mut ZipArchive<File>, name: &str) -> anyhow::Result<Vec<u8>> {
    let mut entry = zip
        .by_name(name)
        .with_context(|| format!("archive missing {}", name))?;
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Reads and verifies an archive. Checksums, counts and the sheet key of
/// every row and record must agree with the manifest.
pub fn read_sheet_archive(path: &Path) -> anyhow::Result<SheetArchive> {
    let file = File::open(path).with_context(|| format!("open {}", path.to_string_lossy()))?;
    let mut zip = ZipArchive::new(file).context("not a sheet archive")?;

    let manifest: Manifest = serde_json::from_slice(&read_entry(&mut zip, MANIFEST_ENTRY)?)
        .context("parse manifest")?;
    if manifest.format != ARCHIVE_FORMAT || manifest.version != ARCHIVE_VERSION {
        bail!(
            "unsupported archive format {} v{}",
            manifest.format,
            manifest.version
        );
    }

    let rows_json = read_entry(&mut zip, ROWS_ENTRY)?;
    if sha256_hex(&rows_json) != manifest.rows_sha256 {
        bail!("{} checksum mismatch", ROWS_ENTRY);
    }
    let submissions_json = read_entry(&mut zip, SUBMISSIONS_ENTRY)?;
    if sha256_hex(&submissions_json) != manifest.submissions_sha256 {
        bail!("{} checksum mismatch", SUBMISSIONS_ENTRY);
    }

    let rows: Vec<ScoreRow> = serde_json::from_slice(&rows_json).context("parse rows")?;
    let submissions: Vec<SubmissionRecord> =
        serde_json::from_slice(&submissions_json).context("parse submissions")?;
    if rows.len() != manifest.row_count || submissions.len() != manifest.submission_count {
        bail!("archive entry counts do not match the manifest");
    }

    let key = manifest.sheet;
    if let Some(row) = rows.iter().find(|r| !row_matches(r, &key)) {
        return Err(anyhow!(
            "row for student {} belongs to another sheet",
            row.student_id
        ));
    }
    if submissions.iter().any(|s| s.key != key) {
        bail!("submission record belongs to another sheet");
    }

    Ok(SheetArchive {
        key,
        exported_at: manifest.exported_at,
        rows,
        submissions,
    })
}

fn row_matches(row: &ScoreRow, key: &SheetKey) -> bool {
    row.school_id == key.school_id
        && row.class_id == key.class_id
        && row.term == key.term
        && row.exam_type == key.exam_type
        && row.academic_year == key.academic_year
}

/// Restores an archive into this workspace's database in one transaction.
///
/// The class must exist here. An approved submission is never overwritten.
pub fn import_sheet_archive(
    conn: &Connection,
    archive: &SheetArchive,
) -> Result<ImportSummary, GradeError> {
    let key = &archive.key;
    let class: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM classes WHERE id = ? AND school_id = ?",
            (&key.class_id, &key.school_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(StoreError::from)?;
    if class.is_none() {
        return Err(GradeError::not_found(format!(
            "class {} does not exist in this workspace",
            key.class_id
        )));
    }

    let store = SqliteStore::new(conn);
    for record in &archive.submissions {
        let current = store.fetch_submission(key, &record.actor_id)?;
        if current.is_some_and(|c| c.status == SubmissionStatus::Approved) {
            return Err(GradeError::validation(format!(
                "submission from {} is already approved",
                record.actor_id
            )));
        }
    }

    let students = store.students(&key.school_id, &key.class_id)?;
    let subjects = store.subjects(&key.school_id, &key.class_id, None)?;
    let off_roster_rows = archive
        .rows
        .iter()
        .filter(|r| {
            !students.iter().any(|s| s.id == r.student_id)
                || !subjects.iter().any(|s| s.id == r.subject_id)
        })
        .count();

    let (rows_imported, submissions_imported) =
        store.import_batch(&archive.rows, &archive.submissions)?;
    Ok(ImportSummary {
        rows_imported,
        submissions_imported,
        off_roster_rows,
    })
}
