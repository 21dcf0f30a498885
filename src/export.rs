use crate::db;
use crate::error::{DomainError, DomainResult};
use crate::krs::KrsStatus;
use crate::ledger::{self, HistoryEntry};
use crate::levels;
use crate::roster::{self, StudentFilter, StudentOverview};
use anyhow::Context;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const SPREADSHEET_FORMAT: &str = "skillpass-rekap-v1";
pub const STUDENTS_SHEET: &str = "siswa.csv";
pub const SUMMARY_SHEET: &str = "ringkasan.csv";
pub const MANIFEST_ENTRY: &str = "manifest.json";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    pub role: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateModel {
    pub layout: serde_json::Value,
    pub certificate_number: String,
    pub school: serde_json::Value,
    pub recipient: serde_json::Value,
    pub competency: String,
    pub competency_description: String,
    pub level_rank: i64,
    pub level_name: String,
    pub issued_on: String,
    pub issued_at_city: String,
    pub signatures: Vec<Signature>,
}

/// Everything the certificate renderer needs for one passed history entry.
/// Non-pass entries are refused outright.
pub fn certificate_model(conn: &Connection, entry: &HistoryEntry) -> DomainResult<CertificateModel> {
    if !entry.certificate_eligible() {
        return Err(DomainError::NotEligible(format!(
            "entry {} has outcome {:?}; certificates need {}",
            entry.id,
            entry.hasil,
            ledger::PASS
        )));
    }
    let student = roster::get_student(conn, &entry.student_id)?;
    let dept = roster::get_department(conn, &student.jurusan_id)?;
    let catalog = levels::catalog_for_department(conn, Some(dept.id.as_str()))?;
    let level_name = catalog
        .iter()
        .find(|l| l.rank == entry.level_rank)
        .map(|l| l.name.clone())
        .unwrap_or_else(|| format!("Level {}", entry.level_rank));
    let head = roster::staff_with_role(conn, "hod", &dept.id, None)?
        .into_iter()
        .next()
        .map(|u| u.display_name)
        .unwrap_or_default();

    let year = entry.assessed_on.get(0..4).unwrap_or("0000");
    let short_id: String = entry.id.chars().filter(|c| c.is_ascii_alphanumeric()).take(8).collect();

    Ok(CertificateModel {
        layout: json!({
            "orientation": "landscape",
            "pageSize": "letter",
            "pages": 1
        }),
        certificate_number: format!("SP/{}/{}/{}", dept.code, year, short_id.to_uppercase()),
        school: json!({
            "name": db::settings_get_string(conn, "school.name", ""),
            "address": db::settings_get_string(conn, "school.address", ""),
        }),
        recipient: json!({
            "name": student.name,
            "nis": student.nis,
            "className": student.class_name,
            "department": dept.name,
        }),
        competency: entry.unit_name.clone(),
        competency_description: entry.unit_description.clone(),
        level_rank: entry.level_rank,
        level_name,
        issued_on: entry.assessed_on.clone(),
        issued_at_city: db::settings_get_string(conn, "school.city", ""),
        signatures: vec![
            Signature {
                role: "Ketua Program Keahlian".to_string(),
                name: head,
            },
            Signature {
                role: "Kepala Sekolah".to_string(),
                name: db::settings_get_string(conn, "school.principal", ""),
            },
        ],
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetSummary {
    pub name: String,
    pub rows: usize,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpreadsheetExport {
    pub path: String,
    pub format: String,
    pub sheets: Vec<SheetSummary>,
}

pub fn students_sheet(rows: &[StudentOverview]) -> anyhow::Result<Vec<u8>> {
    let mut w = csv::Writer::from_writer(Vec::new());
    w.write_record([
        "nis",
        "nama",
        "kelas",
        "jurusan",
        "skor",
        "poin",
        "level",
        "nama_level",
        "hadir",
        "izin",
        "sakit",
        "alpa",
        "persen_kehadiran",
        "rata_sikap",
        "unit_diuji",
        "unit_lulus",
        "status_krs",
    ])?;
    for r in rows {
        w.write_record([
            r.student.nis.clone(),
            r.student.name.clone(),
            r.student.class_name.clone(),
            r.jurusan_name.clone(),
            format_num(r.skill.score),
            r.skill.points.to_string(),
            r.level.rank.to_string(),
            r.level.name.clone(),
            r.discipline.hadir.to_string(),
            r.discipline.izin.to_string(),
            r.discipline.sakit.to_string(),
            r.discipline.alpa.to_string(),
            format_num(r.discipline.percentage),
            r.attitude_average.map(format_num).unwrap_or_default(),
            r.history_count.to_string(),
            r.passed_count.to_string(),
            r.latest_krs_status.clone().unwrap_or_default(),
        ])?;
    }
    w.into_inner()
        .map_err(|e| anyhow::anyhow!("failed to finish students sheet: {e}"))
}

/// Metric/value pairs over the exported students.
pub fn summary_rows(rows: &[StudentOverview]) -> Vec<(String, String)> {
    let mut out = vec![
        ("jumlah_siswa".to_string(), rows.len().to_string()),
        (
            "rata_skor".to_string(),
            format_num(mean(rows, |r| r.skill.score)),
        ),
        (
            "rata_kehadiran".to_string(),
            format_num(mean(rows, |r| r.discipline.percentage)),
        ),
    ];

    let mut per_level: BTreeMap<(i64, String), usize> = BTreeMap::new();
    for r in rows {
        *per_level.entry((r.level.rank, r.level.name.clone())).or_default() += 1;
    }
    for ((rank, name), count) in per_level {
        out.push((format!("level_{rank}_{}", name.to_lowercase()), count.to_string()));
    }

    let active = rows
        .iter()
        .filter(|r| {
            r.latest_krs_status
                .as_deref()
                .and_then(KrsStatus::parse)
                .map(|s| !s.is_terminal())
                .unwrap_or(false)
        })
        .count();
    let completed = rows
        .iter()
        .filter(|r| r.latest_krs_status.as_deref() == Some(KrsStatus::Completed.as_str()))
        .count();
    out.push(("krs_aktif".to_string(), active.to_string()));
    out.push(("krs_selesai".to_string(), completed.to_string()));
    out.push((
        "unit_lulus".to_string(),
        rows.iter().map(|r| r.passed_count).sum::<i64>().to_string(),
    ));
    out
}

pub fn summary_sheet(rows: &[StudentOverview]) -> anyhow::Result<Vec<u8>> {
    let mut w = csv::Writer::from_writer(Vec::new());
    w.write_record(["metrik", "nilai"])?;
    for (k, v) in summary_rows(rows) {
        w.write_record([k, v])?;
    }
    w.into_inner()
        .map_err(|e| anyhow::anyhow!("failed to finish summary sheet: {e}"))
}

fn mean(rows: &[StudentOverview], f: impl Fn(&StudentOverview) -> f64) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    roster::round_1(rows.iter().map(f).sum::<f64>() / rows.len() as f64)
}

fn format_num(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{:.0}", v)
    } else {
        format!("{:.1}", v)
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Writes the two-sheet export (plus manifest) as a zip at `out_path`.
pub fn export_spreadsheet(
    conn: &Connection,
    filter: &StudentFilter,
    out_path: &Path,
) -> anyhow::Result<SpreadsheetExport> {
    let rows = roster::overview(conn, filter).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let students = students_sheet(&rows)?;
    let summary = summary_sheet(&rows)?;

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let sheets = vec![
        SheetSummary {
            name: STUDENTS_SHEET.to_string(),
            rows: rows.len(),
            sha256: sha256_hex(&students),
        },
        SheetSummary {
            name: SUMMARY_SHEET.to_string(),
            rows: summary_rows(&rows).len(),
            sha256: sha256_hex(&summary),
        },
    ];
    for (name, bytes) in [(STUDENTS_SHEET, &students), (SUMMARY_SHEET, &summary)] {
        zip.start_file(name, opts)
            .with_context(|| format!("failed to start {name} entry"))?;
        zip.write_all(bytes)
            .with_context(|| format!("failed to write {name} entry"))?;
    }

    let manifest = json!({
        "format": SPREADSHEET_FORMAT,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": db::now_rfc3339(),
        "filters": {
            "jurusanId": filter.jurusan_id,
            "className": filter.class_name,
        },
        "sheets": sheets,
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;
    zip.finish().context("failed to finalize export zip")?;

    Ok(SpreadsheetExport {
        path: out_path.to_string_lossy().to_string(),
        format: SPREADSHEET_FORMAT.to_string(),
        sheets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed;

    fn seeded() -> Connection {
        let conn = db::open_in_memory().expect("db");
        seed::seed_demo(&conn).expect("seed");
        conn
    }

    #[test]
    fn certificate_refuses_non_pass_entries() {
        let conn = seeded();
        let failed = ledger::get(&conn, "hist-siti-2").expect("entry");
        assert!(matches!(
            certificate_model(&conn, &failed),
            Err(DomainError::NotEligible(_))
        ));
    }

    #[test]
    fn certificate_model_carries_recipient_and_signatures() {
        let conn = seeded();
        let passed = ledger::get(&conn, "hist-budi-1").expect("entry");
        let model = certificate_model(&conn, &passed).expect("model");
        assert_eq!(model.level_name, "Mahir");
        assert_eq!(model.recipient["nis"], "2223101");
        assert_eq!(model.recipient["department"], "Teknik Komputer dan Jaringan");
        assert_eq!(model.signatures.len(), 2);
        assert_eq!(model.signatures[0].name, "Ibu Maya Lestari");
        assert_eq!(model.layout["orientation"], "landscape");
        assert!(model.certificate_number.starts_with("SP/TKJ/2026/"));
    }

    #[test]
    fn summary_counts_levels_and_krs() {
        let conn = seeded();
        let rows = roster::overview(&conn, &StudentFilter::default()).expect("overview");
        let summary: BTreeMap<String, String> = summary_rows(&rows).into_iter().collect();
        assert_eq!(summary["jumlah_siswa"], "3");
        assert_eq!(summary["level_1_pemula"], "1");
        assert_eq!(summary["level_2_terampil"], "1");
        assert_eq!(summary["level_3_mahir"], "1");
        assert_eq!(summary["krs_aktif"], "0");
        assert_eq!(summary["unit_lulus"], "2");
    }

    #[test]
    fn students_sheet_has_header_and_one_row_per_student() {
        let conn = seeded();
        let rows = roster::overview(&conn, &StudentFilter::default()).expect("overview");
        let bytes = students_sheet(&rows).expect("sheet");
        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let headers = reader.headers().expect("headers").clone();
        assert_eq!(headers.get(0), Some("nis"));
        let records = reader
            .records()
            .collect::<Result<Vec<_>, _>>()
            .expect("records");
        assert_eq!(records.len(), 3);
    }
}
