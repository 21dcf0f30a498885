//! Demo dataset. It seeds new workspaces on request and backs the read-only
//! fallback store used while no workspace is open.

use crate::db;
use rusqlite::Connection;
use serde_json::json;

pub const JURUSAN_RPL: &str = "jur-rpl";
pub const JURUSAN_TKJ: &str = "jur-tkj";

pub const STUDENT_ANDI: &str = "stu-andi";
pub const STUDENT_SITI: &str = "stu-siti";
pub const STUDENT_BUDI: &str = "stu-budi";

pub const USER_WALAS_RPL: &str = "usr-walas-rpl";
pub const USER_PRODUKTIF_RPL: &str = "usr-produktif-rpl";
pub const USER_HOD_RPL: &str = "usr-hod-rpl";
pub const USER_WALAS_TKJ: &str = "usr-walas-tkj";
pub const USER_PRODUKTIF_TKJ: &str = "usr-produktif-tkj";
pub const USER_HOD_TKJ: &str = "usr-hod-tkj";

const CREATED_AT: &str = "2026-07-13T07:00:00Z";

/// Builds the in-memory fallback store: workspace schema plus the demo rows.
pub fn open_fallback() -> anyhow::Result<Connection> {
    let conn = db::open_in_memory()?;
    seed_demo(&conn)?;
    Ok(conn)
}

/// Loads the demo dataset. Does nothing (and returns false) when the store
/// already has students.
pub fn seed_demo(conn: &Connection) -> anyhow::Result<bool> {
    let existing: i64 = conn.query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0))?;
    if existing > 0 {
        return Ok(false);
    }

    let tx = conn.unchecked_transaction()?;

    for (id, code, name, walas) in [
        (JURUSAN_RPL, "RPL", "Rekayasa Perangkat Lunak", 0),
        (JURUSAN_TKJ, "TKJ", "Teknik Komputer dan Jaringan", 1),
    ] {
        tx.execute(
            "INSERT INTO departments(id, code, name, require_walas_review) VALUES(?, ?, ?, ?)",
            (id, code, name, walas),
        )?;
    }

    let levels = [
        ("lvl-1", 1, "Pemula", 0.0, 40.0, "#9e9e9e", "seedling", "Mengenal dasar kompetensi"),
        ("lvl-2", 2, "Terampil", 41.0, 75.0, "#1e88e5", "hammer", "Mampu bekerja dengan bimbingan"),
        ("lvl-3", 3, "Mahir", 76.0, 100.0, "#f9a825", "star", "Mampu bekerja mandiri"),
    ];
    for (id, rank, name, min, max, color, icon, desc) in levels {
        tx.execute(
            "INSERT INTO levels(id, rank, name, min_score, max_score, badge_color, badge_icon, description)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (id, rank, name, min, max, color, icon, desc),
        )?;
    }

    let criteria: [(&str, Option<&str>, &[&str]); 4] = [
        (
            "lvl-1",
            None,
            &[
                "Menerapkan K3 di ruang praktik",
                "Menggunakan peralatan dasar sesuai prosedur",
            ],
        ),
        (
            "lvl-2",
            None,
            &[
                "Menyelesaikan tugas praktik dengan bimbingan",
                "Mendokumentasikan hasil kerja",
            ],
        ),
        (
            "lvl-3",
            None,
            &[
                "Menyelesaikan proyek secara mandiri",
                "Membimbing rekan dalam praktik",
            ],
        ),
        (
            "lvl-3",
            Some(JURUSAN_TKJ),
            &[
                "Merancang topologi jaringan sekolah",
                "Melakukan troubleshooting jaringan secara mandiri",
            ],
        ),
    ];
    let mut n = 0;
    for (level_id, jurusan, texts) in criteria {
        for (i, text) in texts.iter().enumerate() {
            n += 1;
            tx.execute(
                "INSERT INTO level_criteria(id, level_id, jurusan_id, sort_order, text)
                 VALUES(?, ?, ?, ?, ?)",
                (format!("crit-{n}"), level_id, jurusan, i as i64, text),
            )?;
        }
    }

    let users = [
        (USER_WALAS_RPL, "walas.rpl", "Ibu Rina Marlina", "walas", JURUSAN_RPL, Some("XI RPL 1")),
        (USER_PRODUKTIF_RPL, "produktif.rpl", "Pak Dedi Kurniawan", "produktif", JURUSAN_RPL, None),
        (USER_HOD_RPL, "kaprog.rpl", "Pak Agus Setiawan", "hod", JURUSAN_RPL, None),
        (USER_WALAS_TKJ, "walas.tkj", "Ibu Wulan Sari", "walas", JURUSAN_TKJ, Some("XI TKJ 1")),
        (USER_PRODUKTIF_TKJ, "produktif.tkj", "Pak Yusuf Hidayat", "produktif", JURUSAN_TKJ, None),
        (USER_HOD_TKJ, "kaprog.tkj", "Ibu Maya Lestari", "hod", JURUSAN_TKJ, None),
    ];
    for (id, username, display, role, jurusan, class_name) in users {
        tx.execute(
            "INSERT INTO users(id, username, display_name, role, jurusan_id, class_name)
             VALUES(?, ?, ?, ?, ?, ?)",
            (id, username, display, role, jurusan, class_name),
        )?;
    }

    let students = [
        (STUDENT_ANDI, "2223001", "0061234501", "Andi Pratama", "XI RPL 1", JURUSAN_RPL, 0.0, 0),
        (STUDENT_SITI, "2223002", "0061234502", "Siti Rahmawati", "XI RPL 1", JURUSAN_RPL, 62.0, 120),
        (STUDENT_BUDI, "2223101", "0061234503", "Budi Santoso", "XI TKJ 1", JURUSAN_TKJ, 80.0, 40),
    ];
    for (id, nis, nisn, name, class_name, jurusan, score, points) in students {
        tx.execute(
            "INSERT INTO students(id, nis, nisn, name, class_name, jurusan_id, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (id, nis, nisn, name, class_name, jurusan, CREATED_AT),
        )?;
        let rank = match score {
            s if s >= 76.0 => 3,
            s if s >= 41.0 => 2,
            _ => 1,
        };
        tx.execute(
            "INSERT INTO skill_records(id, student_id, score, points, level_rank, updated_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (format!("skill-{id}"), id, score, points, rank, CREATED_AT),
        )?;
    }

    let history = [
        ("hist-siti-1", STUDENT_SITI, "Membuat basis data relasional", 2, "Lulus", "2026-08-21", "Normalisasi tepat"),
        ("hist-siti-2", STUDENT_SITI, "Membuat antarmuka web responsif", 2, "Tidak Lulus", "2026-09-04", "Layout belum responsif"),
        ("hist-budi-1", STUDENT_BUDI, "Instalasi jaringan LAN", 3, "Lulus", "2026-09-11", ""),
    ];
    for (id, student, unit, rank, hasil, on, notes) in history {
        let assessor = if student == STUDENT_BUDI {
            (USER_PRODUKTIF_TKJ, "Pak Yusuf Hidayat")
        } else {
            (USER_PRODUKTIF_RPL, "Pak Dedi Kurniawan")
        };
        tx.execute(
            "INSERT INTO competency_history(
               id, student_id, unit_name, level_rank, assessor_id, assessor_name,
               hasil, assessed_on, notes, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![id, student, unit, rank, assessor.0, assessor.1, hasil, on, notes, CREATED_AT],
        )?;
    }

    for (student, hadir, izin, sakit, alpa) in [(STUDENT_ANDI, 92, 3, 2, 1), (STUDENT_SITI, 96, 1, 1, 0)] {
        tx.execute(
            "INSERT INTO discipline_records(student_id, hadir, izin, sakit, alpa, updated_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (student, hadir, izin, sakit, alpa, CREATED_AT),
        )?;
    }
    for (student, aspect, score, order) in [
        (STUDENT_ANDI, "Kedisiplinan", 82.0, 0),
        (STUDENT_ANDI, "Tanggung jawab", 78.0, 1),
        (STUDENT_SITI, "Kedisiplinan", 90.0, 0),
        (STUDENT_SITI, "Tanggung jawab", 88.0, 1),
    ] {
        tx.execute(
            "INSERT INTO attitude_scores(student_id, aspect, score, sort_order) VALUES(?, ?, ?, ?)",
            (student, aspect, score, order),
        )?;
    }

    for (key, value) in [
        ("school.name", json!("SMK Negeri 1 Nusantara")),
        ("school.address", json!("Jl. Pendidikan No. 1")),
        ("school.city", json!("Bandung")),
        ("school.principal", json!("Dra. Sri Wahyuni, M.Pd.")),
    ] {
        db::settings_set_json(&tx, key, &value)?;
    }

    tx.commit()?;
    tracing::info!("demo dataset loaded");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::levels;

    #[test]
    fn seed_is_idempotent() {
        let conn = db::open_in_memory().expect("db");
        assert!(seed_demo(&conn).expect("seed"));
        assert!(!seed_demo(&conn).expect("reseed"));
        let students: i64 = conn
            .query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0))
            .expect("count");
        assert_eq!(students, 3);
    }

    #[test]
    fn demo_catalog_is_well_formed_and_ranks_match() {
        let conn = open_fallback().expect("fallback");
        let catalog = levels::catalog_for_department(&conn, None).expect("catalog");
        levels::validate_catalog(&catalog).expect("valid");

        let mut stmt = conn
            .prepare("SELECT score, level_rank FROM skill_records")
            .expect("prepare");
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, f64>(0)?, r.get::<_, i64>(1)?)))
            .expect("query")
            .collect::<Result<Vec<_>, _>>()
            .expect("rows");
        for (score, rank) in rows {
            assert_eq!(levels::resolve_level(&catalog, score).rank, rank);
        }
    }
}
