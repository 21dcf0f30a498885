use crate::db;
use crate::error::DomainResult;
use crate::roster;
use rusqlite::Connection;
use serde::Serialize;
use uuid::Uuid;

/// Something other parts of the app may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    KrsSubmitted {
        krs_id: String,
        student_id: String,
        student_name: String,
        jurusan_id: String,
    },
    KrsAdvanced {
        krs_id: String,
        student_id: String,
        jurusan_id: String,
        class_name: String,
        new_status: String,
    },
    KrsRejected {
        krs_id: String,
        student_id: String,
        reason: String,
    },
    KrsScheduled {
        krs_id: String,
        student_id: String,
        exam_date: String,
    },
    KrsCompleted {
        krs_id: String,
        student_id: String,
        final_score: f64,
        passed_items: usize,
        total_items: usize,
    },
    LevelChanged {
        student_id: String,
        from_rank: i64,
        to_rank: i64,
        level_name: String,
    },
}

pub trait EventSink {
    fn name(&self) -> &'static str;
    fn handle(&self, conn: &Connection, event: &WorkflowEvent) -> DomainResult<()>;
}

/// Fan-out of workflow events to the subscribers registered on it.
#[derive(Default)]
pub struct EventBus {
    sinks: Vec<Box<dyn EventSink>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bus the daemon runs with: notifications only.
    pub fn with_notifications() -> Self {
        let mut bus = Self::new();
        bus.subscribe(Box::new(NotificationSink));
        bus
    }

    pub fn subscribe(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// Delivers to every sink. The triggering write has already happened, so
    /// sink failures are logged and never undo it.
    pub fn publish(&self, conn: &Connection, event: &WorkflowEvent) {
        for sink in &self.sinks {
            if let Err(e) = sink.handle(conn, event) {
                tracing::warn!(sink = sink.name(), error = %e, "event sink failed");
            }
        }
    }
}

/// Writes user-facing notification rows.
pub struct NotificationSink;

impl EventSink for NotificationSink {
    fn name(&self) -> &'static str {
        "notifications"
    }

    fn handle(&self, conn: &Connection, event: &WorkflowEvent) -> DomainResult<()> {
        match event {
            WorkflowEvent::KrsSubmitted {
                krs_id,
                student_id,
                student_name,
                jurusan_id,
            } => {
                insert(
                    conn,
                    ("student", student_id),
                    "KRS terkirim",
                    "Pengajuan uji kompetensi menunggu persetujuan guru produktif.",
                    Some(krs_id.as_str()),
                )?;
                for user in roster::staff_with_role(conn, "produktif", jurusan_id, None)? {
                    insert(
                        conn,
                        ("user", &user.id),
                        "KRS baru",
                        &format!("{student_name} mengajukan uji kompetensi."),
                        Some(krs_id.as_str()),
                    )?;
                }
            }
            WorkflowEvent::KrsAdvanced {
                krs_id,
                student_id,
                jurusan_id,
                class_name,
                new_status,
            } => {
                insert(
                    conn,
                    ("student", student_id),
                    "KRS disetujui",
                    &format!("Status pengajuan sekarang {new_status}."),
                    Some(krs_id.as_str()),
                )?;
                let next_reviewers = match new_status.as_str() {
                    "pending_walas" => {
                        roster::staff_with_role(conn, "walas", jurusan_id, Some(class_name.as_str()))?
                    }
                    "pending_hod" | "approved" => {
                        roster::staff_with_role(conn, "hod", jurusan_id, None)?
                    }
                    _ => Vec::new(),
                };
                for user in next_reviewers {
                    insert(
                        conn,
                        ("user", &user.id),
                        "KRS menunggu tindakan",
                        &format!("Pengajuan {krs_id} berstatus {new_status}."),
                        Some(krs_id.as_str()),
                    )?;
                }
            }
            WorkflowEvent::KrsRejected {
                krs_id,
                student_id,
                reason,
            } => {
                insert(
                    conn,
                    ("student", student_id),
                    "KRS ditolak",
                    &format!("Alasan: {reason}"),
                    Some(krs_id.as_str()),
                )?;
            }
            WorkflowEvent::KrsScheduled {
                krs_id,
                student_id,
                exam_date,
            } => {
                insert(
                    conn,
                    ("student", student_id),
                    "Jadwal uji kompetensi",
                    &format!("Ujian dijadwalkan pada {exam_date}."),
                    Some(krs_id.as_str()),
                )?;
            }
            WorkflowEvent::KrsCompleted {
                krs_id,
                student_id,
                final_score,
                passed_items,
                total_items,
            } => {
                insert(
                    conn,
                    ("student", student_id),
                    "Uji kompetensi selesai",
                    &format!(
                        "Nilai akhir {final_score}; {passed_items} dari {total_items} unit lulus."
                    ),
                    Some(krs_id.as_str()),
                )?;
            }
            WorkflowEvent::LevelChanged {
                student_id,
                from_rank,
                to_rank,
                level_name,
            } => {
                insert(
                    conn,
                    ("student", student_id),
                    "Level berubah",
                    &format!("Level {from_rank} ke {to_rank} ({level_name})."),
                    None,
                )?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub body: String,
    pub krs_id: Option<String>,
    pub created_at: String,
    pub read: bool,
}

fn insert(
    conn: &Connection,
    recipient: (&str, &str),
    title: &str,
    body: &str,
    krs_id: Option<&str>,
) -> DomainResult<()> {
    conn.execute(
        "INSERT INTO notifications(id, recipient_kind, recipient_id, title, body, krs_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            recipient.0,
            recipient.1,
            title,
            body,
            krs_id,
            db::now_rfc3339(),
        ),
    )?;
    Ok(())
}

pub fn list_notifications(
    conn: &Connection,
    recipient: (&str, &str),
    unread_only: bool,
) -> DomainResult<Vec<Notification>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, body, krs_id, created_at, read_at
         FROM notifications
         WHERE recipient_kind = ? AND recipient_id = ? AND (? = 0 OR read_at IS NULL)
         ORDER BY created_at DESC, rowid DESC",
    )?;
    let rows = stmt
        .query_map((recipient.0, recipient.1, unread_only as i64), |r| {
            Ok(Notification {
                id: r.get(0)?,
                title: r.get(1)?,
                body: r.get(2)?,
                krs_id: r.get(3)?,
                created_at: r.get(4)?,
                read: r.get::<_, Option<String>>(5)?.is_some(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Marks one notification (or all of the recipient's) as read; returns the
/// number of rows touched.
pub fn mark_read(
    conn: &Connection,
    recipient: (&str, &str),
    notification_id: Option<&str>,
) -> DomainResult<usize> {
    let n = conn.execute(
        "UPDATE notifications SET read_at = ?
         WHERE recipient_kind = ? AND recipient_id = ? AND read_at IS NULL
           AND (? IS NULL OR id = ?)",
        (
            db::now_rfc3339(),
            recipient.0,
            recipient.1,
            notification_id,
            notification_id,
        ),
    )?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recorder(Rc<RefCell<Vec<WorkflowEvent>>>);

    impl EventSink for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }
        fn handle(&self, _conn: &Connection, event: &WorkflowEvent) -> DomainResult<()> {
            self.0.borrow_mut().push(event.clone());
            Ok(())
        }
    }

    #[test]
    fn bus_delivers_to_every_subscriber() {
        let conn = db::open_in_memory().expect("db");
        seed::seed_demo(&conn).expect("seed");
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut bus = EventBus::with_notifications();
        bus.subscribe(Box::new(Recorder(seen.clone())));

        let ev = WorkflowEvent::KrsSubmitted {
            krs_id: "krs-1".into(),
            student_id: seed::STUDENT_ANDI.into(),
            student_name: "Andi".into(),
            jurusan_id: seed::JURUSAN_RPL.into(),
        };
        bus.publish(&conn, &ev);

        assert_eq!(seen.borrow().as_slice(), &[ev]);
        let student_inbox =
            list_notifications(&conn, ("student", seed::STUDENT_ANDI), false).expect("list");
        assert_eq!(student_inbox.len(), 1);
        let reviewer_inbox =
            list_notifications(&conn, ("user", seed::USER_PRODUKTIF_RPL), true).expect("list");
        assert_eq!(reviewer_inbox.len(), 1);
    }

    #[test]
    fn mark_read_scopes_to_recipient() {
        let conn = db::open_in_memory().expect("db");
        seed::seed_demo(&conn).expect("seed");
        let bus = EventBus::with_notifications();
        bus.publish(
            &conn,
            &WorkflowEvent::KrsRejected {
                krs_id: "krs-1".into(),
                student_id: seed::STUDENT_ANDI.into(),
                reason: "berkas kurang".into(),
            },
        );
        assert_eq!(mark_read(&conn, ("student", seed::STUDENT_SITI), None).expect("mark"), 0);
        assert_eq!(mark_read(&conn, ("student", seed::STUDENT_ANDI), None).expect("mark"), 1);
        let unread = list_notifications(&conn, ("student", seed::STUDENT_ANDI), true).expect("list");
        assert!(unread.is_empty());
    }
}
