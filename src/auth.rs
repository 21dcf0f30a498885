use crate::error::{DomainError, DomainResult};
use crate::roster::{self, Student};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Walas,
    Produktif,
    Hod,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Walas => "walas",
            Role::Produktif => "produktif",
            Role::Hod => "hod",
        }
    }

    /// Accepts the stored role names plus the labels the login form uses.
    pub fn parse(raw: &str) -> Option<Role> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "student" | "siswa" => Some(Role::Student),
            "walas" | "wali_kelas" | "homeroom" => Some(Role::Walas),
            "produktif" | "guru_produktif" | "teacher" => Some(Role::Produktif),
            "hod" | "kaprog" | "kajur" => Some(Role::Hod),
            _ => None,
        }
    }
}

/// The authenticated party behind a request, one shape per role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Actor {
    #[serde(rename_all = "camelCase")]
    Student {
        student_id: String,
        name: String,
        class_name: String,
        jurusan_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Walas {
        user_id: String,
        name: String,
        class_name: String,
        jurusan_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Produktif {
        user_id: String,
        name: String,
        jurusan_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Hod {
        user_id: String,
        name: String,
        jurusan_id: String,
    },
}

impl Actor {
    pub fn role(&self) -> Role {
        match self {
            Actor::Student { .. } => Role::Student,
            Actor::Walas { .. } => Role::Walas,
            Actor::Produktif { .. } => Role::Produktif,
            Actor::Hod { .. } => Role::Hod,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Actor::Student { student_id, .. } => student_id,
            Actor::Walas { user_id, .. }
            | Actor::Produktif { user_id, .. }
            | Actor::Hod { user_id, .. } => user_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Actor::Student { name, .. }
            | Actor::Walas { name, .. }
            | Actor::Produktif { name, .. }
            | Actor::Hod { name, .. } => name,
        }
    }

    pub fn jurusan_id(&self) -> &str {
        match self {
            Actor::Student { jurusan_id, .. }
            | Actor::Walas { jurusan_id, .. }
            | Actor::Produktif { jurusan_id, .. }
            | Actor::Hod { jurusan_id, .. } => jurusan_id,
        }
    }

    /// Recipient key for notifications addressed to this actor.
    pub fn recipient(&self) -> (&'static str, &str) {
        match self {
            Actor::Student { student_id, .. } => ("student", student_id),
            _ => ("user", self.id()),
        }
    }

    pub fn is_staff(&self) -> bool {
        !matches!(self, Actor::Student { .. })
    }

    /// Whether this actor may read a student's records.
    pub fn can_view_student(&self, student: &Student) -> bool {
        match self {
            Actor::Student { student_id, .. } => *student_id == student.id,
            Actor::Walas { class_name, .. } => *class_name == student.class_name,
            Actor::Produktif { jurusan_id, .. } | Actor::Hod { jurusan_id, .. } => {
                *jurusan_id == student.jurusan_id
            }
        }
    }

    /// Homeroom teachers manage their own class; subject teachers and
    /// department heads manage their department.
    pub fn can_manage_student(&self, student: &Student) -> bool {
        match self {
            Actor::Student { .. } => false,
            Actor::Walas { class_name, .. } => *class_name == student.class_name,
            Actor::Produktif { jurusan_id, .. } | Actor::Hod { jurusan_id, .. } => {
                *jurusan_id == student.jurusan_id
            }
        }
    }

    /// Subject teachers and department heads may assess students of their department.
    pub fn can_assess(&self, student: &Student) -> bool {
        matches!(self, Actor::Produktif { .. } | Actor::Hod { .. })
            && self.jurusan_id() == student.jurusan_id
    }

    pub fn require_staff(&self) -> DomainResult<()> {
        if self.is_staff() {
            Ok(())
        } else {
            Err(DomainError::forbidden("staff only"))
        }
    }
}

/// Session state for one logged-in user. Clients keep it as an opaque blob
/// and hand it back through `auth.resume`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub actor: Actor,
    pub username: String,
    pub logged_in_at: String,
}

impl Session {
    pub fn to_blob(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_blob(blob: &str) -> DomainResult<Session> {
        serde_json::from_str(blob).map_err(|_| DomainError::bad_params("malformed session blob"))
    }
}

pub struct Credentials<'a> {
    pub username: &'a str,
    pub role: Role,
    pub password: &'a str,
}

/// Students log in with NIS and NISN; staff with their username and the shared
/// staff credential.
pub fn login(conn: &Connection, creds: &Credentials<'_>, staff_password: &str) -> DomainResult<Session> {
    let actor = match creds.role {
        Role::Student => {
            let student = roster::find_student_by_nis(conn, creds.username)?
                .ok_or(DomainError::Unauthenticated)?;
            if student.nisn.trim() != creds.password.trim() {
                return Err(DomainError::Unauthenticated);
            }
            student_actor(&student)
        }
        role => {
            let user = roster::find_staff_by_username(conn, creds.username)?
                .ok_or(DomainError::Unauthenticated)?;
            if Role::parse(&user.role) != Some(role) || creds.password != staff_password {
                return Err(DomainError::Unauthenticated);
            }
            staff_actor(&user)?
        }
    };
    Ok(Session {
        actor,
        username: creds.username.trim().to_string(),
        logged_in_at: crate::db::now_rfc3339(),
    })
}

/// Re-reads the actor behind a stored session so stale blobs pick up class or
/// department changes, and vanished accounts are refused.
pub fn resume(conn: &Connection, session: &Session) -> DomainResult<Session> {
    let actor = match &session.actor {
        Actor::Student { student_id, .. } => match roster::get_student(conn, student_id) {
            Ok(s) => student_actor(&s),
            Err(DomainError::NotFound(_)) => return Err(DomainError::Unauthenticated),
            Err(e) => return Err(e),
        },
        other => match roster::get_staff(conn, other.id()) {
            Ok(u) if Role::parse(&u.role) == Some(other.role()) => staff_actor(&u)?,
            Ok(_) | Err(DomainError::NotFound(_)) => return Err(DomainError::Unauthenticated),
            Err(e) => return Err(e),
        },
    };
    Ok(Session {
        actor,
        ..session.clone()
    })
}

pub fn student_actor(s: &Student) -> Actor {
    Actor::Student {
        student_id: s.id.clone(),
        name: s.name.clone(),
        class_name: s.class_name.clone(),
        jurusan_id: s.jurusan_id.clone(),
    }
}

fn staff_actor(u: &roster::StaffUser) -> DomainResult<Actor> {
    let role = Role::parse(&u.role)
        .ok_or_else(|| DomainError::bad_params(format!("unknown staff role {}", u.role)))?;
    Ok(match role {
        Role::Walas => Actor::Walas {
            user_id: u.id.clone(),
            name: u.display_name.clone(),
            class_name: u.class_name.clone().unwrap_or_default(),
            jurusan_id: u.jurusan_id.clone(),
        },
        Role::Produktif => Actor::Produktif {
            user_id: u.id.clone(),
            name: u.display_name.clone(),
            jurusan_id: u.jurusan_id.clone(),
        },
        Role::Hod => Actor::Hod {
            user_id: u.id.clone(),
            name: u.display_name.clone(),
            jurusan_id: u.jurusan_id.clone(),
        },
        Role::Student => return Err(DomainError::bad_params("staff account with student role")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, seed};

    fn seeded() -> Connection {
        let conn = db::open_in_memory().expect("db");
        seed::seed_demo(&conn).expect("seed");
        conn
    }

    #[test]
    fn student_logs_in_with_nis_and_nisn() {
        let conn = seeded();
        let session = login(
            &conn,
            &Credentials {
                username: "2223001",
                role: Role::Student,
                password: "0061234501",
            },
            "skillpass",
        )
        .expect("login");
        assert_eq!(session.actor.id(), seed::STUDENT_ANDI);
        assert_eq!(session.actor.role(), Role::Student);

        let wrong = login(
            &conn,
            &Credentials {
                username: "2223001",
                role: Role::Student,
                password: "skillpass",
            },
            "skillpass",
        );
        assert!(matches!(wrong, Err(DomainError::Unauthenticated)));
    }

    #[test]
    fn staff_role_must_match_account() {
        let conn = seeded();
        let ok = login(
            &conn,
            &Credentials {
                username: "kaprog.rpl",
                role: Role::Hod,
                password: "skillpass",
            },
            "skillpass",
        )
        .expect("login");
        assert!(matches!(ok.actor, Actor::Hod { .. }));

        let wrong_role = login(
            &conn,
            &Credentials {
                username: "kaprog.rpl",
                role: Role::Produktif,
                password: "skillpass",
            },
            "skillpass",
        );
        assert!(matches!(wrong_role, Err(DomainError::Unauthenticated)));
    }

    #[test]
    fn session_blob_roundtrips_and_resumes() {
        let conn = seeded();
        let session = login(
            &conn,
            &Credentials {
                username: "walas.rpl",
                role: Role::Walas,
                password: "skillpass",
            },
            "skillpass",
        )
        .expect("login");
        let parsed = Session::from_blob(&session.to_blob()).expect("parse");
        assert_eq!(parsed, session);
        assert_eq!(resume(&conn, &parsed).expect("resume"), session);
        assert!(Session::from_blob("{not json").is_err());
    }

    #[test]
    fn walas_manages_only_own_class() {
        let conn = seeded();
        let andi = roster::get_student(&conn, seed::STUDENT_ANDI).expect("andi");
        let budi = roster::get_student(&conn, seed::STUDENT_BUDI).expect("budi");
        let walas = Actor::Walas {
            user_id: "u".into(),
            name: "W".into(),
            class_name: andi.class_name.clone(),
            jurusan_id: andi.jurusan_id.clone(),
        };
        assert!(walas.can_manage_student(&andi));
        assert!(!walas.can_manage_student(&budi));
        assert!(!walas.can_assess(&andi));
    }

    #[test]
    fn walas_reads_only_own_class() {
        let conn = seeded();
        let andi = roster::get_student(&conn, seed::STUDENT_ANDI).expect("andi");
        let other_class = Actor::Walas {
            user_id: "u".into(),
            name: "W".into(),
            class_name: "XI RPL 2".into(),
            jurusan_id: andi.jurusan_id.clone(),
        };
        assert!(!other_class.can_view_student(&andi));

        let own_class = Actor::Walas {
            user_id: "u".into(),
            name: "W".into(),
            class_name: andi.class_name.clone(),
            jurusan_id: andi.jurusan_id.clone(),
        };
        assert!(own_class.can_view_student(&andi));
    }
}
