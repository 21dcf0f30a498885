use crate::error::{DomainError, DomainResult};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Level {
    pub id: String,
    pub rank: i64,
    pub name: String,
    pub min_score: f64,
    pub max_score: f64,
    pub badge_color: String,
    pub badge_icon: String,
    pub description: String,
    /// Expected learning outcomes, department override applied.
    pub criteria: Vec<String>,
}

impl Level {
    /// Stand-in returned when a catalog is empty, so lookups never come back empty-handed.
    pub fn placeholder() -> Self {
        Level {
            id: "level-default".to_string(),
            rank: 1,
            name: "Pemula".to_string(),
            min_score: 0.0,
            max_score: 100.0,
            badge_color: String::new(),
            badge_icon: String::new(),
            description: String::new(),
            criteria: Vec::new(),
        }
    }

    pub fn contains(&self, score: f64) -> bool {
        self.min_score <= score && score <= self.max_score
    }
}

/// Level whose inclusive `[min_score, max_score]` holds `score`.
///
/// Levels are checked in ascending rank order, so a score sitting on a shared
/// boundary resolves to the lower level. Scores in a gap, outside the catalog,
/// or NaN fall back to the lowest-rank level.
pub fn resolve_level(catalog: &[Level], score: f64) -> Level {
    let mut ordered: Vec<&Level> = catalog.iter().collect();
    ordered.sort_by_key(|l| l.rank);

    if score.is_finite() {
        if let Some(hit) = ordered.iter().find(|l| l.contains(score)) {
            return (*hit).clone();
        }
    }
    ordered
        .first()
        .map(|l| (*l).clone())
        .unwrap_or_else(Level::placeholder)
}

/// Checks ordering, range sanity, overlap and contiguity of a catalog.
///
/// Ranges are integer bins: the next level may start at most one point above
/// the previous maximum.
pub fn validate_catalog(catalog: &[Level]) -> DomainResult<()> {
    if catalog.is_empty() {
        return Err(DomainError::InvalidCatalog("catalog is empty".to_string()));
    }
    let mut seen_ranks: HashMap<i64, &str> = HashMap::new();
    for level in catalog {
        if !(level.min_score.is_finite() && level.max_score.is_finite()) {
            return Err(DomainError::InvalidCatalog(format!(
                "level {} has a non-finite range",
                level.name
            )));
        }
        if level.min_score > level.max_score {
            return Err(DomainError::InvalidCatalog(format!(
                "level {} has min {} above max {}",
                level.name, level.min_score, level.max_score
            )));
        }
        if let Some(other) = seen_ranks.insert(level.rank, level.name.as_str()) {
            return Err(DomainError::InvalidCatalog(format!(
                "levels {} and {} share rank {}",
                other, level.name, level.rank
            )));
        }
    }
    for pair in catalog.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.min_score < prev.min_score || next.rank < prev.rank {
            return Err(DomainError::InvalidCatalog(format!(
                "level {} is out of order",
                next.name
            )));
        }
        if next.min_score <= prev.max_score {
            return Err(DomainError::InvalidCatalog(format!(
                "levels {} and {} overlap",
                prev.name, next.name
            )));
        }
        if next.min_score - prev.max_score > 1.0 {
            return Err(DomainError::InvalidCatalog(format!(
                "gap between {} and {}",
                prev.name, next.name
            )));
        }
    }
    Ok(())
}

/// Ordered catalog with criteria for `jurusan_id` (department overrides win
/// over the defaults, per level).
pub fn catalog_for_department(
    conn: &Connection,
    jurusan_id: Option<&str>,
) -> DomainResult<Vec<Level>> {
    let mut stmt = conn.prepare(
        "SELECT id, rank, name, min_score, max_score, badge_color, badge_icon, description
         FROM levels
         ORDER BY min_score, rank",
    )?;
    let mut levels = stmt
        .query_map([], |r| {
            Ok(Level {
                id: r.get(0)?,
                rank: r.get(1)?,
                name: r.get(2)?,
                min_score: r.get(3)?,
                max_score: r.get(4)?,
                badge_color: r.get(5)?,
                badge_icon: r.get(6)?,
                description: r.get(7)?,
                criteria: Vec::new(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut defaults: HashMap<String, Vec<String>> = HashMap::new();
    let mut overrides: HashMap<String, Vec<String>> = HashMap::new();
    let mut crit_stmt = conn.prepare(
        "SELECT level_id, jurusan_id, text
         FROM level_criteria
         WHERE jurusan_id IS NULL OR jurusan_id = ?
         ORDER BY sort_order",
    )?;
    let rows = crit_stmt
        .query_map([jurusan_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (level_id, jurusan, text) in rows {
        let bucket = if jurusan.is_some() {
            &mut overrides
        } else {
            &mut defaults
        };
        bucket.entry(level_id).or_default().push(text);
    }

    for level in &mut levels {
        level.criteria = overrides
            .remove(&level.id)
            .or_else(|| defaults.remove(&level.id))
            .unwrap_or_default();
    }
    Ok(levels)
}

/// Read-path convenience: resolve against the stored catalog, degrading to
/// the placeholder level when the catalog cannot be read.
pub fn resolve_for_score(conn: &Connection, jurusan_id: Option<&str>, score: f64) -> Level {
    match catalog_for_department(conn, jurusan_id) {
        Ok(catalog) => resolve_level(&catalog, score),
        Err(e) => {
            tracing::warn!(error = %e, "level catalog unavailable, using placeholder");
            Level::placeholder()
        }
    }
}
