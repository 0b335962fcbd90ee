use crate::errors::AppResult;
use crate::models::ScoreMap;
use crate::rules::fetch_intervention_rules_for_cause;
use crate::scoring::upsert_runtime_scores;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

/// Marks the intervention as implemented for the project. Returns `false`
/// when it was already recorded, in which case nothing changes.
pub fn record_implemented(conn: &Connection, project_id: i64, intervention_id: i64) -> AppResult<bool> {
    let inserted = conn.execute(
        "INSERT INTO implemented_interventions (project_id, impl_id, implemented_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(project_id, impl_id) DO NOTHING",
        params![project_id, intervention_id, Utc::now().to_rfc3339()],
    )?;
    Ok(inserted == 1)
}

pub fn implemented_ids(conn: &Connection, project_id: i64) -> AppResult<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT impl_id FROM implemented_interventions WHERE project_id = ?1 ORDER BY implemented_at, impl_id",
    )?;
    let rows = stmt.query_map([project_id], |row| row.get::<_, i64>(0))?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

/// Applies every effect rule caused by `cause_intervention_id` on top of the
/// project's current adjusted scores and persists the result.
///
/// Rules are applied unconditionally; their bounds are stored but not
/// evaluated. Each call compounds onto the previous state, so calling it
/// twice for the same cause applies the multipliers twice.
pub fn intervention_recompute(
    conn: &Connection,
    project_id: i64,
    cause_intervention_id: i64,
) -> AppResult<ScoreMap> {
    let rules = fetch_intervention_rules_for_cause(conn, cause_intervention_id)?;
    if rules.is_empty() {
        return Ok(ScoreMap::new());
    }

    let mut aggregated = ScoreMap::new();
    for rule in &rules {
        *aggregated.entry(rule.effect_intervention_id).or_insert(1.0) *= rule.multiplier;
    }

    let mut scores = ScoreMap::new();
    for (effect_id, multiplier) in &aggregated {
        let current = current_score(conn, project_id, *effect_id)?;
        scores.insert(*effect_id, current * multiplier);
    }

    upsert_runtime_scores(conn, project_id, &scores)?;
    tracing::debug!(
        project_id,
        cause_intervention_id,
        effects = scores.len(),
        "cascade applied"
    );
    Ok(scores)
}

fn current_score(conn: &Connection, project_id: i64, intervention_id: i64) -> AppResult<f64> {
    let score = conn
        .query_row(
            "SELECT COALESCE(rs.adjusted_base_effectiveness, i.base_effectiveness, 0)
             FROM interventions i
             LEFT JOIN runtime_scores rs ON rs.intervention_id = i.id AND rs.project_id = ?1
             WHERE i.id = ?2",
            params![project_id, intervention_id],
            |row| row.get::<_, f64>(0),
        )
        .optional()?;
    Ok(score.unwrap_or(0.0))
}
