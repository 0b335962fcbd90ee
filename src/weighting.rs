use crate::errors::AppResult;
use crate::models::{ProjectThemeWeighting, ThemeWeightView};
use crate::validation::{validate_decay, validate_weights};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;

/// Raw sum and `raw / sum` for each theme. Rejects negative or non-finite
/// entries and a non-positive sum.
pub fn normalised(weights: &BTreeMap<i64, f64>) -> AppResult<(f64, BTreeMap<i64, f64>)> {
    let total = validate_weights(weights)?;
    let normalised = weights
        .iter()
        .map(|(theme_id, raw)| (*theme_id, raw / total))
        .collect();
    Ok((total, normalised))
}

/// Upserts the raw weight of every theme in the payload, then renormalises
/// all of the project's stored rows so their norms sum to 1. Themes not in
/// the payload keep their raw weight. Decay counters survive.
pub fn normalise_weights(
    conn: &Connection,
    project_id: i64,
    weights: &BTreeMap<i64, f64>,
) -> AppResult<usize> {
    let (_, normalised) = normalised(weights)?;

    let mut updated = 0usize;
    {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO project_theme_weightings (project_id, theme_id, weight_raw, weight_norm)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(project_id, theme_id)
             DO UPDATE SET weight_raw = excluded.weight_raw, weight_norm = excluded.weight_norm",
        )?;
        for (theme_id, raw) in weights {
            let norm = normalised.get(theme_id).copied().unwrap_or(0.0);
            updated += stmt.execute(params![project_id, theme_id, raw, norm])?;
        }
    }

    renormalise_weights(conn, project_id)?;
    Ok(updated)
}

/// Recomputes the theme-weighted score of every runtime row of the project.
/// Rows whose theme has no stored weighting get 0.
pub fn apply_weights(conn: &Connection, project_id: i64) -> AppResult<usize> {
    let updated = conn.execute(
        "UPDATE runtime_scores
         SET theme_weighted_effectiveness = COALESCE(adjusted_base_effectiveness, 0) * COALESCE((
             SELECT w.weight_norm
             FROM project_theme_weightings w
             JOIN interventions i ON i.theme_id = w.theme_id
             WHERE i.id = runtime_scores.intervention_id
               AND w.project_id = runtime_scores.project_id
         ), 0)
         WHERE project_id = ?1",
        [project_id],
    )?;
    Ok(updated)
}

pub fn renormalise_weights(conn: &Connection, project_id: i64) -> AppResult<usize> {
    let updated = conn.execute(
        "UPDATE project_theme_weightings
         SET weight_norm = CASE
             WHEN (SELECT SUM(weight_raw) FROM project_theme_weightings WHERE project_id = ?1) > 0
             THEN weight_raw / (SELECT SUM(weight_raw) FROM project_theme_weightings WHERE project_id = ?1)
             ELSE 0
         END
         WHERE project_id = ?1",
        [project_id],
    )?;
    Ok(updated)
}

/// Shrinks the raw weight of the intervention's theme to
/// `max(floor, raw * alpha)`, then renormalises and re-applies weights.
///
/// Returns the number of weighting rows decayed rather than a constant 1:
/// 1 normally, 0 when the intervention is unknown or its theme has no
/// weighting for the project. Renormalising and re-applying still happen
/// in the second case.
pub fn decay_by_intervention(
    conn: &Connection,
    project_id: i64,
    intervention_id: i64,
    alpha: f64,
    floor: f64,
) -> AppResult<usize> {
    let decayed = decay_theme_weight(conn, project_id, intervention_id, alpha, floor)?;
    apply_weights(conn, project_id)?;
    Ok(decayed)
}

/// The weighting half of [`decay_by_intervention`]: decays and renormalises
/// without touching runtime scores. Callers must re-apply weights.
pub fn decay_theme_weight(
    conn: &Connection,
    project_id: i64,
    intervention_id: i64,
    alpha: f64,
    floor: f64,
) -> AppResult<usize> {
    validate_decay(alpha, floor)?;

    let theme_id = conn
        .query_row(
            "SELECT theme_id FROM interventions WHERE id = ?1",
            [intervention_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    let Some(theme_id) = theme_id else {
        tracing::debug!(project_id, intervention_id, "decay skipped: unknown intervention");
        renormalise_weights(conn, project_id)?;
        return Ok(0);
    };

    let decayed = conn.execute(
        "UPDATE project_theme_weightings
         SET weight_raw = MAX(?3, weight_raw * ?4), decay_steps = decay_steps + 1
         WHERE project_id = ?1 AND theme_id = ?2",
        params![project_id, theme_id, floor, alpha],
    )?;

    renormalise_weights(conn, project_id)?;
    Ok(decayed)
}

pub fn list_weightings(conn: &Connection, project_id: i64) -> AppResult<Vec<ProjectThemeWeighting>> {
    let mut stmt = conn.prepare(
        "SELECT project_id, theme_id, weight_raw, weight_norm, decay_steps
         FROM project_theme_weightings WHERE project_id = ?1 ORDER BY theme_id",
    )?;
    let rows = stmt.query_map([project_id], |row| {
        Ok(ProjectThemeWeighting {
            project_id: row.get(0)?,
            theme_id: row.get(1)?,
            weight_raw: row.get(2)?,
            weight_norm: row.get(3)?,
            decay_steps: row.get(4)?,
        })
    })?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

/// Every theme in the catalog with the project's stored weighting, if any.
pub fn theme_weight_views(conn: &Connection, project_id: i64) -> AppResult<Vec<ThemeWeightView>> {
    let mut stmt = conn.prepare(
        "SELECT t.id, t.name, w.weight_raw, w.weight_norm, w.decay_steps
         FROM themes t
         LEFT JOIN project_theme_weightings w ON w.theme_id = t.id AND w.project_id = ?1
         ORDER BY t.id",
    )?;
    let rows = stmt.query_map([project_id], |row| {
        Ok(ThemeWeightView {
            theme_id: row.get(0)?,
            name: row.get(1)?,
            weight_raw: row.get(2)?,
            weight_norm: row.get(3)?,
            decay_steps: row.get(4)?,
        })
    })?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}
