//! Catalog rows (themes, interventions, rules, stage relations) and the
//! project rows that scoring reads metrics from.
//!
//! Rows arrive already parsed; every row is validated before the first write
//! so a rejected batch leaves the store untouched.

use crate::db::parse_time;
use crate::errors::{AppError, AppResult};
use crate::models::{
    BuildingMetric, CatalogBatch, CatalogSummary, Intervention, NewIntervention, NewInterventionRule,
    NewMetricRule, NewTheme, Project, ProjectMetrics, StageRelation, Theme,
};
use crate::validation::{validate_bounds, validate_multiplier};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::str::FromStr;

const PLACEHOLDER_PROJECT_NAME: &str = "Untitled";
const DRAFT_STATUS: &str = "draft";

pub fn upsert_theme(conn: &Connection, theme: &NewTheme) -> AppResult<i64> {
    validate_theme(theme)?;
    conn.execute(
        "INSERT INTO themes (id, name, description) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, description = excluded.description",
        params![theme.id, theme.name.trim(), theme.description],
    )?;
    Ok(theme.id)
}

/// Inserts or updates an intervention keyed by its unique name and returns
/// its id.
pub fn upsert_intervention(conn: &Connection, row: &NewIntervention) -> AppResult<i64> {
    validate_intervention(row)?;
    let name = row.name.trim();
    conn.execute(
        "INSERT INTO interventions (id, name, theme_id, base_effectiveness, cost_weight, is_stage, description)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(name) DO UPDATE SET
           theme_id = excluded.theme_id,
           base_effectiveness = excluded.base_effectiveness,
           cost_weight = excluded.cost_weight,
           is_stage = excluded.is_stage,
           description = excluded.description",
        params![
            row.id,
            name,
            row.theme_id,
            row.base_effectiveness,
            row.cost_weight.unwrap_or(1.0),
            row.is_stage,
            row.description,
        ],
    )?;
    let id = conn.query_row("SELECT id FROM interventions WHERE name = ?1", [name], |r| r.get(0))?;
    Ok(id)
}

pub fn add_metric_rule(conn: &Connection, rule: &NewMetricRule) -> AppResult<i64> {
    let metric = validate_metric_rule(rule)?;
    conn.execute(
        "INSERT INTO metric_effects (metric_name, intervention_id, lower_bound, upper_bound, multiplier, reasoning)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            metric.as_str(),
            rule.intervention_id,
            rule.lower,
            rule.upper,
            rule.multiplier,
            rule.reasoning,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn add_intervention_rule(conn: &Connection, rule: &NewInterventionRule) -> AppResult<i64> {
    validate_intervention_rule(rule)?;
    conn.execute(
        "INSERT INTO intervention_effects
           (cause_intervention_id, effect_intervention_id, metric_type, lower_bound, upper_bound, multiplier, reasoning)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            rule.cause_intervention_id,
            rule.effect_intervention_id,
            rule.metric_type.map(|kind| kind.as_str()),
            rule.lower,
            rule.upper,
            rule.multiplier,
            rule.reasoning,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Returns `true` when the relation was new.
pub fn add_stage_relation(conn: &Connection, relation: &StageRelation) -> AppResult<bool> {
    validate_stage_relation(relation)?;
    let inserted = conn.execute(
        "INSERT INTO stages (src_intervention_id, dst_intervention_id, relation_type)
         VALUES (?1, ?2, ?3)
         ON CONFLICT DO NOTHING",
        params![
            relation.src_intervention_id,
            relation.dst_intervention_id,
            relation.relation_type.as_str()
        ],
    )?;
    Ok(inserted > 0)
}

pub fn ingest_batch(conn: &Connection, batch: &CatalogBatch) -> AppResult<CatalogSummary> {
    for theme in &batch.themes {
        validate_theme(theme)?;
    }
    for intervention in &batch.interventions {
        validate_intervention(intervention)?;
    }
    for rule in &batch.metric_rules {
        validate_metric_rule(rule)?;
    }
    for rule in &batch.intervention_rules {
        validate_intervention_rule(rule)?;
    }
    for relation in &batch.stages {
        validate_stage_relation(relation)?;
    }

    let mut summary = CatalogSummary::default();
    for theme in &batch.themes {
        upsert_theme(conn, theme)?;
        summary.themes += 1;
    }
    for intervention in &batch.interventions {
        upsert_intervention(conn, intervention)?;
        summary.interventions += 1;
    }
    for rule in &batch.metric_rules {
        add_metric_rule(conn, rule)?;
        summary.metric_rules += 1;
    }
    for rule in &batch.intervention_rules {
        add_intervention_rule(conn, rule)?;
        summary.intervention_rules += 1;
    }
    for relation in &batch.stages {
        if add_stage_relation(conn, relation)? {
            summary.stages += 1;
        }
    }
    Ok(summary)
}

/// Removes every catalog row together with the per-project state derived
/// from it. Projects themselves are kept.
pub fn clear_catalog(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "DELETE FROM implemented_interventions;
         DELETE FROM stages;
         DELETE FROM runtime_scores;
         DELETE FROM project_theme_weightings;
         DELETE FROM intervention_effects;
         DELETE FROM metric_effects;
         DELETE FROM interventions;
         DELETE FROM themes;",
    )?;
    Ok(())
}

pub fn list_themes(conn: &Connection) -> AppResult<Vec<Theme>> {
    let mut stmt = conn.prepare("SELECT id, name, description FROM themes ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        Ok(Theme {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
        })
    })?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

pub fn theme_exists(conn: &Connection, theme_id: i64) -> AppResult<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM themes WHERE id = ?1", [theme_id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

pub fn list_interventions(conn: &Connection) -> AppResult<Vec<Intervention>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, theme_id, base_effectiveness, cost_weight, is_stage, description
         FROM interventions ORDER BY id",
    )?;
    let rows = stmt.query_map([], parse_intervention_row)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

pub fn get_intervention(conn: &Connection, intervention_id: i64) -> AppResult<Option<Intervention>> {
    conn.query_row(
        "SELECT id, name, theme_id, base_effectiveness, cost_weight, is_stage, description
         FROM interventions WHERE id = ?1",
        [intervention_id],
        parse_intervention_row,
    )
    .optional()
    .map_err(AppError::from)
}

pub fn intervention_exists(conn: &Connection, intervention_id: i64) -> AppResult<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM interventions WHERE id = ?1", [intervention_id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

pub fn create_project(conn: &Connection, name: &str) -> AppResult<Project> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("Project name must not be empty".to_string()));
    }
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO projects (name, status, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
        params![trimmed, DRAFT_STATUS, now],
    )?;
    let id = conn.last_insert_rowid();
    get_project(conn, id)?.ok_or_else(|| AppError::Internal(format!("project {} vanished after insert", id)))
}

/// Inserts a placeholder project row when `project_id` is unknown. Returns
/// `true` if a row was created.
pub fn ensure_project(conn: &Connection, project_id: i64) -> AppResult<bool> {
    let now = Utc::now().to_rfc3339();
    let inserted = conn.execute(
        "INSERT INTO projects (id, name, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT(id) DO NOTHING",
        params![project_id, PLACEHOLDER_PROJECT_NAME, DRAFT_STATUS, now],
    )?;
    Ok(inserted > 0)
}

pub fn get_project(conn: &Connection, project_id: i64) -> AppResult<Option<Project>> {
    conn.query_row(
        "SELECT id, name, status, created_at, updated_at,
                levels, external_wall_area, footprint_area, opening_pct, wall_to_floor_ratio,
                footprint_gifa, gifa_total, external_openings_area, avg_height_per_level
         FROM projects WHERE id = ?1",
        [project_id],
        |row| {
            Ok(Project {
                id: row.get(0)?,
                name: row.get(1)?,
                status: row.get(2)?,
                created_at: parse_time(&row.get::<_, String>(3)?)?,
                updated_at: parse_time(&row.get::<_, String>(4)?)?,
                metrics: ProjectMetrics {
                    levels: row.get(5)?,
                    external_wall_area: row.get(6)?,
                    footprint_area: row.get(7)?,
                    opening_pct: row.get(8)?,
                    wall_to_floor_ratio: row.get(9)?,
                    footprint_gifa: row.get(10)?,
                    gifa_total: row.get(11)?,
                    external_openings_area: row.get(12)?,
                    avg_height_per_level: row.get(13)?,
                },
            })
        },
    )
    .optional()
    .map_err(AppError::from)
}

pub fn project_exists(conn: &Connection, project_id: i64) -> AppResult<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM projects WHERE id = ?1", [project_id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

/// Project teardown. Runtime scores, weightings and implemented rows go with
/// the project through `ON DELETE CASCADE`.
pub fn delete_project(conn: &Connection, project_id: i64) -> AppResult<bool> {
    let changed = conn.execute("DELETE FROM projects WHERE id = ?1", [project_id])?;
    Ok(changed > 0)
}

fn validate_theme(theme: &NewTheme) -> AppResult<()> {
    if theme.name.trim().is_empty() {
        return Err(AppError::Validation(format!("Theme {} has an empty name", theme.id)));
    }
    Ok(())
}

fn validate_intervention(row: &NewIntervention) -> AppResult<()> {
    if row.name.trim().is_empty() {
        return Err(AppError::Validation("Intervention name must not be empty".to_string()));
    }
    if let Some(base) = row.base_effectiveness {
        if !base.is_finite() {
            return Err(AppError::Validation(format!(
                "Base effectiveness for '{}' must be a finite number",
                row.name
            )));
        }
    }
    if let Some(cost) = row.cost_weight {
        if !(cost.is_finite() && cost >= 0.0) {
            return Err(AppError::Validation(format!(
                "Cost weight for '{}' must be a finite value >= 0",
                row.name
            )));
        }
    }
    Ok(())
}

fn validate_metric_rule(rule: &NewMetricRule) -> AppResult<BuildingMetric> {
    let metric = BuildingMetric::from_str(&rule.metric_name)?;
    validate_multiplier(rule.multiplier)?;
    validate_bounds(rule.lower, rule.upper)?;
    Ok(metric)
}

fn validate_intervention_rule(rule: &NewInterventionRule) -> AppResult<()> {
    if rule.cause_intervention_id == rule.effect_intervention_id {
        return Err(AppError::Validation(format!(
            "Intervention {} cannot cascade onto itself",
            rule.cause_intervention_id
        )));
    }
    validate_multiplier(rule.multiplier)?;
    validate_bounds(rule.lower, rule.upper)
}

fn validate_stage_relation(relation: &StageRelation) -> AppResult<()> {
    if relation.src_intervention_id == relation.dst_intervention_id {
        return Err(AppError::Validation(format!(
            "Intervention {} cannot have a {} relation with itself",
            relation.src_intervention_id,
            relation.relation_type.as_str()
        )));
    }
    Ok(())
}

fn parse_intervention_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Intervention> {
    Ok(Intervention {
        id: row.get(0)?,
        name: row.get(1)?,
        theme_id: row.get(2)?,
        base_effectiveness: row.get(3)?,
        cost_weight: row.get(4)?,
        is_stage: row.get::<_, i32>(5)? != 0,
        description: row.get(6)?,
    })
}
