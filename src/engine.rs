//! Caller-facing facade. One pipeline per trigger, each pipeline a single
//! transaction on the shared [`Database`].
//!
//! Primary steps abort and roll back the whole pipeline on error. Secondary
//! steps (weight application, decay, rank refresh) run in their own
//! savepoint; a failure there is logged and rolled back on its own while the
//! primary work still commits.

use crate::cascade::{intervention_recompute, record_implemented};
use crate::catalog::{
    clear_catalog, create_project, delete_project, get_project, ingest_batch, intervention_exists,
    list_interventions, list_themes, project_exists, theme_exists,
};
use crate::costing::cost_level;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    ApplyOutcome, CatalogBatch, CatalogSummary, CostLevel, EngineSettings, ImplementedEntry, Intervention,
    InterventionGraph, MetricsOutcome, Project, ProjectMetrics, Recommendation, RuntimeScore, ScoreMap,
    StageRelation, Theme, ThemeWeightView, WeightsOutcome,
};
use crate::report::{implemented, intervention_graph, refresh_ranks};
use crate::scoring::{load_runtime_scores, metric_recompute, save_project_metrics, upsert_runtime_scores};
use crate::stages::{list_stage_relations, recommendations};
use crate::validation::{validate_graph_request, validate_recommendation_limit, validate_weights};
use crate::weighting::{
    apply_weights, decay_theme_weight, list_weightings, normalise_weights, theme_weight_views,
};
use rusqlite::{Connection, Transaction};
use std::collections::BTreeMap;
use std::path::Path;

pub struct Engine {
    db: Database,
}

impl Engine {
    pub fn open(path: &Path) -> AppResult<Self> {
        let db = Database::new(path)?;
        tracing::info!(path = %db.path().display(), "engine database opened");
        Ok(Self { db })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // ─── Triggers ──────────────────────────────────────────────────────────

    /// Stores new building metrics and rescores every intervention for the
    /// project from them.
    pub fn metrics_changed(
        &self,
        project_id: i64,
        metrics: &BTreeMap<String, f64>,
        dry_run: bool,
    ) -> AppResult<MetricsOutcome> {
        let outcome = self.db.write(dry_run, |tx| {
            let updated_rows = save_project_metrics(tx, project_id, metrics)?;
            if !project_exists(tx, project_id)? {
                return Err(AppError::NotFound(format!("Project {} not found", project_id)));
            }

            let scores = metric_recompute(tx, project_id)?;
            upsert_runtime_scores(tx, project_id, &scores)?;

            let weighted_rows = run_secondary(tx, project_id, "apply_weights", |conn| {
                apply_weights(conn, project_id)
            })?;
            run_secondary(tx, project_id, "refresh_ranks", |conn| refresh_ranks(conn, project_id))?;

            Ok(MetricsOutcome {
                project_id,
                updated_rows,
                scores,
                weighted_rows,
                dry_run,
            })
        })?;

        tracing::info!(
            project_id,
            updated_rows = outcome.updated_rows,
            scores = outcome.scores.len(),
            dry_run,
            "metrics change processed"
        );
        Ok(outcome)
    }

    /// Records an implemented intervention and cascades its effects onto the
    /// project's scores. Applying the same intervention again records
    /// nothing and cascades nothing.
    pub fn intervention_applied(
        &self,
        project_id: i64,
        intervention_id: i64,
        dry_run: bool,
    ) -> AppResult<ApplyOutcome> {
        // Read before taking the write lock.
        let settings = self.db.get_settings()?;

        let outcome = self.db.write(dry_run, |tx| {
            if !project_exists(tx, project_id)? {
                return Err(AppError::NotFound(format!("Project {} not found", project_id)));
            }
            if !intervention_exists(tx, intervention_id)? {
                return Err(AppError::NotFound(format!(
                    "Intervention {} not found",
                    intervention_id
                )));
            }

            let newly_implemented = record_implemented(tx, project_id, intervention_id)?;
            let new_scores = if newly_implemented {
                intervention_recompute(tx, project_id, intervention_id)?
            } else {
                tracing::debug!(project_id, intervention_id, "intervention already implemented; cascade skipped");
                ScoreMap::new()
            };

            // Decay touches only the weighting rows; scores are re-weighted
            // once below, after any decay.
            let decayed = if newly_implemented && settings.decay_on_apply {
                run_secondary(tx, project_id, "decay_theme_weight", |conn| {
                    decay_theme_weight(
                        conn,
                        project_id,
                        intervention_id,
                        settings.decay_alpha,
                        settings.decay_floor,
                    )
                })?
                .is_some_and(|rows| rows > 0)
            } else {
                false
            };

            let weighted_rows = run_secondary(tx, project_id, "apply_weights", |conn| {
                apply_weights(conn, project_id)
            })?;

            run_secondary(tx, project_id, "refresh_ranks", |conn| refresh_ranks(conn, project_id))?;

            Ok(ApplyOutcome {
                project_id,
                cause_intervention_id: intervention_id,
                newly_implemented,
                new_scores,
                weighted_rows,
                decayed,
                dry_run,
            })
        })?;

        tracing::info!(
            project_id,
            intervention_id,
            newly_implemented = outcome.newly_implemented,
            effects = outcome.new_scores.len(),
            decayed = outcome.decayed,
            dry_run,
            "intervention application processed"
        );
        Ok(outcome)
    }

    /// Merges the payload into the project's theme weights, renormalises
    /// every stored theme and re-weights every score. Themes missing from the
    /// payload keep their raw weight; the reported sums and normalised map
    /// cover all stored themes.
    pub fn weights_changed(
        &self,
        project_id: i64,
        weights: &BTreeMap<i64, f64>,
        dry_run: bool,
    ) -> AppResult<WeightsOutcome> {
        validate_weights(weights)?;

        let outcome = self.db.write(dry_run, |tx| {
            if !project_exists(tx, project_id)? {
                return Err(AppError::NotFound(format!("Project {} not found", project_id)));
            }
            for theme_id in weights.keys() {
                if !theme_exists(tx, *theme_id)? {
                    return Err(AppError::Validation(format!("Unknown theme {}", theme_id)));
                }
            }

            let updated = normalise_weights(tx, project_id, weights)?;
            let weighted_rows = apply_weights(tx, project_id)?;
            run_secondary(tx, project_id, "refresh_ranks", |conn| refresh_ranks(conn, project_id))?;

            let stored = list_weightings(tx, project_id)?;
            Ok(WeightsOutcome {
                project_id,
                updated,
                sum_raw: stored.iter().map(|row| row.weight_raw).sum(),
                sum_norm: stored.iter().map(|row| row.weight_norm).sum(),
                normalized: stored.iter().map(|row| (row.theme_id, row.weight_norm)).collect(),
                weighted_rows,
                dry_run,
            })
        })?;

        tracing::info!(
            project_id,
            themes = outcome.updated,
            weighted_rows = outcome.weighted_rows,
            dry_run,
            "theme weights processed"
        );
        Ok(outcome)
    }

    // ─── Reads ─────────────────────────────────────────────────────────────

    /// Eligible next interventions. `None` uses the configured limit.
    pub fn recommendations(&self, project_id: i64, limit: Option<u32>) -> AppResult<Vec<Recommendation>> {
        let limit = match limit {
            Some(limit) => limit,
            None => self.db.get_settings()?.recommendation_limit,
        };
        validate_recommendation_limit(limit)?;
        self.db.read(|conn| recommendations(conn, project_id, limit))
    }

    pub fn runtime_scores(&self, project_id: i64) -> AppResult<Vec<RuntimeScore>> {
        self.db.read(|conn| load_runtime_scores(conn, project_id))
    }

    pub fn theme_weightings(&self, project_id: i64) -> AppResult<Vec<ThemeWeightView>> {
        self.db.read(|conn| theme_weight_views(conn, project_id))
    }

    pub fn implemented(&self, project_id: i64) -> AppResult<Vec<ImplementedEntry>> {
        self.db.read(|conn| implemented(conn, project_id))
    }

    pub fn cost_level(&self, project_id: i64) -> AppResult<CostLevel> {
        let step_size = self.db.get_settings()?.cost_step_size;
        self.db.read(|conn| cost_level(conn, project_id, step_size))
    }

    /// Graph of the strongest interventions and the effects between them.
    /// Unset parameters fall back to the configured defaults.
    pub fn intervention_graph(
        &self,
        project_id: i64,
        top_n: Option<u32>,
        epsilon: Option<f64>,
    ) -> AppResult<InterventionGraph> {
        let settings = self.db.get_settings()?;
        let top_n = top_n.unwrap_or(settings.graph_top_n);
        let epsilon = epsilon.unwrap_or(settings.graph_epsilon);
        validate_graph_request(top_n, epsilon)?;
        self.db.read(|conn| intervention_graph(conn, project_id, top_n, epsilon))
    }

    pub fn project(&self, project_id: i64) -> AppResult<Option<Project>> {
        self.db.read(|conn| get_project(conn, project_id))
    }

    pub fn project_metrics(&self, project_id: i64) -> AppResult<Option<ProjectMetrics>> {
        Ok(self.project(project_id)?.map(|project| project.metrics))
    }

    pub fn themes(&self) -> AppResult<Vec<Theme>> {
        self.db.read(list_themes)
    }

    pub fn interventions(&self) -> AppResult<Vec<Intervention>> {
        self.db.read(list_interventions)
    }

    pub fn stage_relations(&self) -> AppResult<Vec<StageRelation>> {
        self.db.read(list_stage_relations)
    }

    // ─── Catalog & projects ────────────────────────────────────────────────

    pub fn ingest_catalog(&self, batch: &CatalogBatch) -> AppResult<CatalogSummary> {
        let summary = self.db.write(false, |tx| ingest_batch(tx, batch))?;
        tracing::info!(
            themes = summary.themes,
            interventions = summary.interventions,
            metric_rules = summary.metric_rules,
            intervention_rules = summary.intervention_rules,
            stages = summary.stages,
            "catalog ingested"
        );
        Ok(summary)
    }

    pub fn clear_catalog(&self) -> AppResult<()> {
        self.db.write(false, |tx| clear_catalog(tx))?;
        tracing::info!("catalog cleared");
        Ok(())
    }

    pub fn create_project(&self, name: &str) -> AppResult<Project> {
        let project = self.db.write(false, |tx| create_project(tx, name))?;
        tracing::info!(project_id = project.id, "project created");
        Ok(project)
    }

    pub fn delete_project(&self, project_id: i64) -> AppResult<bool> {
        let deleted = self.db.write(false, |tx| delete_project(tx, project_id))?;
        if deleted {
            tracing::info!(project_id, "project deleted");
        }
        Ok(deleted)
    }

    // ─── Settings ──────────────────────────────────────────────────────────

    pub fn settings(&self) -> AppResult<EngineSettings> {
        self.db.get_settings()
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<EngineSettings> {
        let settings = self.db.update_settings(update)?;
        tracing::info!(
            decay_alpha = settings.decay_alpha,
            decay_floor = settings.decay_floor,
            decay_on_apply = settings.decay_on_apply,
            "engine settings updated"
        );
        Ok(settings)
    }
}

/// Runs `work` inside a savepoint. Errors from `work` roll back the savepoint
/// only and yield `None`; errors managing the savepoint itself propagate.
fn run_secondary<T>(
    tx: &mut Transaction<'_>,
    project_id: i64,
    step: &'static str,
    work: impl FnOnce(&Connection) -> AppResult<T>,
) -> AppResult<Option<T>> {
    let savepoint = tx.savepoint()?;
    match work(&savepoint) {
        Ok(output) => {
            savepoint.commit()?;
            Ok(Some(output))
        }
        Err(error) => {
            tracing::warn!(project_id, step, error = %error, "secondary step failed; rolled back");
            drop(savepoint);
            Ok(None)
        }
    }
}
