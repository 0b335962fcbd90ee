use crate::catalog::{ensure_project, get_project};
use crate::errors::AppResult;
use crate::models::{BuildingMetric, MetricRule, ProjectMetrics, RuntimeScore, ScoreMap};
use crate::rules::{fetch_metric_rules, in_bounds};
use crate::validation::validate_metric_value;
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Writes the allow-listed building metrics onto the project row, creating a
/// placeholder project when none exists. Unknown metric names are dropped.
///
/// Returns the number of project rows updated (0 when nothing applicable was
/// supplied, in which case nothing is written).
pub fn save_project_metrics(
    conn: &Connection,
    project_id: i64,
    metrics: &BTreeMap<String, f64>,
) -> AppResult<usize> {
    let mut updates: BTreeMap<BuildingMetric, f64> = BTreeMap::new();
    for (name, value) in metrics {
        match BuildingMetric::from_str(name) {
            Ok(metric) => {
                validate_metric_value(name, *value)?;
                updates.insert(metric, *value);
            }
            Err(_) => {
                tracing::debug!(project_id, metric = %name, "dropping unknown building metric");
            }
        }
    }

    if updates.is_empty() {
        return Ok(0);
    }

    if ensure_project(conn, project_id)? {
        tracing::info!(project_id, "created placeholder project for metrics ingest");
    }

    let set_clause = updates
        .keys()
        .enumerate()
        .map(|(index, metric)| format!("{} = ?{}", metric.as_str(), index + 2))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE projects SET {}, updated_at = ?1 WHERE id = ?{}",
        set_clause,
        updates.len() + 2
    );

    let mut values = Vec::with_capacity(updates.len() + 2);
    values.push(Value::Text(Utc::now().to_rfc3339()));
    values.extend(updates.values().map(|value| Value::Real(*value)));
    values.push(Value::Integer(project_id));

    let changed = conn.execute(&sql, params_from_iter(values.iter()))?;
    Ok(changed)
}

/// Adjusted effectiveness for every intervention from the project's stored
/// metrics. Reads only; persist the result with [`upsert_runtime_scores`].
pub fn metric_recompute(conn: &Connection, project_id: i64) -> AppResult<ScoreMap> {
    let base = load_base_effectiveness(conn)?;
    if base.is_empty() {
        return Ok(base);
    }

    let rules = fetch_metric_rules(conn)?;
    if rules.is_empty() {
        return Ok(base);
    }

    let metrics = get_project(conn, project_id)?
        .map(|project| project.metrics)
        .unwrap_or_default();

    Ok(apply_metric_rules(&base, &rules, &metrics))
}

/// Multiplies each base score by every rule whose metric value is in bounds.
/// Rules targeting interventions outside `base` are ignored.
pub fn apply_metric_rules(base: &ScoreMap, rules: &[MetricRule], metrics: &ProjectMetrics) -> ScoreMap {
    let mut multipliers: ScoreMap = base.keys().map(|id| (*id, 1.0)).collect();

    for rule in rules {
        if !in_bounds(metrics.get(rule.metric), rule.lower, rule.upper) {
            continue;
        }
        if let Some(multiplier) = multipliers.get_mut(&rule.intervention_id) {
            *multiplier *= rule.multiplier;
        }
    }

    base.iter()
        .map(|(id, score)| (*id, score * multipliers.get(id).copied().unwrap_or(1.0)))
        .collect()
}

/// Sets `adjusted_base_effectiveness` for each scored intervention, leaving
/// the theme-weighted column and rank of existing rows untouched.
pub fn upsert_runtime_scores(conn: &Connection, project_id: i64, scores: &ScoreMap) -> AppResult<usize> {
    if scores.is_empty() {
        return Ok(0);
    }

    let mut stmt = conn.prepare_cached(
        "INSERT INTO runtime_scores (project_id, intervention_id, adjusted_base_effectiveness)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(project_id, intervention_id)
         DO UPDATE SET adjusted_base_effectiveness = excluded.adjusted_base_effectiveness",
    )?;
    let mut affected = 0usize;
    for (intervention_id, score) in scores {
        affected += stmt.execute(params![project_id, intervention_id, score])?;
    }
    Ok(affected)
}

pub fn load_runtime_scores(conn: &Connection, project_id: i64) -> AppResult<Vec<RuntimeScore>> {
    let mut stmt = conn.prepare(
        "SELECT project_id, intervention_id, adjusted_base_effectiveness, theme_weighted_effectiveness, rank
         FROM runtime_scores WHERE project_id = ?1 ORDER BY intervention_id",
    )?;
    let rows = stmt.query_map([project_id], |row| {
        Ok(RuntimeScore {
            project_id: row.get(0)?,
            intervention_id: row.get(1)?,
            adjusted_base_effectiveness: row.get(2)?,
            theme_weighted_effectiveness: row.get(3)?,
            rank: row.get(4)?,
        })
    })?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

fn load_base_effectiveness(conn: &Connection) -> AppResult<ScoreMap> {
    let mut stmt = conn.prepare("SELECT id, COALESCE(base_effectiveness, 0) FROM interventions")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)))?;
    let mut result = ScoreMap::new();
    for row in rows {
        let (id, base) = row?;
        result.insert(id, base);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::{apply_metric_rules, load_runtime_scores, metric_recompute, save_project_metrics, upsert_runtime_scores};
    use crate::catalog::{add_metric_rule, get_project};
    use crate::db::fixtures::{assert_close, open_test_db, seed_intervention, seed_project, seed_theme};
    use crate::models::{BuildingMetric, MetricRule, NewMetricRule, ProjectMetrics, ScoreMap};
    use std::collections::BTreeMap;

    fn metric_rule(id: i64, metric: BuildingMetric, target: i64, multiplier: f64) -> MetricRule {
        MetricRule {
            id,
            metric,
            intervention_id: target,
            lower: Some(0.0),
            upper: Some(100.0),
            multiplier,
            reasoning: None,
        }
    }

    #[test]
    fn compounding_does_not_depend_on_rule_order() {
        let base = ScoreMap::from([(1, 0.5), (2, 0.8)]);
        let metrics = ProjectMetrics {
            levels: Some(4.0),
            opening_pct: Some(30.0),
            ..ProjectMetrics::default()
        };
        let forward = vec![
            metric_rule(1, BuildingMetric::Levels, 1, 1.5),
            metric_rule(2, BuildingMetric::OpeningPct, 1, 2.0),
        ];
        let reversed: Vec<MetricRule> = forward.iter().rev().cloned().collect();

        let a = apply_metric_rules(&base, &forward, &metrics);
        let b = apply_metric_rules(&base, &reversed, &metrics);
        assert_close(a[&1], 1.5);
        assert_close(b[&1], 1.5);
        assert_close(a[&2], 0.8);
    }

    #[test]
    fn unknown_metric_values_never_match() {
        let base = ScoreMap::from([(1, 1.0)]);
        let rules = vec![metric_rule(1, BuildingMetric::GifaTotal, 1, 3.0)];
        let scores = apply_metric_rules(&base, &rules, &ProjectMetrics::default());
        assert_close(scores[&1], 1.0);
    }

    #[test]
    fn passes_base_through_when_no_rules_exist() {
        let (_dir, db) = open_test_db();
        let conn = db.lock().expect("db lock");
        seed_theme(&conn, 1, "Carbon");
        let x = seed_intervention(&conn, "X", 1, Some(0.4), false);
        let blank = seed_intervention(&conn, "Blank", 1, None, false);

        let scores = metric_recompute(&conn, 999).expect("recompute");
        assert_eq!(scores.len(), 2);
        assert_close(scores[&x], 0.4);
        assert_close(scores[&blank], 0.0);
    }

    #[test]
    fn empty_catalog_recomputes_to_nothing() {
        let (_dir, db) = open_test_db();
        let conn = db.lock().expect("db lock");
        assert!(metric_recompute(&conn, 1).expect("recompute").is_empty());
    }

    #[test]
    fn recompute_applies_in_bound_rules_from_stored_metrics() {
        let (_dir, db) = open_test_db();
        let conn = db.lock().expect("db lock");
        seed_theme(&conn, 1, "Carbon");
        let glazing = seed_intervention(&conn, "Glazing", 1, Some(0.5), false);
        let roof = seed_intervention(&conn, "Roof", 1, Some(0.2), false);
        for (metric_name, lower, upper, multiplier) in [
            ("opening_pct", Some(20.0), Some(40.0), 1.5),
            ("levels", None, Some(5.0), 2.0),
            ("levels", Some(6.0), None, 10.0),
        ] {
            add_metric_rule(
                &conn,
                &NewMetricRule {
                    metric_name: metric_name.to_string(),
                    intervention_id: glazing,
                    lower,
                    upper,
                    multiplier,
                    reasoning: None,
                },
            )
            .expect("rule");
        }

        let project = seed_project(&conn);
        let metrics = BTreeMap::from([("opening_pct".to_string(), 40.0), ("levels".to_string(), 5.0)]);
        save_project_metrics(&conn, project, &metrics).expect("save metrics");

        let scores = metric_recompute(&conn, project).expect("recompute");
        assert_close(scores[&glazing], 0.5 * 1.5 * 2.0);
        assert_close(scores[&roof], 0.2);

        // No project row: every metric is unknown, nothing matches.
        let orphan = metric_recompute(&conn, project + 100).expect("recompute orphan");
        assert_close(orphan[&glazing], 0.5);
    }

    #[test]
    fn saving_metrics_drops_unknown_names_and_creates_placeholder() {
        let (_dir, db) = open_test_db();
        let conn = db.lock().expect("db lock");

        let metrics = BTreeMap::from([
            ("levels".to_string(), 3.0),
            ("basement_depth".to_string(), 2.0),
        ]);
        let updated = save_project_metrics(&conn, 77, &metrics).expect("save");
        assert_eq!(updated, 1);

        let project = get_project(&conn, 77).expect("get").expect("placeholder exists");
        assert_eq!(project.name, "Untitled");
        assert_eq!(project.metrics.levels, Some(3.0));

        let only_unknown = BTreeMap::from([("basement_depth".to_string(), 2.0)]);
        assert_eq!(save_project_metrics(&conn, 78, &only_unknown).expect("save"), 0);
        assert!(get_project(&conn, 78).expect("get").is_none());
    }

    #[test]
    fn non_finite_metric_rejects_the_whole_batch() {
        let (_dir, db) = open_test_db();
        let conn = db.lock().expect("db lock");
        let project = seed_project(&conn);

        let metrics = BTreeMap::from([
            ("gifa_total".to_string(), 1200.0),
            ("levels".to_string(), f64::NAN),
        ]);
        let err = save_project_metrics(&conn, project, &metrics).expect_err("nan");
        assert!(err.is_validation());

        let stored = get_project(&conn, project).expect("get").expect("exists");
        assert_eq!(stored.metrics.gifa_total, None);
    }

    #[test]
    fn upsert_overwrites_adjusted_and_keeps_weighted_column() {
        let (_dir, db) = open_test_db();
        let conn = db.lock().expect("db lock");
        seed_theme(&conn, 1, "Carbon");
        let a = seed_intervention(&conn, "A", 1, Some(0.5), false);
        let project = seed_project(&conn);

        upsert_runtime_scores(&conn, project, &ScoreMap::from([(a, 0.5)])).expect("first");
        conn.execute(
            "UPDATE runtime_scores SET theme_weighted_effectiveness = 0.25 WHERE project_id = ?1",
            [project],
        )
        .expect("set weighted");
        upsert_runtime_scores(&conn, project, &ScoreMap::from([(a, 0.9)])).expect("second");

        let rows = load_runtime_scores(&conn, project).expect("load");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].adjusted_base_effectiveness, Some(0.9));
        assert_eq!(rows[0].theme_weighted_effectiveness, Some(0.25));
        assert_eq!(upsert_runtime_scores(&conn, project, &ScoreMap::new()).expect("empty"), 0);
    }
}
