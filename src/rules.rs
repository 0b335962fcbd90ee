use crate::db::invalid_text;
use crate::errors::{AppError, AppResult};
use crate::models::{BuildingMetric, InterventionEffectRule, MetricRule, MetricType};
use rusqlite::Connection;
use std::str::FromStr;

const METRIC_RULE_COLUMNS: &str =
    "id, metric_name, intervention_id, lower_bound, upper_bound, multiplier, reasoning";
const INTERVENTION_RULE_COLUMNS: &str = "id, cause_intervention_id, effect_intervention_id, metric_type,
     lower_bound, upper_bound, multiplier, reasoning";

/// Closed-interval check. An unknown value never matches.
pub fn in_bounds(value: Option<f64>, lower: Option<f64>, upper: Option<f64>) -> bool {
    let Some(value) = value else {
        return false;
    };
    if let Some(lower) = lower {
        if value < lower {
            return false;
        }
    }
    if let Some(upper) = upper {
        if value > upper {
            return false;
        }
    }
    true
}

pub fn fetch_metric_rules(conn: &Connection) -> AppResult<Vec<MetricRule>> {
    let query = format!("SELECT {} FROM metric_effects ORDER BY id", METRIC_RULE_COLUMNS);
    let mut stmt = conn.prepare(&query)?;
    let rows = stmt.query_map([], parse_metric_rule_row)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

pub fn fetch_intervention_rules(conn: &Connection) -> AppResult<Vec<InterventionEffectRule>> {
    let query = format!(
        "SELECT {} FROM intervention_effects ORDER BY id",
        INTERVENTION_RULE_COLUMNS
    );
    let mut stmt = conn.prepare(&query)?;
    let rows = stmt.query_map([], parse_intervention_rule_row)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

pub fn fetch_intervention_rules_for_cause(
    conn: &Connection,
    cause_intervention_id: i64,
) -> AppResult<Vec<InterventionEffectRule>> {
    let query = format!(
        "SELECT {} FROM intervention_effects WHERE cause_intervention_id = ?1 ORDER BY id",
        INTERVENTION_RULE_COLUMNS
    );
    let mut stmt = conn.prepare(&query)?;
    let rows = stmt.query_map([cause_intervention_id], parse_intervention_rule_row)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

fn parse_metric_rule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricRule> {
    Ok(MetricRule {
        id: row.get(0)?,
        metric: parse_metric(&row.get::<_, String>(1)?)?,
        intervention_id: row.get(2)?,
        lower: row.get(3)?,
        upper: row.get(4)?,
        multiplier: row.get(5)?,
        reasoning: row.get(6)?,
    })
}

fn parse_intervention_rule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InterventionEffectRule> {
    Ok(InterventionEffectRule {
        id: row.get(0)?,
        cause_intervention_id: row.get(1)?,
        effect_intervention_id: row.get(2)?,
        metric_type: row
            .get::<_, Option<String>>(3)?
            .map(|raw| parse_metric_type(&raw))
            .transpose()?,
        lower: row.get(4)?,
        upper: row.get(5)?,
        multiplier: row.get(6)?,
        reasoning: row.get(7)?,
    })
}

fn parse_metric(raw: &str) -> rusqlite::Result<BuildingMetric> {
    BuildingMetric::from_str(raw).map_err(|err: AppError| invalid_text(err.to_string()))
}

fn parse_metric_type(raw: &str) -> rusqlite::Result<MetricType> {
    match raw {
        "ratio" => Ok(MetricType::Ratio),
        "percentage" => Ok(MetricType::Percentage),
        other => Err(invalid_text(format!("Unknown metric type '{}'", other))),
    }
}
