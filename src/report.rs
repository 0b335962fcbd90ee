use crate::db::parse_time;
use crate::errors::AppResult;
use crate::models::{GraphEdge, GraphNode, ImplementedEntry, InterventionGraph};
use crate::rules::fetch_intervention_rules;
use rusqlite::{params, Connection};
use std::collections::BTreeSet;

/// Implemented interventions of a project, best theme-weighted score first
/// (unscored counts as 0), then by name.
pub fn implemented(conn: &Connection, project_id: i64) -> AppResult<Vec<ImplementedEntry>> {
    let mut stmt = conn.prepare(
        "SELECT ii.impl_id, i.name, rs.theme_weighted_effectiveness, ii.implemented_at
         FROM implemented_interventions ii
         JOIN interventions i ON i.id = ii.impl_id
         LEFT JOIN runtime_scores rs ON rs.project_id = ii.project_id AND rs.intervention_id = ii.impl_id
         WHERE ii.project_id = ?1
         ORDER BY COALESCE(rs.theme_weighted_effectiveness, 0) DESC, i.name",
    )?;
    let rows = stmt.query_map([project_id], |row| {
        Ok(ImplementedEntry {
            intervention_id: row.get(0)?,
            name: row.get(1)?,
            score: row.get(2)?,
            implemented_at: parse_time(&row.get::<_, String>(3)?)?,
        })
    })?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

/// The project's `top_n` interventions by theme-weighted score as nodes, and
/// the cascade rules between them as signed edges. Rules whose multiplier is
/// within `epsilon` of 1.0 are left out.
pub fn intervention_graph(
    conn: &Connection,
    project_id: i64,
    top_n: u32,
    epsilon: f64,
) -> AppResult<InterventionGraph> {
    let mut stmt = conn.prepare(
        "SELECT rs.intervention_id, COALESCE(i.name, CAST(rs.intervention_id AS TEXT)), rs.theme_weighted_effectiveness
         FROM runtime_scores rs
         LEFT JOIN interventions i ON i.id = rs.intervention_id
         WHERE rs.project_id = ?1
         ORDER BY COALESCE(rs.theme_weighted_effectiveness, 0) DESC, rs.intervention_id
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![project_id, top_n], |row| {
        Ok(GraphNode {
            id: row.get(0)?,
            label: row.get(1)?,
            score: row.get(2)?,
        })
    })?;
    let mut nodes = Vec::new();
    for row in rows {
        nodes.push(row?);
    }

    let node_ids: BTreeSet<i64> = nodes.iter().map(|node| node.id).collect();
    let edges = fetch_intervention_rules(conn)?
        .into_iter()
        .filter(|rule| {
            node_ids.contains(&rule.cause_intervention_id)
                && node_ids.contains(&rule.effect_intervention_id)
                && (rule.multiplier - 1.0).abs() >= epsilon
        })
        .map(|rule| GraphEdge {
            src: rule.cause_intervention_id,
            dst: rule.effect_intervention_id,
            weight: rule.multiplier - 1.0,
            multiplier: rule.multiplier,
        })
        .collect();

    Ok(InterventionGraph {
        project_id,
        top_n,
        epsilon,
        nodes,
        edges,
    })
}

/// Rewrites `rank` for every runtime row of the project: 1 for the highest
/// theme-weighted score, ties broken by intervention id.
pub fn refresh_ranks(conn: &Connection, project_id: i64) -> AppResult<usize> {
    let ordered: Vec<i64> = {
        let mut stmt = conn.prepare(
            "SELECT intervention_id FROM runtime_scores
             WHERE project_id = ?1
             ORDER BY COALESCE(theme_weighted_effectiveness, 0) DESC, intervention_id",
        )?;
        let rows = stmt.query_map([project_id], |row| row.get::<_, i64>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        ids
    };

    let mut update = conn.prepare_cached(
        "UPDATE runtime_scores SET rank = ?3 WHERE project_id = ?1 AND intervention_id = ?2",
    )?;
    let mut updated = 0usize;
    for (position, intervention_id) in ordered.iter().enumerate() {
        updated += update.execute(params![project_id, intervention_id, position as i64 + 1])?;
    }
    Ok(updated)
}
