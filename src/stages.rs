use crate::errors::{AppError, AppResult};
use crate::models::{Recommendation, StageRelation, StageRelationType};
use rusqlite::{params, Connection};
use std::str::FromStr;

/// Top `limit` scored interventions the project may take next, best adjusted
/// score first.
///
/// Implemented interventions never appear. A stage intervention is eligible
/// only when every prereq target is implemented and no mutex target is.
/// Ineligible rows are excluded outright, whatever their score.
pub fn recommendations(conn: &Connection, project_id: i64, limit: u32) -> AppResult<Vec<Recommendation>> {
    let mut stmt = conn.prepare_cached(
        "SELECT r.intervention_id, i.name, COALESCE(r.adjusted_base_effectiveness, 0) AS adjusted
         FROM runtime_scores r
         JOIN interventions i ON i.id = r.intervention_id
         WHERE r.project_id = ?1
           AND NOT EXISTS (
             SELECT 1 FROM implemented_interventions ii
             WHERE ii.project_id = ?1 AND ii.impl_id = r.intervention_id
           )
           AND (
             i.is_stage = 0
             OR (
               NOT EXISTS (
                 SELECT 1 FROM stages s
                 WHERE s.src_intervention_id = r.intervention_id
                   AND s.relation_type = 'prereq'
                   AND NOT EXISTS (
                     SELECT 1 FROM implemented_interventions ii
                     WHERE ii.project_id = ?1 AND ii.impl_id = s.dst_intervention_id
                   )
               )
               AND NOT EXISTS (
                 SELECT 1 FROM stages s
                 WHERE s.src_intervention_id = r.intervention_id
                   AND s.relation_type = 'mutex'
                   AND EXISTS (
                     SELECT 1 FROM implemented_interventions ii
                     WHERE ii.project_id = ?1 AND ii.impl_id = s.dst_intervention_id
                   )
               )
             )
           )
         ORDER BY adjusted DESC, r.intervention_id
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![project_id, limit], |row| {
        Ok(Recommendation {
            intervention_id: row.get(0)?,
            name: row.get(1)?,
            adjusted_base_effectiveness: row.get(2)?,
        })
    })?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

pub fn list_stage_relations(conn: &Connection) -> AppResult<Vec<StageRelation>> {
    let mut stmt = conn.prepare(
        "SELECT src_intervention_id, dst_intervention_id, relation_type
         FROM stages ORDER BY src_intervention_id, dst_intervention_id, relation_type",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;
    let mut result = Vec::new();
    for row in rows {
        let (src, dst, raw) = row?;
        let relation_type = StageRelationType::from_str(&raw)
            .map_err(|err| AppError::Internal(format!("stored stage relation is invalid: {}", err)))?;
        result.push(StageRelation {
            src_intervention_id: src,
            dst_intervention_id: dst,
            relation_type,
        });
    }
    Ok(result)
}
