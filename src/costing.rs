use crate::errors::AppResult;
use crate::models::CostLevel;
use rusqlite::Connection;

/// Sums the cost weight of the project's implemented interventions and
/// converts it into whole cost tokens of `step_size` each.
pub fn cost_level(conn: &Connection, project_id: i64, step_size: f64) -> AppResult<CostLevel> {
    let total_cost_weight: f64 = conn.query_row(
        "SELECT COALESCE(SUM(i.cost_weight), 0)
         FROM implemented_interventions ii
         JOIN interventions i ON i.id = ii.impl_id
         WHERE ii.project_id = ?1",
        [project_id],
        |row| row.get(0),
    )?;

    Ok(CostLevel {
        total_cost_weight,
        tokens: tokens_for(total_cost_weight, step_size),
    })
}

fn tokens_for(total: f64, step_size: f64) -> u64 {
    if !(step_size > 0.0) || !total.is_finite() || total <= 0.0 {
        return 0;
    }
    (total / step_size).floor() as u64
}
