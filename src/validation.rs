use crate::errors::{AppError, AppResult};
use crate::models::EngineSettings;
use std::collections::BTreeMap;

const MAX_RECOMMENDATION_LIMIT: u32 = 500;
const MAX_GRAPH_NODES: u32 = 1_000;

/// Checks a theme weight payload and returns the raw sum.
///
/// The whole batch is rejected on the first bad entry so nothing is written
/// for a partially valid payload.
pub fn validate_weights(weights: &BTreeMap<i64, f64>) -> AppResult<f64> {
    let mut total = 0.0;
    for (theme_id, weight) in weights {
        if !weight.is_finite() {
            return Err(AppError::Validation(format!(
                "Weight for theme {} must be a finite number",
                theme_id
            )));
        }
        if *weight < 0.0 {
            return Err(AppError::Validation(format!(
                "Weight for theme {} must be >= 0 (got {})",
                theme_id, weight
            )));
        }
        total += weight;
    }

    if total <= 0.0 {
        return Err(AppError::Validation("Sum of weights must be > 0".to_string()));
    }
    Ok(total)
}

pub fn validate_metric_value(name: &str, value: f64) -> AppResult<()> {
    if !value.is_finite() {
        return Err(AppError::Validation(format!(
            "Metric '{}' must be a finite number",
            name
        )));
    }
    Ok(())
}

pub fn validate_decay(alpha: f64, floor: f64) -> AppResult<()> {
    if !(alpha.is_finite() && alpha > 0.0 && alpha < 1.0) {
        return Err(AppError::Validation(format!(
            "Decay alpha {} must lie strictly between 0 and 1",
            alpha
        )));
    }
    if !(floor.is_finite() && floor >= 0.0) {
        return Err(AppError::Validation(format!(
            "Decay floor {} must be a finite value >= 0",
            floor
        )));
    }
    Ok(())
}

pub fn validate_multiplier(multiplier: f64) -> AppResult<()> {
    if !(multiplier.is_finite() && multiplier > 0.0) {
        return Err(AppError::Validation(format!(
            "Rule multiplier {} must be a finite value > 0",
            multiplier
        )));
    }
    Ok(())
}

/// Either bound may be open; when both are set the range must be non-empty.
pub fn validate_bounds(lower: Option<f64>, upper: Option<f64>) -> AppResult<()> {
    for bound in [lower, upper].into_iter().flatten() {
        if !bound.is_finite() {
            return Err(AppError::Validation(format!(
                "Rule bound {} must be a finite number",
                bound
            )));
        }
    }
    if let (Some(lower), Some(upper)) = (lower, upper) {
        if upper <= lower {
            return Err(AppError::Validation(format!(
                "Upper bound {} must be greater than lower bound {}",
                upper, lower
            )));
        }
    }
    Ok(())
}

pub fn validate_recommendation_limit(limit: u32) -> AppResult<()> {
    if !(1..=MAX_RECOMMENDATION_LIMIT).contains(&limit) {
        return Err(AppError::Validation(format!(
            "Recommendation limit {} is out of allowed range (1..={})",
            limit, MAX_RECOMMENDATION_LIMIT
        )));
    }
    Ok(())
}

pub fn validate_graph_request(top_n: u32, epsilon: f64) -> AppResult<()> {
    if !(1..=MAX_GRAPH_NODES).contains(&top_n) {
        return Err(AppError::Validation(format!(
            "Graph node cap {} is out of allowed range (1..={})",
            top_n, MAX_GRAPH_NODES
        )));
    }
    if !(epsilon.is_finite() && epsilon >= 0.0) {
        return Err(AppError::Validation(format!(
            "Graph epsilon {} must be >= 0",
            epsilon
        )));
    }
    Ok(())
}

pub fn validate_settings(settings: &EngineSettings) -> AppResult<()> {
    validate_decay(settings.decay_alpha, settings.decay_floor)?;

    validate_recommendation_limit(settings.recommendation_limit)?;

    if !(settings.cost_step_size.is_finite() && settings.cost_step_size > 0.0) {
        return Err(AppError::Validation(format!(
            "Cost step size {} must be > 0",
            settings.cost_step_size
        )));
    }

    validate_graph_request(settings.graph_top_n, settings.graph_epsilon)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        validate_bounds, validate_decay, validate_graph_request, validate_recommendation_limit,
        validate_settings, validate_weights,
    };
    use crate::models::EngineSettings;
    use std::collections::BTreeMap;

    #[test]
    fn rejects_negative_and_zero_sum_weights() {
        let negative = BTreeMap::from([(1, 2.0), (2, -0.5)]);
        assert!(validate_weights(&negative).expect_err("negative").is_validation());

        let zero = BTreeMap::from([(1, 0.0), (2, 0.0)]);
        assert!(validate_weights(&zero).expect_err("zero sum").is_validation());

        assert!(validate_weights(&BTreeMap::new()).is_err());
        assert!(validate_weights(&BTreeMap::from([(1, f64::NAN)])).is_err());

        let total = validate_weights(&BTreeMap::from([(1, 2.0), (2, 1.0)])).expect("valid");
        assert_eq!(total, 3.0);
    }

    #[test]
    fn decay_parameters_must_shrink() {
        assert!(validate_decay(0.6, 0.0).is_ok());
        assert!(validate_decay(1.0, 0.0).is_err());
        assert!(validate_decay(0.0, 0.0).is_err());
        assert!(validate_decay(0.6, -0.1).is_err());
    }

    #[test]
    fn bounds_require_a_non_empty_range() {
        assert!(validate_bounds(None, None).is_ok());
        assert!(validate_bounds(Some(1.0), None).is_ok());
        assert!(validate_bounds(Some(1.0), Some(2.0)).is_ok());
        assert!(validate_bounds(Some(2.0), Some(2.0)).is_err());
        assert!(validate_bounds(Some(3.0), Some(2.0)).is_err());
    }

    #[test]
    fn limits_and_graph_requests_are_capped() {
        assert!(validate_recommendation_limit(1).is_ok());
        assert!(validate_recommendation_limit(0).is_err());
        assert!(validate_recommendation_limit(501).is_err());
        assert!(validate_graph_request(30, 0.0).is_ok());
        assert!(validate_graph_request(0, 0.05).is_err());
        assert!(validate_graph_request(30, f64::NAN).is_err());
    }

    #[test]
    fn rejects_out_of_bounds_settings() {
        assert!(validate_settings(&EngineSettings::default()).is_ok());

        let bad_limit = EngineSettings {
            recommendation_limit: 0,
            ..EngineSettings::default()
        };
        assert!(validate_settings(&bad_limit).is_err());

        let bad_step = EngineSettings {
            cost_step_size: 0.0,
            ..EngineSettings::default()
        };
        assert!(validate_settings(&bad_step).is_err());
    }
}
