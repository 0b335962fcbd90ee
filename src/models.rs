use crate::errors::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Scores keyed by intervention id.
pub type ScoreMap = BTreeMap<i64, f64>;

/// Building attributes that metric rules can key against. Each variant is a
/// numeric column on the `projects` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildingMetric {
    Levels,
    ExternalWallArea,
    FootprintArea,
    OpeningPct,
    WallToFloorRatio,
    FootprintGifa,
    GifaTotal,
    ExternalOpeningsArea,
    AvgHeightPerLevel,
}

impl BuildingMetric {
    pub const ALL: [BuildingMetric; 9] = [
        Self::Levels,
        Self::ExternalWallArea,
        Self::FootprintArea,
        Self::OpeningPct,
        Self::WallToFloorRatio,
        Self::FootprintGifa,
        Self::GifaTotal,
        Self::ExternalOpeningsArea,
        Self::AvgHeightPerLevel,
    ];

    /// Column name on `projects`, also the name used by rule rows.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Levels => "levels",
            Self::ExternalWallArea => "external_wall_area",
            Self::FootprintArea => "footprint_area",
            Self::OpeningPct => "opening_pct",
            Self::WallToFloorRatio => "wall_to_floor_ratio",
            Self::FootprintGifa => "footprint_gifa",
            Self::GifaTotal => "gifa_total",
            Self::ExternalOpeningsArea => "external_openings_area",
            Self::AvgHeightPerLevel => "avg_height_per_level",
        }
    }
}

impl FromStr for BuildingMetric {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        Self::ALL
            .into_iter()
            .find(|metric| metric.as_str() == trimmed)
            .ok_or_else(|| AppError::Validation(format!("Unknown building metric '{}'", raw)))
    }
}

/// Keys are the metric column names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectMetrics {
    pub levels: Option<f64>,
    pub external_wall_area: Option<f64>,
    pub footprint_area: Option<f64>,
    pub opening_pct: Option<f64>,
    pub wall_to_floor_ratio: Option<f64>,
    pub footprint_gifa: Option<f64>,
    pub gifa_total: Option<f64>,
    pub external_openings_area: Option<f64>,
    pub avg_height_per_level: Option<f64>,
}

impl ProjectMetrics {
    pub fn get(&self, metric: BuildingMetric) -> Option<f64> {
        match metric {
            BuildingMetric::Levels => self.levels,
            BuildingMetric::ExternalWallArea => self.external_wall_area,
            BuildingMetric::FootprintArea => self.footprint_area,
            BuildingMetric::OpeningPct => self.opening_pct,
            BuildingMetric::WallToFloorRatio => self.wall_to_floor_ratio,
            BuildingMetric::FootprintGifa => self.footprint_gifa,
            BuildingMetric::GifaTotal => self.gifa_total,
            BuildingMetric::ExternalOpeningsArea => self.external_openings_area,
            BuildingMetric::AvgHeightPerLevel => self.avg_height_per_level,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metrics: ProjectMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Theme {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intervention {
    pub id: i64,
    pub name: String,
    pub theme_id: i64,
    pub base_effectiveness: Option<f64>,
    pub cost_weight: f64,
    pub is_stage: bool,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRule {
    pub id: i64,
    pub metric: BuildingMetric,
    pub intervention_id: i64,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub multiplier: f64,
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Ratio,
    Percentage,
}

impl MetricType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ratio => "ratio",
            Self::Percentage => "percentage",
        }
    }
}

/// Cascade rule fired when `cause_intervention_id` is implemented.
///
/// `lower`/`upper` are carried for completeness of the stored row but are
/// never evaluated: cascades are unconditional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterventionEffectRule {
    pub id: i64,
    pub cause_intervention_id: i64,
    pub effect_intervention_id: i64,
    pub metric_type: Option<MetricType>,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub multiplier: f64,
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeScore {
    pub project_id: i64,
    pub intervention_id: i64,
    pub adjusted_base_effectiveness: Option<f64>,
    pub theme_weighted_effectiveness: Option<f64>,
    pub rank: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectThemeWeighting {
    pub project_id: i64,
    pub theme_id: i64,
    pub weight_raw: f64,
    pub weight_norm: f64,
    pub decay_steps: i64,
}

/// A theme joined with the project's stored weighting, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemeWeightView {
    pub theme_id: i64,
    pub name: String,
    pub weight_raw: Option<f64>,
    pub weight_norm: Option<f64>,
    pub decay_steps: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRelationType {
    /// src requires dst to be implemented first.
    Prereq,
    /// src is ineligible once dst is implemented.
    Mutex,
}

impl StageRelationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prereq => "prereq",
            Self::Mutex => "mutex",
        }
    }
}

impl FromStr for StageRelationType {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "prereq" => Ok(Self::Prereq),
            "mutex" => Ok(Self::Mutex),
            other => Err(AppError::Validation(format!("Unknown stage relation '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRelation {
    pub src_intervention_id: i64,
    pub dst_intervention_id: i64,
    pub relation_type: StageRelationType,
}

/// Serialised with the snake_case field names of the recommendation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub intervention_id: i64,
    pub name: String,
    pub adjusted_base_effectiveness: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImplementedEntry {
    pub intervention_id: i64,
    pub name: String,
    pub score: Option<f64>,
    pub implemented_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostLevel {
    pub total_cost_weight: f64,
    pub tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: i64,
    pub label: String,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub src: i64,
    pub dst: i64,
    /// Signed distance of the multiplier from 1.0.
    pub weight: f64,
    pub multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterventionGraph {
    pub project_id: i64,
    pub top_n: u32,
    pub epsilon: f64,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

// ─── Catalog rows ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTheme {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewIntervention {
    #[serde(default)]
    pub id: Option<i64>,
    pub name: String,
    pub theme_id: i64,
    #[serde(default)]
    pub base_effectiveness: Option<f64>,
    #[serde(default)]
    pub cost_weight: Option<f64>,
    #[serde(default)]
    pub is_stage: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMetricRule {
    pub metric_name: String,
    pub intervention_id: i64,
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
    pub multiplier: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewInterventionRule {
    pub cause_intervention_id: i64,
    pub effect_intervention_id: i64,
    #[serde(default)]
    pub metric_type: Option<MetricType>,
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
    pub multiplier: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogBatch {
    #[serde(default)]
    pub themes: Vec<NewTheme>,
    #[serde(default)]
    pub interventions: Vec<NewIntervention>,
    #[serde(default)]
    pub metric_rules: Vec<NewMetricRule>,
    #[serde(default)]
    pub intervention_rules: Vec<NewInterventionRule>,
    #[serde(default)]
    pub stages: Vec<StageRelation>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSummary {
    pub themes: usize,
    pub interventions: usize,
    pub metric_rules: usize,
    pub intervention_rules: usize,
    pub stages: usize,
}

// ─── Pipeline outcomes ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsOutcome {
    pub project_id: i64,
    pub updated_rows: usize,
    pub scores: ScoreMap,
    pub weighted_rows: Option<usize>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub project_id: i64,
    pub cause_intervention_id: i64,
    pub newly_implemented: bool,
    pub new_scores: ScoreMap,
    pub weighted_rows: Option<usize>,
    pub decayed: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightsOutcome {
    pub project_id: i64,
    pub updated: usize,
    pub sum_raw: f64,
    pub sum_norm: f64,
    pub normalized: BTreeMap<i64, f64>,
    pub weighted_rows: usize,
    pub dry_run: bool,
}

// ─── Settings ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub decay_alpha: f64,
    pub decay_floor: f64,
    pub decay_on_apply: bool,
    pub recommendation_limit: u32,
    pub cost_step_size: f64,
    pub graph_top_n: u32,
    pub graph_epsilon: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            decay_alpha: 0.6,
            decay_floor: 0.0,
            decay_on_apply: true,
            recommendation_limit: 3,
            cost_step_size: 1.0,
            graph_top_n: 30,
            graph_epsilon: 0.05,
        }
    }
}
