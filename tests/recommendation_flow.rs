use retrofit_engine::models::{
    CatalogBatch, NewIntervention, NewInterventionRule, NewMetricRule, NewTheme, StageRelation, StageRelationType,
};
use retrofit_engine::{init_tracing, AppError, Engine};
use std::collections::BTreeMap;

const TOLERANCE: f64 = 1e-9;

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < TOLERANCE,
        "expected {expected}, got {actual}"
    );
}

fn intervention(name: &str, theme_id: i64, base: f64, is_stage: bool) -> NewIntervention {
    NewIntervention {
        id: None,
        name: name.to_string(),
        theme_id,
        base_effectiveness: Some(base),
        cost_weight: None,
        is_stage,
        description: None,
    }
}

struct Catalog {
    wall: i64,
    glazing: i64,
    heat_pump: i64,
    boiler: i64,
}

fn seed_catalog(engine: &Engine) -> Catalog {
    engine
        .ingest_catalog(&CatalogBatch {
            themes: vec![
                NewTheme {
                    id: 1,
                    name: "Envelope".to_string(),
                    description: None,
                },
                NewTheme {
                    id: 2,
                    name: "Heating".to_string(),
                    description: Some("Space heating and hot water".to_string()),
                },
            ],
            interventions: vec![
                intervention("Wall insulation", 1, 0.6, false),
                intervention("Glazing upgrade", 1, 0.5, false),
                intervention("Heat pump", 2, 0.7, true),
                intervention("Gas boiler", 2, 0.3, false),
            ],
            ..CatalogBatch::default()
        })
        .expect("ingest catalog");

    let mut ids = BTreeMap::new();
    for row in engine.interventions().expect("interventions") {
        ids.insert(row.name, row.id);
    }
    let catalog = Catalog {
        wall: ids["Wall insulation"],
        glazing: ids["Glazing upgrade"],
        heat_pump: ids["Heat pump"],
        boiler: ids["Gas boiler"],
    };

    let summary = engine
        .ingest_catalog(&CatalogBatch {
            metric_rules: vec![NewMetricRule {
                metric_name: "opening_pct".to_string(),
                intervention_id: catalog.glazing,
                lower: Some(20.0),
                upper: Some(50.0),
                multiplier: 1.4,
                reasoning: Some("large openings lose heat".to_string()),
            }],
            intervention_rules: vec![NewInterventionRule {
                cause_intervention_id: catalog.wall,
                effect_intervention_id: catalog.heat_pump,
                metric_type: None,
                lower: None,
                upper: None,
                multiplier: 1.2,
                reasoning: None,
            }],
            stages: vec![
                StageRelation {
                    src_intervention_id: catalog.heat_pump,
                    dst_intervention_id: catalog.wall,
                    relation_type: StageRelationType::Prereq,
                },
                StageRelation {
                    src_intervention_id: catalog.heat_pump,
                    dst_intervention_id: catalog.boiler,
                    relation_type: StageRelationType::Mutex,
                },
            ],
            ..CatalogBatch::default()
        })
        .expect("ingest rules");
    assert_eq!(summary.metric_rules, 1);
    assert_eq!(summary.intervention_rules, 1);
    assert_eq!(summary.stages, 2);

    catalog
}

fn recommended(engine: &Engine, project_id: i64) -> Vec<i64> {
    engine
        .recommendations(project_id, None)
        .expect("recommendations")
        .into_iter()
        .map(|rec| rec.intervention_id)
        .collect()
}

#[test]
fn retrofit_project_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Engine::open(&dir.path().join("data").join("engine.db")).expect("open engine");
    let catalog = seed_catalog(&engine);
    let project = engine.create_project("Riverside depot").expect("project").id;

    let metrics = BTreeMap::from([
        ("opening_pct".to_string(), 35.0),
        ("levels".to_string(), 4.0),
        ("roof_pitch".to_string(), 30.0),
    ]);
    let scored = engine.metrics_changed(project, &metrics, false).expect("metrics");
    assert_eq!(scored.updated_rows, 1);
    assert_close(scored.scores[&catalog.glazing], 0.7);
    assert_close(scored.scores[&catalog.wall], 0.6);

    let weights = engine
        .weights_changed(project, &BTreeMap::from([(1, 1.0), (2, 1.0)]), false)
        .expect("weights");
    assert_close(weights.normalized[&1], 0.5);

    // Heat pump is gated on wall insulation.
    assert_eq!(
        recommended(&engine, project),
        vec![catalog.glazing, catalog.wall, catalog.boiler]
    );

    let applied = engine
        .intervention_applied(project, catalog.wall, false)
        .expect("apply wall insulation");
    assert!(applied.newly_implemented);
    assert!(applied.decayed);
    assert_close(applied.new_scores[&catalog.heat_pump], 0.84);

    assert_eq!(
        recommended(&engine, project),
        vec![catalog.heat_pump, catalog.glazing, catalog.boiler]
    );

    let views = engine.theme_weightings(project).expect("weightings");
    let envelope = views.iter().find(|view| view.theme_id == 1).expect("envelope");
    assert_close(envelope.weight_raw.expect("raw"), 0.6);
    assert_close(envelope.weight_norm.expect("norm"), 0.375);

    // A boiler rules the heat pump out.
    engine
        .intervention_applied(project, catalog.boiler, false)
        .expect("apply boiler");
    assert_eq!(recommended(&engine, project), vec![catalog.glazing]);

    let report = engine.implemented(project).expect("implemented");
    let names: Vec<&str> = report.iter().map(|entry| entry.name.as_str()).collect();
    assert_eq!(names, vec!["Wall insulation", "Gas boiler"]);
    assert_close(report[0].score.expect("wall score"), 0.3);

    let cost = engine.cost_level(project).expect("cost");
    assert_close(cost.total_cost_weight, 2.0);
    assert_eq!(cost.tokens, 2);

    let graph = engine.intervention_graph(project, None, None).expect("graph");
    assert_eq!(graph.nodes.len(), 4);
    assert_eq!(graph.edges.len(), 1);
    assert_eq!((graph.edges[0].src, graph.edges[0].dst), (catalog.wall, catalog.heat_pump));
    assert_close(graph.edges[0].weight, 0.2);

    assert!(engine.delete_project(project).expect("delete"));
    assert!(engine.runtime_scores(project).expect("scores").is_empty());
    assert!(engine.implemented(project).expect("implemented").is_empty());
}

#[test]
fn rejected_triggers_leave_state_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Engine::open(&dir.path().join("engine.db")).expect("open engine");
    let catalog = seed_catalog(&engine);
    let project = engine.create_project("Library").expect("project").id;
    engine
        .metrics_changed(project, &BTreeMap::from([("opening_pct".to_string(), 35.0)]), false)
        .expect("metrics");
    let before = engine.runtime_scores(project).expect("scores");

    let bad_metrics = BTreeMap::from([
        ("levels".to_string(), 3.0),
        ("opening_pct".to_string(), f64::INFINITY),
    ]);
    let err = engine.metrics_changed(project, &bad_metrics, false).expect_err("infinite metric");
    assert!(matches!(err, AppError::Validation(_)));
    let stored = engine.project_metrics(project).expect("metrics").expect("project");
    assert_eq!(stored.levels, None);

    let zero = engine.weights_changed(project, &BTreeMap::from([(1, 0.0), (2, 0.0)]), false);
    assert!(matches!(zero, Err(AppError::Validation(_))));

    let dry = engine
        .intervention_applied(project, catalog.wall, true)
        .expect("dry-run apply");
    assert!(dry.newly_implemented);
    assert!(engine.implemented(project).expect("implemented").is_empty());
    assert_eq!(engine.runtime_scores(project).expect("scores"), before);

    let bad_batch = CatalogBatch {
        metric_rules: vec![NewMetricRule {
            metric_name: "roof_pitch".to_string(),
            intervention_id: catalog.glazing,
            lower: None,
            upper: None,
            multiplier: 1.1,
            reasoning: None,
        }],
        ..CatalogBatch::default()
    };
    assert!(matches!(engine.ingest_catalog(&bad_batch), Err(AppError::Validation(_))));

    engine.clear_catalog().expect("clear catalog");
    assert!(engine.interventions().expect("interventions").is_empty());
    assert!(engine.runtime_scores(project).expect("scores").is_empty());
    assert!(engine.project(project).expect("project").is_some());
}

#[test]
fn tracing_installs_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log_dir = dir.path().join("logs");
    init_tracing(&log_dir).expect("first init");
    assert!(log_dir.exists());
    assert!(init_tracing(&log_dir).is_err());
}
