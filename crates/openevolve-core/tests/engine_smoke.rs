use openevolve_core::config::{
    ArchiveConfig, CascadeConfig, Direction, EvaluatorSpec, EvolutionConfig, EvolveConfig,
    LlmConfig, MetaPromptConfig, MetricSpec, SamplerConfig, Scope, SelectionConfig, TaskConfig,
};
use openevolve_core::engine::Engine;
use openevolve_core::model::SLOT_METRIC;
use openevolve_core::providers::llm::echo::EchoClient;
use openevolve_core::providers::llm::{LlmClient, LlmResponse};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

const PROGRAM: &str = "def sum_of_squares(values):\n    # EVOLVE-BLOCK-START body\n    return sum(v*v for v in values)\n    # EVOLVE-BLOCK-END\n";

fn base_config(dir: &Path, response: &str) -> EvolveConfig {
    let mut metrics = BTreeMap::new();
    metrics.insert(
        "correct".to_string(),
        MetricSpec {
            direction: Direction::Maximize,
            threshold: Some(1.0),
        },
    );
    EvolveConfig {
        task: TaskConfig {
            workdir: dir.to_path_buf(),
            target_file: "program.py".into(),
            description: "toy sum of squares".into(),
            evolve_blocks: None,
        },
        population_size: 1,
        generations: 1,
        metrics,
        selection: SelectionConfig::default(),
        sampler: SamplerConfig::default(),
        evolution: EvolutionConfig {
            scope: Scope::Blocks,
            apply_safe_revert: true,
            max_concurrent_slots: 2,
        },
        cascade: CascadeConfig {
            max_parallel: 2,
            cancel_on_fail: false,
            evaluators: vec![EvaluatorSpec {
                name: "tests".into(),
                command: vec![
                    "sh".into(),
                    "-c".into(),
                    "echo '{\"correct\": 1.0}'".into(),
                ],
                timeout_s: 10,
                retries: 0,
                stage: None,
            }],
        },
        meta_prompt: MetaPromptConfig::default(),
        archive: ArchiveConfig::default(),
        llm: LlmConfig {
            response: response.to_string(),
            ..LlmConfig::default()
        },
        seed: 42,
        db_path: dir.join("evolve.db"),
        artifacts_root: dir.join("runs"),
    }
}

fn echo(response: &str) -> Arc<dyn LlmClient> {
    Arc::new(EchoClient::new(response.to_string()))
}

#[tokio::test]
async fn seed_round_trip_accepts_identity_patch() -> anyhow::Result<()> {
    let dir = tempdir()?;
    std::fs::write(dir.path().join("program.py"), PROGRAM)?;
    let cfg = base_config(dir.path(), "{\"diffs\": []}");

    let mut engine = Engine::create(cfg, "t1".into(), echo("{\"diffs\": []}"))?;
    engine.run(1).await?;

    let store = engine.store();
    assert_eq!(store.latest_generation("t1")?, Some(1));

    let cands = store.list_candidates("t1", Some(1))?;
    assert_eq!(cands.len(), 1);
    assert_eq!(cands[0].code_snapshot, PROGRAM);

    let accepted = store.accepted_candidates("t1")?;
    assert_eq!(accepted.len(), 1);
    assert_eq!(engine.archive_size(), 1);

    // seed persisted at generation 0 with an empty parent list
    let seeds = store.list_candidates("t1", Some(0))?;
    assert_eq!(seeds.len(), 1);
    assert!(seeds[0].parent_ids.is_empty());
    assert_eq!(seeds[0].code_snapshot, PROGRAM);
    Ok(())
}

#[tokio::test]
async fn ambiguous_search_rejects_and_leaves_file_unchanged() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let program = "# EVOLVE-BLOCK-START b\nx = 1\nx = 1\n# EVOLVE-BLOCK-END\n";
    std::fs::write(dir.path().join("program.py"), program)?;
    let patch = r#"{"diffs": [{"block": "b", "search": "x = 1", "replace": "x = 2"}]}"#;
    let cfg = base_config(dir.path(), patch);

    let mut engine = Engine::create(cfg, "t2".into(), echo(patch))?;
    engine.run(1).await?;

    let store = engine.store();
    let cands = store.list_candidates("t2", Some(1))?;
    assert_eq!(cands.len(), 1);
    let evals = store.candidate_evals(&[cands[0].cand_id.clone()])?;
    let rows = &evals[&cands[0].cand_id];
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].metric, SLOT_METRIC);
    assert!(!rows[0].passed);
    assert!(rows[0].error.as_deref().unwrap().contains("patch_apply"));

    assert_eq!(std::fs::read_to_string(dir.path().join("program.py"))?, program);
    assert_eq!(engine.archive_size(), 0);
    Ok(())
}

struct FailingClient;

#[async_trait::async_trait]
impl LlmClient for FailingClient {
    async fn complete(&self, _prompt: &str) -> anyhow::Result<LlmResponse> {
        anyhow::bail!("backend unavailable")
    }
    fn provider_name(&self) -> &'static str {
        "failing"
    }
}

#[tokio::test]
async fn llm_error_becomes_rejected_candidate() -> anyhow::Result<()> {
    let dir = tempdir()?;
    std::fs::write(dir.path().join("program.py"), PROGRAM)?;
    let cfg = base_config(dir.path(), "");

    let mut engine = Engine::create(cfg, "t3".into(), Arc::new(FailingClient))?;
    engine.run(1).await?;

    let store = engine.store();
    let cands = store.list_candidates("t3", Some(1))?;
    assert_eq!(cands.len(), 1);
    assert!(cands[0].patch.is_empty());
    let evals = store.candidate_evals(&[cands[0].cand_id.clone()])?;
    let rows = &evals[&cands[0].cand_id];
    assert!(rows[0].error.as_deref().unwrap().contains("llm_error"));
    Ok(())
}

#[tokio::test]
async fn resume_continues_at_next_generation() -> anyhow::Result<()> {
    let dir = tempdir()?;
    std::fs::write(dir.path().join("program.py"), PROGRAM)?;
    let cfg = base_config(dir.path(), "{\"diffs\": []}");

    {
        let mut engine = Engine::create(cfg.clone(), "t4".into(), echo("{\"diffs\": []}"))?;
        engine.run(2).await?;
        assert_eq!(engine.store().latest_generation("t4")?, Some(2));
    }

    // re-creating the same run id must fail
    assert!(Engine::create(cfg.clone(), "t4".into(), echo("{\"diffs\": []}")).is_err());

    let mut engine = Engine::resume(cfg, "t4".into(), echo("{\"diffs\": []}"))?;
    assert_eq!(engine.archive_size(), 2);
    engine.run(3).await?;
    assert_eq!(engine.store().latest_generation("t4")?, Some(3));

    // seed + one candidate per generation, no duplicate cand_id errors
    let cands = engine.store().list_candidates("t4", None)?;
    assert_eq!(cands.len(), 4);
    Ok(())
}

#[tokio::test]
async fn identical_seeded_runs_are_identical() -> anyhow::Result<()> {
    let mut sequences = Vec::new();
    for _ in 0..2 {
        let dir = tempdir()?;
        std::fs::write(dir.path().join("program.py"), PROGRAM)?;
        let mut cfg = base_config(dir.path(), "{\"diffs\": []}");
        cfg.population_size = 2;

        let mut engine = Engine::create(cfg, "det".into(), echo("{\"diffs\": []}"))?;
        engine.run(2).await?;

        let cands = engine.store().list_candidates("det", None)?;
        // slot tasks race on wall-clock timestamps; compare (gen, cand_id)
        let mut ids: Vec<(i64, String)> =
            cands.iter().map(|c| (c.gen, c.cand_id.clone())).collect();
        ids.sort();
        sequences.push((ids, engine.archive_size()));
    }
    assert_eq!(sequences[0], sequences[1]);
    Ok(())
}

#[tokio::test]
async fn evaluator_timeout_records_cascade_row() -> anyhow::Result<()> {
    let dir = tempdir()?;
    std::fs::write(dir.path().join("program.py"), PROGRAM)?;
    let mut cfg = base_config(dir.path(), "{\"diffs\": []}");
    cfg.cascade.cancel_on_fail = true;
    cfg.cascade.evaluators = vec![EvaluatorSpec {
        name: "slow".into(),
        command: vec!["sh".into(), "-c".into(), "sleep 5".into()],
        timeout_s: 1,
        retries: 0,
        stage: None,
    }];

    let mut engine = Engine::create(cfg, "t5".into(), echo("{\"diffs\": []}"))?;
    engine.run(1).await?;

    let store = engine.store();
    let cands = store.list_candidates("t5", Some(1))?;
    let evals = store.candidate_evals(&[cands[0].cand_id.clone()])?;
    let rows = &evals[&cands[0].cand_id];
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].metric, "__cascade__");
    assert!(!rows[0].passed);
    assert_eq!(rows[0].cost_ms, 1000);
    assert_eq!(rows[0].error.as_deref(), Some("timeout"));
    assert_eq!(engine.archive_size(), 0);
    Ok(())
}
