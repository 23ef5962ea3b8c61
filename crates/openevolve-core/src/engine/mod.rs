//! Generational orchestrator.
//!
//! One generation: sample templates and parents, assemble prompts, call the
//! LLM per slot (concurrently, semaphore-bounded), apply patches under the
//! run-scoped file lock, evaluate, persist transactionally, then fold results
//! into the Archive and meta-prompt pool.

use crate::archive::Archive;
use crate::cascade::{CascadeResult, EvaluatorCascade};
use crate::config::EvolveConfig;
use crate::errors::EvolveError;
use crate::events::{stamp, EventLog, GenerationEvent, SlotEvent};
use crate::meta_prompt::MetaPromptPool;
use crate::model::{
    candidate_id, now_rfc3339, Candidate, EvalRow, SlotStatus, SLOT_METRIC,
};
use crate::patch::PatchEngine;
use crate::providers::llm::LlmClient;
use crate::sampler::{self, Exemplar, FailureCase, PromptInputs};
use crate::storage::Store;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

pub struct Engine {
    cfg: EvolveConfig,
    run_id: String,
    store: Store,
    llm: Arc<dyn LlmClient>,
    patcher: Arc<PatchEngine>,
    cascade: Arc<EvaluatorCascade>,
    archive: Archive,
    pool: MetaPromptPool,
    events: Arc<EventLog>,
    run_dir: PathBuf,
    rng: StdRng,
    shutdown: Arc<AtomicBool>,
}

#[derive(Debug, Clone)]
struct SlotPlan {
    slot: usize,
    meta_prompt_id: String,
    parents: Vec<String>,
    prompt: String,
    /// Target contents at planning time, used as the snapshot for rejected
    /// candidates.
    current_code: String,
}

#[derive(Debug)]
struct SlotResult {
    slot: usize,
    candidate: Candidate,
    status: SlotStatus,
    error: Option<String>,
    metrics: BTreeMap<String, f64>,
}

impl Engine {
    /// Start a fresh run. Refuses to re-create an existing `run_id`.
    pub fn create(
        cfg: EvolveConfig,
        run_id: String,
        llm: Arc<dyn LlmClient>,
    ) -> Result<Self, EvolveError> {
        let store = Store::open(&cfg.db_path)?;
        store.init_schema()?;
        if store.get_run(&run_id)?.is_some() {
            return Err(EvolveError::Store(format!(
                "run '{}' already exists; use resume",
                run_id
            )));
        }
        let config_json = serde_json::to_string(&cfg)
            .map_err(|e| EvolveError::Config(format!("config not serialisable: {}", e)))?;
        store.create_run(&run_id, &config_json)?;

        let run_dir = cfg.artifacts_root.join(&run_id);
        std::fs::create_dir_all(&run_dir)
            .map_err(|e| EvolveError::Config(format!("failed to create run dir: {}", e)))?;
        std::fs::write(run_dir.join("config.json"), &config_json)
            .map_err(|e| EvolveError::Config(format!("failed to mirror config: {}", e)))?;

        let mut engine = Self::assemble(cfg, run_id, store, llm, run_dir)?;
        engine.insert_seed_candidate()?;
        Ok(engine)
    }

    /// Continue an existing run from its highest persisted generation.
    pub fn resume(
        cfg: EvolveConfig,
        run_id: String,
        llm: Arc<dyn LlmClient>,
    ) -> Result<Self, EvolveError> {
        let store = Store::open(&cfg.db_path)?;
        store.init_schema()?;
        if store.get_run(&run_id)?.is_none() {
            return Err(EvolveError::Store(format!("run '{}' does not exist", run_id)));
        }
        let run_dir = cfg.artifacts_root.join(&run_id);
        std::fs::create_dir_all(&run_dir)
            .map_err(|e| EvolveError::Config(format!("failed to create run dir: {}", e)))?;

        let mut engine = Self::assemble(cfg, run_id, store, llm, run_dir)?;
        engine.rebuild_archive()?;
        Ok(engine)
    }

    fn assemble(
        cfg: EvolveConfig,
        run_id: String,
        store: Store,
        llm: Arc<dyn LlmClient>,
        run_dir: PathBuf,
    ) -> Result<Self, EvolveError> {
        let events = Arc::new(
            EventLog::open(&run_dir.join("events.jsonl"))
                .map_err(|e| EvolveError::Config(format!("failed to open event log: {}", e)))?,
        );
        let patcher = Arc::new(
            PatchEngine::new(cfg.task.target_path(), cfg.evolution.scope)
                .with_allowed_blocks(cfg.task.evolve_blocks.clone()),
        );
        let cascade = Arc::new(EvaluatorCascade::new(
            cfg.cascade.clone(),
            cfg.metrics.clone(),
        ));
        let archive = Archive::new(
            cfg.archive.capacity,
            cfg.archive.k_novelty,
            cfg.archive.ageing_threshold,
            cfg.metrics
                .iter()
                .map(|(k, v)| (k.clone(), v.direction))
                .collect(),
        );
        let pool = MetaPromptPool::bootstrap(store.clone(), run_id.clone(), cfg.meta_prompt.clone())?;
        let rng = StdRng::seed_from_u64(cfg.seed);

        Ok(Self {
            cfg,
            run_id,
            store,
            llm,
            patcher,
            cascade,
            archive,
            pool,
            events,
            run_dir,
            rng,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag polled between generations and before each slot; in-flight slots
    /// commit or revert cleanly before the engine returns.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn archive_size(&self) -> usize {
        self.archive.len()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The seed candidate records the task's initial file at generation 0.
    /// It carries no evaluation rows, so it never enters the Archive.
    fn insert_seed_candidate(&mut self) -> Result<(), EvolveError> {
        let snapshot = std::fs::read_to_string(self.cfg.task.target_path()).map_err(|e| {
            EvolveError::Config(format!(
                "failed to read target {}: {}",
                self.cfg.task.target_path().display(),
                e
            ))
        })?;
        let seed_meta = self.pool.active()[0].meta_prompt_id.clone();
        let cand = Candidate {
            cand_id: candidate_id(&self.run_id, 0, 0, ""),
            run_id: self.run_id.clone(),
            parent_ids: Vec::new(),
            meta_prompt_id: seed_meta,
            filepath: self.cfg.task.target_file.display().to_string(),
            patch: String::new(),
            code_snapshot: snapshot,
            gen: 0,
            novelty: 0.0,
            age: 0,
            created_at: now_rfc3339(),
        };
        self.store.insert_candidate_with_evals(&cand, &[])
    }

    fn rebuild_archive(&mut self) -> Result<(), EvolveError> {
        for (cand, metrics) in self.store.accepted_candidates(&self.run_id)? {
            self.archive.insert(
                cand.cand_id,
                metrics.into_iter().collect(),
                cand.created_at,
            );
        }
        Ok(())
    }

    /// Run generations until `max(generation)` reaches `target` or shutdown.
    pub async fn run(&mut self, target: i64) -> Result<(), EvolveError> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                tracing::info!(run_id = %self.run_id, "shutdown requested, stopping between generations");
                return Ok(());
            }
            let latest = self.store.latest_generation(&self.run_id)?.unwrap_or(0);
            if latest >= target {
                return Ok(());
            }
            self.step().await?;
        }
    }

    /// Execute one generation as an atomic unit.
    pub async fn step(&mut self) -> Result<(), EvolveError> {
        let gen = self.store.latest_generation(&self.run_id)?.unwrap_or(0) + 1;
        let gen_dir = self.run_dir.join(format!("gen_{:03}", gen));
        std::fs::create_dir_all(&gen_dir)
            .map_err(|e| EvolveError::Config(format!("failed to create gen dir: {}", e)))?;

        tracing::info!(run_id = %self.run_id, generation = gen, "starting generation");

        let plans = self.plan_slots(&gen_dir)?;

        // Slots run concurrently up to the configured bound; each awaits its
        // LLM call independently, while apply -> evaluate -> settle is
        // serialised by the patch engine's run lock.
        let sem = Arc::new(Semaphore::new(self.cfg.evolution.max_concurrent_slots));
        let mut handles = Vec::with_capacity(plans.len());
        for plan in plans {
            let sem = sem.clone();
            let shutdown = self.shutdown.clone();
            let store = self.store.clone();
            let llm = self.llm.clone();
            let patcher = self.patcher.clone();
            let cascade = self.cascade.clone();
            let cfg = self.cfg.clone();
            let run_id = self.run_id.clone();
            let gen_dir = gen_dir.clone();
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore closed");
                if shutdown.load(Ordering::Relaxed) {
                    return Ok(None);
                }
                run_slot(plan, gen, store, llm, patcher, cascade, cfg, run_id, gen_dir)
                    .await
                    .map(Some)
            }));
        }

        let mut results: Vec<SlotResult> = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Ok(Some(result))) => results.push(result),
                Ok(Ok(None)) => {} // skipped on shutdown
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(EvolveError::Store(format!("slot task failed: {}", e))),
            }
        }

        // Single-writer archive/pool updates, applied in slot order so
        // identical seeded runs converge on identical archives.
        results.sort_by_key(|r| r.slot);
        let mut accepted = 0usize;
        let mut rejected = 0usize;
        let mut failed = 0usize;
        for result in &results {
            let reward = if result.status == SlotStatus::Accepted {
                accepted += 1;
                let outcome = self.archive.insert(
                    result.candidate.cand_id.clone(),
                    result.metrics.clone(),
                    result.candidate.created_at.clone(),
                );
                1.0 / (1.0 + outcome.rank_at_insertion as f64)
            } else {
                match result.status {
                    SlotStatus::Rejected => rejected += 1,
                    _ => failed += 1,
                }
                0.0
            };
            self.pool
                .attribute(&result.candidate.meta_prompt_id, reward)?;

            self.events
                .append(&SlotEvent {
                    ts: stamp(),
                    run_id: self.run_id.clone(),
                    generation: gen,
                    slot: result.slot,
                    cand_id: result.candidate.cand_id.clone(),
                    status: result.status.as_str(),
                    error: result.error.clone(),
                    metrics: result.metrics.clone(),
                })
                .map_err(|e| EvolveError::Store(format!("event log write failed: {}", e)))?;
        }

        // Opportunistically persist the archive's recomputed view.
        for entry in self.archive.entries() {
            self.store
                .update_archive_view(&entry.cand_id, entry.novelty, entry.age)?;
        }

        self.write_generation_summary(gen, &gen_dir, &results)?;
        self.events
            .append(&GenerationEvent {
                ts: stamp(),
                run_id: self.run_id.clone(),
                generation: gen,
                accepted,
                rejected,
                failed,
                archive_size: self.archive.len(),
            })
            .map_err(|e| EvolveError::Store(format!("event log write failed: {}", e)))?;

        tracing::info!(
            run_id = %self.run_id,
            generation = gen,
            accepted,
            rejected,
            failed,
            archive_size = self.archive.len(),
            "generation complete"
        );
        Ok(())
    }

    /// Sequential, seeded planning: template and parent draws consume the
    /// master RNG in slot order, which keeps candidate sequences reproducible.
    fn plan_slots(&mut self, gen_dir: &PathBuf) -> Result<Vec<SlotPlan>, EvolveError> {
        let current_code = std::fs::read_to_string(self.cfg.task.target_path()).map_err(|e| {
            EvolveError::Config(format!("failed to read target: {}", e))
        })?;
        let target_rel = self.cfg.task.target_file.display().to_string();
        let metric_names: Vec<String> = self.cfg.metrics.keys().cloned().collect();

        let elites = self.exemplars_by_rank(self.cfg.sampler.elites_k)?;
        let novel = self.exemplars_by_novelty(self.cfg.sampler.novel_m)?;
        let failures: Vec<FailureCase> = self
            .store
            .recent_failures(&self.run_id, self.cfg.sampler.include_failures)?
            .into_iter()
            .map(|(cand, error)| FailureCase {
                cand_id: cand.cand_id,
                patch: cand.patch,
                error,
            })
            .collect();

        let mut plans = Vec::with_capacity(self.cfg.population_size);
        for slot in 0..self.cfg.population_size {
            let template = self.pool.sample(&mut self.rng)?;
            let parents = self.archive.sample_mixture(
                self.cfg.selection.elite,
                self.cfg.selection.novel,
                self.cfg.selection.young,
                &mut self.rng,
            );
            let prompt = sampler::build_prompt(
                self.cfg.sampler.budget_tokens,
                &PromptInputs {
                    meta_template: &template.template,
                    task_description: &self.cfg.task.description,
                    target_file: &target_rel,
                    current_code: &current_code,
                    metrics: &metric_names,
                    elites: &elites,
                    novel: &novel,
                    failures: &failures,
                },
            )?;
            std::fs::write(gen_dir.join(format!("slot_{:02}_prompt.txt", slot)), &prompt)
                .map_err(|e| EvolveError::Config(format!("failed to mirror prompt: {}", e)))?;
            plans.push(SlotPlan {
                slot,
                meta_prompt_id: template.meta_prompt_id,
                parents,
                prompt,
                current_code: current_code.clone(),
            });
        }
        Ok(plans)
    }

    fn exemplars_by_rank(&self, k: usize) -> Result<Vec<Exemplar>, EvolveError> {
        let mut ordered: Vec<_> = self.archive.entries().iter().collect();
        ordered.sort_by(|a, b| {
            a.rank
                .cmp(&b.rank)
                .then_with(|| a.insertion_order().cmp(&b.insertion_order()))
                .then_with(|| a.cand_id.cmp(&b.cand_id))
        });
        self.load_exemplars(ordered.into_iter().take(k))
    }

    fn exemplars_by_novelty(&self, m: usize) -> Result<Vec<Exemplar>, EvolveError> {
        let mut ordered: Vec<_> = self.archive.entries().iter().collect();
        ordered.sort_by(|a, b| {
            b.novelty
                .total_cmp(&a.novelty)
                .then_with(|| a.insertion_order().cmp(&b.insertion_order()))
                .then_with(|| a.cand_id.cmp(&b.cand_id))
        });
        self.load_exemplars(ordered.into_iter().take(m))
    }

    fn load_exemplars<'a, I>(&self, entries: I) -> Result<Vec<Exemplar>, EvolveError>
    where
        I: Iterator<Item = &'a crate::archive::ArchiveEntry>,
    {
        let mut out = Vec::new();
        for entry in entries {
            let Some(cand) = self.store.get_candidate(&entry.cand_id)? else {
                continue;
            };
            out.push(Exemplar {
                cand_id: cand.cand_id,
                gen: cand.gen,
                novelty: entry.novelty,
                metrics: entry.metrics.clone(),
                patch: cand.patch,
                snapshot_excerpt: sampler::snapshot_excerpt(&cand.code_snapshot, 12),
            });
        }
        Ok(out)
    }

    fn write_generation_summary(
        &self,
        gen: i64,
        gen_dir: &PathBuf,
        results: &[SlotResult],
    ) -> Result<(), EvolveError> {
        let slots: Vec<serde_json::Value> = results
            .iter()
            .map(|r| {
                serde_json::json!({
                    "slot": r.slot,
                    "cand_id": r.candidate.cand_id,
                    "status": r.status.as_str(),
                    "error": r.error,
                    "metrics": r.metrics,
                })
            })
            .collect();
        let summary = serde_json::json!({
            "generation": gen,
            "archive_size": self.archive.len(),
            "slots": slots,
        });
        std::fs::write(
            gen_dir.join("summary.json"),
            serde_json::to_string_pretty(&summary).expect("summary serialises"),
        )
        .map_err(|e| EvolveError::Config(format!("failed to write summary: {}", e)))
    }
}

/// One prompt -> patch -> evaluate attempt. Non-fatal errors become rejected
/// candidate records; only store and revert failures propagate.
#[allow(clippy::too_many_arguments)]
async fn run_slot(
    plan: SlotPlan,
    gen: i64,
    store: Store,
    llm: Arc<dyn LlmClient>,
    patcher: Arc<PatchEngine>,
    cascade: Arc<EvaluatorCascade>,
    cfg: EvolveConfig,
    run_id: String,
    gen_dir: PathBuf,
) -> Result<SlotResult, EvolveError> {
    let llm_outcome = tokio::time::timeout(
        Duration::from_secs(cfg.llm.timeout_s),
        llm.complete(&plan.prompt),
    )
    .await;

    let (patch_text, llm_error) = match llm_outcome {
        Err(_) => (String::new(), Some(EvolveError::LlmTimeout(cfg.llm.timeout_s))),
        Ok(Err(e)) => (String::new(), Some(EvolveError::Llm(e.to_string()))),
        Ok(Ok(resp)) => (resp.text, None),
    };

    if let Some(err) = llm_error {
        return persist_rejected(&plan, gen, &store, &cfg, &run_id, &gen_dir, patch_text, err);
    }

    let patch = match patcher.parse(&patch_text) {
        Ok(p) => p,
        Err(err) => {
            return persist_rejected(&plan, gen, &store, &cfg, &run_id, &gen_dir, patch_text, err)
        }
    };

    // Lock held for the whole snapshot -> apply -> evaluate -> settle span.
    let guard = match patcher.apply(&patch).await {
        Ok(g) => g,
        Err(err) if err.is_fatal() => return Err(err),
        Err(err) => {
            return persist_rejected(&plan, gen, &store, &cfg, &run_id, &gen_dir, patch_text, err)
        }
    };

    let snapshot = guard.new_source.clone();
    let cascade_result: CascadeResult = cascade.run(patcher.target()).await;
    let accepted = !cascade.is_empty() && cascade_result.accepted();

    if accepted || !cfg.evolution.apply_safe_revert {
        guard.commit();
    } else {
        guard.revert()?; // PatchRevertError is fatal
    }

    let cand_id = candidate_id(&run_id, gen, plan.slot, &patch_text);
    let mut rows: Vec<EvalRow> = cascade_result
        .rows
        .iter()
        .map(|o| EvalRow {
            eval_id: 0,
            cand_id: cand_id.clone(),
            metric: o.metric.clone(),
            value: o.value,
            passed: o.passed,
            cost_ms: o.cost_ms,
            error: o.error.clone(),
            created_at: String::new(),
        })
        .collect();
    // An empty cascade cannot accept anything; mark the gap explicitly.
    if rows.is_empty() {
        rows.push(EvalRow {
            eval_id: 0,
            cand_id: cand_id.clone(),
            metric: SLOT_METRIC.to_string(),
            value: 0.0,
            passed: false,
            cost_ms: 0,
            error: Some("no evaluators configured".to_string()),
            created_at: String::new(),
        });
    }

    let candidate = Candidate {
        cand_id: cand_id.clone(),
        run_id: run_id.clone(),
        parent_ids: plan.parents.clone(),
        meta_prompt_id: plan.meta_prompt_id.clone(),
        filepath: cfg.task.target_file.display().to_string(),
        patch: patch_text.clone(),
        code_snapshot: snapshot.clone(),
        gen,
        novelty: 0.0,
        age: 0,
        created_at: now_rfc3339(),
    };
    store.insert_candidate_with_evals(&candidate, &rows)?;
    mirror_slot(&gen_dir, plan.slot, &patch_text, &snapshot);

    let metrics: BTreeMap<String, f64> = cascade_result
        .rows
        .iter()
        .filter(|o| o.error.is_none())
        .map(|o| (o.metric.clone(), o.value))
        .collect();
    let status = if accepted {
        SlotStatus::Accepted
    } else {
        SlotStatus::Failed
    };
    let error = cascade_result
        .rows
        .iter()
        .find_map(|o| o.error.clone());

    Ok(SlotResult {
        slot: plan.slot,
        candidate,
        status,
        error,
        metrics,
    })
}

/// Record a slot that never produced an applied patch: one synthetic
/// evaluation row keeps the acceptance rule uniform.
#[allow(clippy::too_many_arguments)]
fn persist_rejected(
    plan: &SlotPlan,
    gen: i64,
    store: &Store,
    cfg: &EvolveConfig,
    run_id: &str,
    gen_dir: &PathBuf,
    patch_text: String,
    err: EvolveError,
) -> Result<SlotResult, EvolveError> {
    if err.is_fatal() {
        return Err(err);
    }
    let cand_id = candidate_id(run_id, gen, plan.slot, &patch_text);
    let message = truncate(&err.to_string(), 200);
    let candidate = Candidate {
        cand_id: cand_id.clone(),
        run_id: run_id.to_string(),
        parent_ids: plan.parents.clone(),
        meta_prompt_id: plan.meta_prompt_id.clone(),
        filepath: cfg.task.target_file.display().to_string(),
        patch: patch_text.clone(),
        code_snapshot: plan.current_code.clone(),
        gen,
        novelty: 0.0,
        age: 0,
        created_at: now_rfc3339(),
    };
    let rows = vec![EvalRow {
        eval_id: 0,
        cand_id: cand_id.clone(),
        metric: SLOT_METRIC.to_string(),
        value: 0.0,
        passed: false,
        cost_ms: 0,
        error: Some(format!("{}: {}", err.tag(), message)),
        created_at: String::new(),
    }];
    store.insert_candidate_with_evals(&candidate, &rows)?;
    mirror_slot(gen_dir, plan.slot, &patch_text, &plan.current_code);
    tracing::warn!(run_id, generation = gen, slot = plan.slot, error = %message, "slot rejected");

    Ok(SlotResult {
        slot: plan.slot,
        candidate,
        status: SlotStatus::Rejected,
        error: Some(err.tag().to_string()),
        metrics: BTreeMap::new(),
    })
}

/// Advisory mirrors of the store, for human inspection.
fn mirror_slot(gen_dir: &PathBuf, slot: usize, patch: &str, snapshot: &str) {
    let _ = std::fs::write(gen_dir.join(format!("slot_{:02}_patch.txt", slot)), patch);
    let _ = std::fs::write(gen_dir.join(format!("slot_{:02}_snapshot.txt", slot)), snapshot);
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}
