//! Staged evaluator execution in isolated child processes.
//!
//! Stages run sequentially; evaluators within a stage run concurrently up to
//! `max_parallel`. Timeouts are wall-clock and enforced by killing the child.

use crate::config::{CascadeConfig, Direction, EvaluatorSpec, MetricSpec};
use crate::model::CASCADE_METRIC;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// One metric outcome; the engine turns these into evaluation rows.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOutcome {
    pub metric: String,
    pub value: f64,
    pub passed: bool,
    pub cost_ms: i64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CascadeResult {
    pub rows: Vec<EvalOutcome>,
    /// True when `cancel_on_fail` aborted siblings and skipped later stages.
    pub short_circuited: bool,
}

impl CascadeResult {
    /// A candidate is accepted iff it has at least one row and every row
    /// passed.
    pub fn accepted(&self) -> bool {
        !self.rows.is_empty() && self.rows.iter().all(|r| r.passed)
    }
}

/// Evaluator death without metric values: timeout, spawn failure, non-zero
/// exit or unparseable output.
#[derive(Debug, Clone)]
struct EvalFailure {
    error: String,
    cost_ms: i64,
}

pub struct EvaluatorCascade {
    cfg: CascadeConfig,
    metrics: BTreeMap<String, MetricSpec>,
}

impl EvaluatorCascade {
    pub fn new(cfg: CascadeConfig, metrics: BTreeMap<String, MetricSpec>) -> Self {
        Self { cfg, metrics }
    }

    pub fn is_empty(&self) -> bool {
        self.cfg.evaluators.is_empty()
    }

    /// Group evaluators into ordered stages: items sharing an explicit
    /// `stage` value run together; unlabelled items each form their own
    /// stage in list order.
    fn stages(&self) -> Vec<Vec<EvaluatorSpec>> {
        let mut keyed: BTreeMap<(u32, u32), Vec<EvaluatorSpec>> = BTreeMap::new();
        for (idx, ev) in self.cfg.evaluators.iter().enumerate() {
            let key = match ev.stage {
                Some(s) => (s, 0),
                None => (idx as u32, 1),
            };
            keyed.entry(key).or_default().push(ev.clone());
        }
        keyed.into_values().collect()
    }

    pub async fn run(&self, candidate_path: &Path) -> CascadeResult {
        let mut rows: Vec<EvalOutcome> = Vec::new();
        let mut failures: Vec<EvalFailure> = Vec::new();
        let mut short_circuited = false;

        let sem = Arc::new(Semaphore::new(self.cfg.max_parallel.max(1)));

        'stages: for stage in self.stages() {
            let mut set: JoinSet<(usize, Result<Vec<EvalOutcome>, EvalFailure>)> = JoinSet::new();
            for (idx, ev) in stage.into_iter().enumerate() {
                let sem = sem.clone();
                let path = candidate_path.to_path_buf();
                let thresholds = self.metrics.clone();
                set.spawn(async move {
                    let _permit = sem.acquire_owned().await.expect("semaphore closed");
                    (idx, run_evaluator(&ev, &path, &thresholds).await)
                });
            }

            let mut stage_results: Vec<(usize, Result<Vec<EvalOutcome>, EvalFailure>)> = Vec::new();
            let mut cancelled = false;
            while let Some(joined) = set.join_next().await {
                let Ok((idx, result)) = joined else {
                    // Join errors only occur on abort; those tasks are
                    // intentionally discarded.
                    continue;
                };
                let failed = match &result {
                    Ok(outcomes) => outcomes.iter().any(|o| !o.passed),
                    Err(_) => true,
                };
                stage_results.push((idx, result));
                if failed && self.cfg.cancel_on_fail {
                    set.abort_all();
                    while set.join_next().await.is_some() {}
                    cancelled = true;
                    break;
                }
            }
            collect_stage(stage_results, &mut rows, &mut failures);
            if cancelled {
                short_circuited = true;
                break 'stages;
            }
        }

        if !failures.is_empty() || short_circuited {
            let first = failures.first();
            rows.push(EvalOutcome {
                metric: CASCADE_METRIC.to_string(),
                value: 0.0,
                passed: false,
                cost_ms: first.map(|f| f.cost_ms).unwrap_or(0),
                error: Some(
                    first
                        .map(|f| f.error.clone())
                        .unwrap_or_else(|| "cascade cancelled".to_string()),
                ),
            });
        }

        CascadeResult {
            rows,
            short_circuited,
        }
    }
}

/// Deterministic in-stage ordering for persisted rows.
fn collect_stage(
    mut results: Vec<(usize, Result<Vec<EvalOutcome>, EvalFailure>)>,
    rows: &mut Vec<EvalOutcome>,
    failures: &mut Vec<EvalFailure>,
) {
    results.sort_by_key(|(idx, _)| *idx);
    for (_, result) in results {
        match result {
            Ok(outcomes) => rows.extend(outcomes),
            Err(f) => failures.push(f),
        }
    }
}

/// Launch the evaluator command with the candidate path appended, enforcing
/// the wall-clock timeout and the retry budget. Only the last attempt's
/// outcome survives; cost accumulates across attempts.
async fn run_evaluator(
    spec: &EvaluatorSpec,
    candidate_path: &Path,
    thresholds: &BTreeMap<String, MetricSpec>,
) -> Result<Vec<EvalOutcome>, EvalFailure> {
    let attempts = spec.retries + 1;
    let mut total_cost: i64 = 0;
    let mut last_failure: Option<String> = None;

    for _ in 0..attempts {
        match run_once(spec, candidate_path).await {
            Ok((values, elapsed_ms)) => {
                total_cost += elapsed_ms;
                return Ok(score(values, total_cost, thresholds));
            }
            Err(f) => {
                total_cost += f.cost_ms;
                last_failure = Some(f.error);
            }
        }
    }

    Err(EvalFailure {
        error: last_failure.unwrap_or_else(|| "evaluator failed".to_string()),
        cost_ms: total_cost,
    })
}

async fn run_once(
    spec: &EvaluatorSpec,
    candidate_path: &Path,
) -> Result<(serde_json::Map<String, serde_json::Value>, i64), EvalFailure> {
    let timeout_ms = (spec.timeout_s * 1000) as i64;
    let program = &spec.command[0];
    let args: Vec<&String> = spec.command[1..].iter().collect();
    let path_arg: PathBuf = candidate_path.to_path_buf();

    let start = Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .arg(&path_arg)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| EvalFailure {
            error: format!("spawn failed: {}", e),
            cost_ms: 0,
        })?;

    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");

    let waited = tokio::time::timeout(Duration::from_secs(spec.timeout_s), async {
        let mut out = String::new();
        let mut err = String::new();
        let read_out = stdout.read_to_string(&mut out);
        let read_err = stderr.read_to_string(&mut err);
        let (_, _) = tokio::try_join!(read_out, read_err)?;
        let status = child.wait().await?;
        std::io::Result::Ok((status, out, err))
    })
    .await;

    match waited {
        Err(_elapsed) => {
            // graceful first, then forceful
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(EvalFailure {
                error: "timeout".to_string(),
                cost_ms: timeout_ms,
            })
        }
        Ok(Err(e)) => Err(EvalFailure {
            error: format!("io error: {}", e),
            cost_ms: start.elapsed().as_millis() as i64,
        }),
        Ok(Ok((status, out, err))) => {
            let elapsed = start.elapsed().as_millis() as i64;
            if !status.success() {
                let tail: String = err.lines().last().unwrap_or("").chars().take(200).collect();
                return Err(EvalFailure {
                    error: format!("exit status {}: {}", status.code().unwrap_or(-1), tail),
                    cost_ms: elapsed,
                });
            }
            let parsed: serde_json::Value =
                serde_json::from_str(out.trim()).map_err(|e| EvalFailure {
                    error: format!("bad evaluator output: {}", e),
                    cost_ms: elapsed,
                })?;
            let map = parsed.as_object().cloned().ok_or_else(|| EvalFailure {
                error: "evaluator output is not a JSON object".to_string(),
                cost_ms: elapsed,
            })?;
            Ok((map, elapsed))
        }
    }
}

/// Threshold check per metric; a non-numeric value fails the whole result.
fn score(
    values: serde_json::Map<String, serde_json::Value>,
    cost_ms: i64,
    thresholds: &BTreeMap<String, MetricSpec>,
) -> Vec<EvalOutcome> {
    let mut rows = Vec::with_capacity(values.len());
    for (metric, value) in values {
        match value.as_f64() {
            Some(v) => {
                let passed = match thresholds.get(&metric).and_then(|s| s.threshold) {
                    Some(t) => match thresholds[&metric].direction {
                        Direction::Maximize => v >= t,
                        Direction::Minimize => v <= t,
                    },
                    None => true,
                };
                rows.push(EvalOutcome {
                    metric,
                    value: v,
                    passed,
                    cost_ms,
                    error: None,
                });
            }
            None => rows.push(EvalOutcome {
                metric,
                value: 0.0,
                passed: false,
                cost_ms,
                error: Some("non-numeric metric value".to_string()),
            }),
        }
    }
    rows
}
