//! Budgeted long-context prompt assembly.
//!
//! Section order is fixed: meta-prompt header, task description, current
//! code, then exemplar rounds (one elite, one novel, one failure) until the
//! next exemplar would exceed the budget. The current code is never
//! truncated.

use crate::errors::EvolveError;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Approximate token count: bytes / 4, rounded up.
pub fn approx_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

#[derive(Debug, Clone)]
pub struct Exemplar {
    pub cand_id: String,
    pub gen: i64,
    pub novelty: f64,
    pub metrics: BTreeMap<String, f64>,
    pub patch: String,
    pub snapshot_excerpt: String,
}

#[derive(Debug, Clone)]
pub struct FailureCase {
    pub cand_id: String,
    pub patch: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub meta_template: &'a str,
    pub task_description: &'a str,
    pub target_file: &'a str,
    pub current_code: &'a str,
    pub metrics: &'a [String],
    pub elites: &'a [Exemplar],
    pub novel: &'a [Exemplar],
    pub failures: &'a [FailureCase],
}

const RESPONSE_FOOTER: &str = r#"Respond with a patch and nothing else. Preferred format is a JSON object:
{"diffs": [{"block": "<name or __whole__>", "search": "<verbatim text>", "replace": "<new text>"}]}
Each search must match exactly once. A standard unified diff against the
target file is also accepted. Do not include commentary or backticks."#;

pub fn build_prompt(budget_tokens: usize, inputs: &PromptInputs<'_>) -> Result<String, EvolveError> {
    let code_section = format!(
        "Current `{}`:\n```\n{}\n```",
        inputs.target_file, inputs.current_code
    );
    let code_tokens = approx_tokens(&code_section);
    if code_tokens > budget_tokens {
        return Err(EvolveError::PromptTooLarge {
            needed: code_tokens,
            budget: budget_tokens,
        });
    }

    let mut header = String::new();
    let _ = writeln!(header, "{}", inputs.meta_template.trim());
    let _ = writeln!(header);
    let _ = writeln!(
        header,
        "You are improving `{}`. Task: {}",
        inputs.target_file,
        if inputs.task_description.is_empty() {
            "(no description)"
        } else {
            inputs.task_description
        }
    );
    if !inputs.metrics.is_empty() {
        let _ = writeln!(header, "Metrics optimised: {}", inputs.metrics.join(", "));
    }

    let mut sections = vec![header.trim_end().to_string(), code_section];
    let mut used: usize = sections.iter().map(|s| approx_tokens(s)).sum();
    used += approx_tokens(RESPONSE_FOOTER);

    // Interleave exemplar pools round-robin; stop at the first exemplar that
    // would blow the budget.
    let rounds = inputs
        .elites
        .len()
        .max(inputs.novel.len())
        .max(inputs.failures.len());
    'rounds: for i in 0..rounds {
        let mut batch: Vec<String> = Vec::new();
        if let Some(e) = inputs.elites.get(i) {
            batch.push(format_exemplar("Elite exemplar", e));
        }
        if let Some(e) = inputs.novel.get(i) {
            batch.push(format_exemplar("Novel exemplar", e));
        }
        if let Some(f) = inputs.failures.get(i) {
            batch.push(format_failure(f));
        }
        for section in batch {
            let cost = approx_tokens(&section);
            if used + cost > budget_tokens {
                break 'rounds;
            }
            used += cost;
            sections.push(section);
        }
    }

    sections.push(RESPONSE_FOOTER.to_string());
    Ok(sections.join("\n\n"))
}

fn format_exemplar(label: &str, e: &Exemplar) -> String {
    let metrics = if e.metrics.is_empty() {
        "no metrics".to_string()
    } else {
        e.metrics
            .iter()
            .map(|(k, v)| format!("{}={:.3}", k, v))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let patch = if e.patch.trim().is_empty() {
        "<empty>"
    } else {
        e.patch.trim()
    };
    format!(
        "[{label}] candidate {} (gen {}, novelty {:.3})\nMetrics: {}\nPatch:\n{}\nSnapshot:\n{}",
        e.cand_id, e.gen, e.novelty, metrics, patch, e.snapshot_excerpt
    )
}

fn format_failure(f: &FailureCase) -> String {
    let patch = if f.patch.trim().is_empty() {
        "<empty>"
    } else {
        f.patch.trim()
    };
    format!(
        "[Failed attempt] candidate {}\nPatch:\n{}\nError: {}",
        f.cand_id, patch, f.error
    )
}

/// First lines of a snapshot for exemplar context.
pub fn snapshot_excerpt(snapshot: &str, max_lines: usize) -> String {
    snapshot
        .lines()
        .take(max_lines)
        .collect::<Vec<_>>()
        .join("\n")
}
