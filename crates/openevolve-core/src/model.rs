use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Synthetic metric recorded when a cascade short-circuits or an evaluator
/// dies without emitting values.
pub const CASCADE_METRIC: &str = "__cascade__";
/// Synthetic metric recorded for patch/LLM-level rejections so a rejected
/// candidate always carries at least one failed row.
pub const SLOT_METRIC: &str = "__slot__";
/// Block name addressing the entire target file in a structured edit.
pub const WHOLE_FILE_BLOCK: &str = "__whole__";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub started_at: String,
    pub config_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub cand_id: String,
    pub run_id: String,
    pub parent_ids: Vec<String>,
    pub meta_prompt_id: String,
    pub filepath: String,
    pub patch: String,
    pub code_snapshot: String,
    pub gen: i64,
    pub novelty: f64,
    pub age: i64,
    pub created_at: String,
}

/// One metric row. `eval_id` is 0 until the store assigns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalRow {
    #[serde(default)]
    pub eval_id: i64,
    pub cand_id: String,
    pub metric: String,
    pub value: f64,
    pub passed: bool,
    pub cost_ms: i64,
    pub error: Option<String>,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaPrompt {
    pub meta_prompt_id: String,
    pub run_id: String,
    pub template: String,
    pub parent_ids: Vec<String>,
    pub created_at: String,
    pub last_used: String,
    pub fitness: f64,
}

/// Outcome of one slot, carried in event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    /// Every evaluation row passed; the candidate entered the Archive.
    Accepted,
    /// The patch never applied (parse/apply/LLM failure).
    Rejected,
    /// Applied but at least one evaluation row failed.
    Failed,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Accepted => "accepted",
            SlotStatus::Rejected => "rejected",
            SlotStatus::Failed => "failed",
        }
    }
}

/// Stable candidate id: identical seeded runs must produce identical id
/// sequences, so the id is derived from run position and patch content.
pub fn candidate_id(run_id: &str, gen: i64, slot: usize, patch: &str) -> String {
    let mut h = Sha256::new();
    h.update(run_id.as_bytes());
    h.update(b"|");
    h.update(gen.to_le_bytes());
    h.update(slot.to_le_bytes());
    h.update(b"|");
    h.update(patch.as_bytes());
    let hex = hex_of(&h.finalize());
    format!("c{}", &hex[..16])
}

/// Stable meta-prompt id derived from lineage and template text.
pub fn meta_prompt_id(run_id: &str, parent: &str, template: &str) -> String {
    let mut h = Sha256::new();
    h.update(run_id.as_bytes());
    h.update(b"|");
    h.update(parent.as_bytes());
    h.update(b"|");
    h.update(template.as_bytes());
    let hex = hex_of(&h.finalize());
    format!("m{}", &hex[..16])
}

fn hex_of(digest: &[u8]) -> String {
    let mut s = String::with_capacity(digest.len() * 2);
    for b in digest {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

pub fn encode_parents(parents: &[String]) -> String {
    parents.join(",")
}

pub fn decode_parents(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_ids_are_stable_and_distinct() {
        let a = candidate_id("run-1", 3, 0, "patch");
        let b = candidate_id("run-1", 3, 0, "patch");
        let c = candidate_id("run-1", 3, 1, "patch");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with('c'));
    }

    #[test]
    fn parent_encoding_round_trips() {
        let parents = vec!["c1".to_string(), "c2".to_string()];
        assert_eq!(decode_parents(&encode_parents(&parents)), parents);
        assert!(decode_parents("").is_empty());
    }
}
