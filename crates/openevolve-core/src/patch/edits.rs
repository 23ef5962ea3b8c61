//! Structured search/replace edits: `{"diffs": [{"block", "search", "replace"}]}`.

use crate::config::Scope;
use crate::errors::EvolveError;
use crate::model::WHOLE_FILE_BLOCK;
use crate::patch::blocks::{extract_blocks, replace_block};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edit {
    pub block: String,
    #[serde(default)]
    pub search: String,
    #[serde(default)]
    pub replace: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    diffs: Vec<Edit>,
}

/// Parse a JSON body known to be a mapping with a `diffs` key.
pub fn parse_edits(body: &str) -> Result<Vec<Edit>, EvolveError> {
    let env: Envelope = serde_json::from_str(body)
        .map_err(|e| EvolveError::PatchParse(format!("bad diffs payload: {}", e)))?;
    Ok(env.diffs)
}

/// Apply edits in order. Each `search` must match exactly once in its target
/// region; an empty search replaces the region wholesale.
pub fn apply_edits(source: &str, edits: &[Edit], scope: Scope) -> Result<String, EvolveError> {
    let mut updated = source.to_string();
    for edit in edits {
        if edit.block == WHOLE_FILE_BLOCK {
            if scope == Scope::Blocks {
                return Err(EvolveError::PatchApply(
                    "whole-file edit attempted in block scope".into(),
                ));
            }
            updated = splice(&updated, &edit.search, &edit.replace, WHOLE_FILE_BLOCK)?;
            continue;
        }

        let blocks = extract_blocks(&updated)?;
        let block = blocks
            .iter()
            .find(|b| b.name == edit.block)
            .ok_or_else(|| {
                EvolveError::PatchApply(format!("block '{}' not found", edit.block))
            })?;
        let new_content = splice(&block.content, &edit.search, &edit.replace, &edit.block)?;
        updated = replace_block(&updated, block, &new_content);
    }
    Ok(updated)
}

fn splice(region: &str, search: &str, replace: &str, label: &str) -> Result<String, EvolveError> {
    if search.is_empty() {
        return Ok(replace.to_string());
    }
    match region.matches(search).count() {
        0 => Err(EvolveError::PatchApply(format!(
            "search text not found in '{}'",
            label
        ))),
        1 => Ok(region.replacen(search, replace, 1)),
        n => Err(EvolveError::PatchApply(format!(
            "ambiguous search in '{}': {} matches",
            label, n
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str =
        "# EVOLVE-BLOCK-START body\ntotal = 0\nreturn total\n# EVOLVE-BLOCK-END\n";

    #[test]
    fn parses_wire_format() {
        let edits =
            parse_edits(r#"{"diffs": [{"block": "body", "search": "a", "replace": "b"}]}"#)
                .unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].block, "body");
    }

    #[test]
    fn empty_diffs_is_identity() {
        let out = apply_edits(SOURCE, &[], Scope::Blocks).unwrap();
        assert_eq!(out, SOURCE);
    }

    #[test]
    fn single_match_replaces() {
        let edits = vec![Edit {
            block: "body".into(),
            search: "total = 0".into(),
            replace: "total = 1".into(),
        }];
        let out = apply_edits(SOURCE, &edits, Scope::Blocks).unwrap();
        assert!(out.contains("total = 1"));
        assert!(out.contains("EVOLVE-BLOCK-START body"));
    }

    #[test]
    fn ambiguous_search_is_rejected() {
        let src = "# EVOLVE-BLOCK-START b\nx = 1\nx = 1\n# EVOLVE-BLOCK-END\n";
        let edits = vec![Edit {
            block: "b".into(),
            search: "x = 1".into(),
            replace: "x = 2".into(),
        }];
        let err = apply_edits(src, &edits, Scope::Blocks).unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
    }

    #[test]
    fn missing_search_is_rejected() {
        let edits = vec![Edit {
            block: "body".into(),
            search: "nope".into(),
            replace: "x".into(),
        }];
        assert!(apply_edits(SOURCE, &edits, Scope::Blocks).is_err());
    }

    #[test]
    fn unknown_block_is_rejected() {
        let edits = vec![Edit {
            block: "ghost".into(),
            search: "".into(),
            replace: "x".into(),
        }];
        let err = apply_edits(SOURCE, &edits, Scope::Blocks).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn whole_file_requires_wholefile_scope() {
        let edits = vec![Edit {
            block: WHOLE_FILE_BLOCK.into(),
            search: "total = 0".into(),
            replace: "total = 9".into(),
        }];
        assert!(apply_edits(SOURCE, &edits, Scope::Blocks).is_err());
        let out = apply_edits(SOURCE, &edits, Scope::Wholefile).unwrap();
        assert!(out.contains("total = 9"));
    }

    #[test]
    fn empty_search_replaces_block_body() {
        let edits = vec![Edit {
            block: "body".into(),
            search: String::new(),
            replace: "return 42".into(),
        }];
        let out = apply_edits(SOURCE, &edits, Scope::Blocks).unwrap();
        assert!(out.contains("return 42"));
        assert!(!out.contains("total = 0"));
    }
}
