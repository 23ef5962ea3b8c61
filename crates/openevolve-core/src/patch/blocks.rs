//! EVOLVE block extraction and replacement.
//!
//! Markers are literal substrings on the trimmed line, so they work with any
//! comment syntax: `# EVOLVE-BLOCK-START name`, `// EVOLVE-BLOCK-START name`,
//! and so on.

use crate::errors::EvolveError;

pub const BLOCK_START: &str = "EVOLVE-BLOCK-START";
pub const BLOCK_END: &str = "EVOLVE-BLOCK-END";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvolveBlock {
    pub name: String,
    /// Line index of the start marker.
    pub start_line: usize,
    /// Line index of the end marker.
    pub end_line: usize,
    pub content: String,
}

/// Extract all evolve blocks, rejecting nested or unbalanced markers.
pub fn extract_blocks(source: &str) -> Result<Vec<EvolveBlock>, EvolveError> {
    let lines: Vec<&str> = source.lines().collect();
    let mut blocks = Vec::new();
    let mut active_start: Option<usize> = None;
    let mut block_name = String::new();
    let mut body: Vec<&str> = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if let Some(pos) = trimmed.find(BLOCK_START) {
            if active_start.is_some() {
                return Err(EvolveError::PatchApply(format!(
                    "nested block marker at line {}",
                    idx + 1
                )));
            }
            active_start = Some(idx);
            body.clear();
            let rest = trimmed[pos + BLOCK_START.len()..].trim();
            block_name = match rest.split_whitespace().next() {
                Some(name) => name.to_string(),
                None => format!("block_{}", blocks.len()),
            };
            continue;
        }
        if trimmed.contains(BLOCK_END) {
            let Some(start) = active_start.take() else {
                return Err(EvolveError::PatchApply(format!(
                    "unmatched block end marker at line {}",
                    idx + 1
                )));
            };
            blocks.push(EvolveBlock {
                name: std::mem::take(&mut block_name),
                start_line: start,
                end_line: idx,
                content: body.join("\n"),
            });
            body.clear();
            continue;
        }
        if active_start.is_some() {
            body.push(line);
        }
    }

    if active_start.is_some() {
        return Err(EvolveError::PatchApply(
            "unterminated block marker at end of file".into(),
        ));
    }
    Ok(blocks)
}

/// Replace a block's body, keeping both marker lines in place.
pub fn replace_block(source: &str, block: &EvolveBlock, new_content: &str) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    out.extend_from_slice(&lines[..=block.start_line]);
    let replacement: Vec<&str> = new_content.trim_end_matches('\n').lines().collect();
    out.extend(replacement);
    out.extend_from_slice(&lines[block.end_line..]);
    let mut joined = out.join("\n");
    if source.ends_with('\n') {
        joined.push('\n');
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "def f(values):\n    # EVOLVE-BLOCK-START body\n    total = 0\n    for v in values:\n        total += v * v\n    return total\n    # EVOLVE-BLOCK-END\n";

    #[test]
    fn extracts_named_block() {
        let blocks = extract_blocks(SOURCE).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].name, "body");
        assert!(blocks[0].content.contains("total += v * v"));
        assert_eq!(blocks[0].start_line, 1);
        assert_eq!(blocks[0].end_line, 6);
    }

    #[test]
    fn marker_works_with_any_comment_prefix() {
        let src = "// EVOLVE-BLOCK-START loop\nx += 1;\n// EVOLVE-BLOCK-END\n";
        let blocks = extract_blocks(src).unwrap();
        assert_eq!(blocks[0].name, "loop");
        assert_eq!(blocks[0].content, "x += 1;");
    }

    #[test]
    fn rejects_nested_blocks() {
        let src = "# EVOLVE-BLOCK-START a\n# EVOLVE-BLOCK-START b\n# EVOLVE-BLOCK-END\n";
        let err = extract_blocks(src).unwrap_err();
        assert!(matches!(err, EvolveError::PatchApply(_)));
    }

    #[test]
    fn rejects_unterminated_block() {
        let src = "# EVOLVE-BLOCK-START a\nx = 1\n";
        assert!(extract_blocks(src).is_err());
    }

    #[test]
    fn rejects_stray_end() {
        let src = "x = 1\n# EVOLVE-BLOCK-END\n";
        assert!(extract_blocks(src).is_err());
    }

    #[test]
    fn replace_keeps_markers_and_trailing_newline() {
        let blocks = extract_blocks(SOURCE).unwrap();
        let updated = replace_block(SOURCE, &blocks[0], "    return sum(v * v for v in values)");
        assert!(updated.contains("EVOLVE-BLOCK-START body"));
        assert!(updated.contains("EVOLVE-BLOCK-END"));
        assert!(updated.contains("return sum(v * v for v in values)"));
        assert!(!updated.contains("total = 0"));
        assert!(updated.ends_with('\n'));
    }

    #[test]
    fn unnamed_block_gets_positional_name() {
        let src = "# EVOLVE-BLOCK-START\nx = 1\n# EVOLVE-BLOCK-END\n";
        let blocks = extract_blocks(src).unwrap();
        assert_eq!(blocks[0].name, "block_0");
    }
}
