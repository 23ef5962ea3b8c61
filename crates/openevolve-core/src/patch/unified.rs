//! Strict unified-diff application. Context lines must match byte-for-byte;
//! there is no fuzzy matching.

use crate::errors::EvolveError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone)]
struct Hunk {
    /// 1-based start line in the original file (0 for insert-only hunks at
    /// the top of an empty region).
    old_start: usize,
    lines: Vec<HunkLine>,
}

fn parse(diff: &str) -> Result<Vec<Hunk>, EvolveError> {
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut current: Option<Hunk> = None;

    for line in diff.lines() {
        if line.starts_with("---") || line.starts_with("+++") {
            continue;
        }
        if let Some(rest) = line.strip_prefix("@@") {
            if let Some(h) = current.take() {
                hunks.push(h);
            }
            current = Some(Hunk {
                old_start: parse_hunk_header(rest)?,
                lines: Vec::new(),
            });
            continue;
        }
        let Some(hunk) = current.as_mut() else {
            if line.trim().is_empty() {
                continue;
            }
            return Err(EvolveError::PatchParse(format!(
                "diff content before first hunk header: {:?}",
                line
            )));
        };
        if let Some(rest) = line.strip_prefix('+') {
            hunk.lines.push(HunkLine::Add(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix('-') {
            hunk.lines.push(HunkLine::Remove(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix(' ') {
            hunk.lines.push(HunkLine::Context(rest.to_string()));
        } else if line.is_empty() {
            hunk.lines.push(HunkLine::Context(String::new()));
        } else if line == "\\ No newline at end of file" {
            continue;
        } else {
            return Err(EvolveError::PatchParse(format!(
                "unrecognised diff line: {:?}",
                line
            )));
        }
    }
    if let Some(h) = current.take() {
        hunks.push(h);
    }
    if hunks.is_empty() {
        return Err(EvolveError::PatchParse("diff contains no hunks".into()));
    }
    Ok(hunks)
}

/// Parse `" -a,b +c,d @@"` returning the old start line.
fn parse_hunk_header(rest: &str) -> Result<usize, EvolveError> {
    let bad = || EvolveError::PatchParse(format!("malformed hunk header: @@{}", rest));
    let old = rest
        .split_whitespace()
        .find(|tok| tok.starts_with('-'))
        .ok_or_else(bad)?;
    let start_tok = old[1..].split(',').next().ok_or_else(bad)?;
    start_tok.parse::<usize>().map_err(|_| bad())
}

pub fn apply(source: &str, diff: &str) -> Result<String, EvolveError> {
    let hunks = parse(diff)?;
    let lines: Vec<&str> = source.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut idx = 0usize; // next unread line of the original

    for hunk in &hunks {
        let start = hunk.old_start.saturating_sub(1);
        if start < idx {
            return Err(EvolveError::PatchApply(
                "hunks out of order or overlapping".into(),
            ));
        }
        if start > lines.len() {
            return Err(EvolveError::PatchApply(format!(
                "hunk start {} beyond end of file ({} lines)",
                hunk.old_start,
                lines.len()
            )));
        }
        out.extend(lines[idx..start].iter().map(|s| s.to_string()));
        idx = start;

        for hl in &hunk.lines {
            match hl {
                HunkLine::Context(expected) => {
                    let got = lines.get(idx).ok_or_else(|| {
                        EvolveError::PatchApply("context extends beyond end of file".into())
                    })?;
                    if got != expected {
                        return Err(EvolveError::PatchApply(format!(
                            "context mismatch at line {}: expected {:?}, found {:?}",
                            idx + 1,
                            expected,
                            got
                        )));
                    }
                    out.push(expected.clone());
                    idx += 1;
                }
                HunkLine::Remove(expected) => {
                    let got = lines.get(idx).ok_or_else(|| {
                        EvolveError::PatchApply("removal extends beyond end of file".into())
                    })?;
                    if got != expected {
                        return Err(EvolveError::PatchApply(format!(
                            "removed line mismatch at line {}: expected {:?}, found {:?}",
                            idx + 1,
                            expected,
                            got
                        )));
                    }
                    idx += 1;
                }
                HunkLine::Add(text) => out.push(text.clone()),
            }
        }
    }

    out.extend(lines[idx..].iter().map(|s| s.to_string()));
    let mut joined = out.join("\n");
    if source.ends_with('\n') && !joined.is_empty() {
        joined.push('\n');
    }
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "a\nb\nc\nd\n";

    #[test]
    fn applies_simple_hunk() {
        let diff = "--- a/f\n+++ b/f\n@@ -2,2 +2,2 @@\n a\n-b\n+B\n c\n";
        // note: hunk says start 2 but context places 'a' there; strict match fails
        assert!(apply(SOURCE, diff).is_err());

        let diff = "--- a/f\n+++ b/f\n@@ -1,3 +1,3 @@\n a\n-b\n+B\n c\n";
        assert_eq!(apply(SOURCE, diff).unwrap(), "a\nB\nc\nd\n");
    }

    #[test]
    fn rejects_context_mismatch() {
        let diff = "@@ -1,2 +1,2 @@\n a\n-x\n+y\n";
        let err = apply(SOURCE, diff).unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }

    #[test]
    fn rejects_malformed_header() {
        let diff = "@@ nonsense @@\n a\n";
        assert!(matches!(
            apply(SOURCE, diff),
            Err(EvolveError::PatchParse(_))
        ));
    }

    #[test]
    fn applies_multiple_hunks_in_order() {
        let diff = "@@ -1,1 +1,1 @@\n-a\n+A\n@@ -4,1 +4,1 @@\n-d\n+D\n";
        assert_eq!(apply(SOURCE, diff).unwrap(), "A\nb\nc\nD\n");
    }

    #[test]
    fn insert_only_hunk() {
        let diff = "@@ -2,1 +2,2 @@\n b\n+b2\n";
        assert_eq!(apply(SOURCE, diff).unwrap(), "a\nb\nb2\nc\nd\n");
    }

    #[test]
    fn empty_diff_is_parse_error() {
        assert!(matches!(parse(""), Err(EvolveError::PatchParse(_))));
    }
}
