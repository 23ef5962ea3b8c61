use openevolve_core::config::Scope;
use openevolve_core::errors::EvolveError;
use openevolve_core::patch::PatchEngine;
use tempfile::tempdir;

const INITIAL: &str = "def sum_of_squares(values):\n    # EVOLVE-BLOCK-START body\n    total = 0\n    for v in values:\n        total += v * v\n    return total\n    # EVOLVE-BLOCK-END\n";

#[tokio::test]
async fn structured_edit_round_trip_is_bit_exact() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let target = dir.path().join("program.py");
    std::fs::write(&target, INITIAL)?;

    let engine = PatchEngine::new(target.clone(), Scope::Blocks);
    let patch = engine.parse(
        r#"{"diffs": [{"block": "body", "search": "total += v * v", "replace": "total += v ** 2"}]}"#,
    )?;

    let guard = engine.apply(&patch).await?;
    let applied = std::fs::read(&target)?;
    assert_eq!(applied, guard.new_source.as_bytes());
    assert!(guard.new_source.contains("v ** 2"));

    guard.revert()?;
    assert_eq!(std::fs::read(&target)?, INITIAL.as_bytes());
    Ok(())
}

#[tokio::test]
async fn unified_diff_applies_and_commits() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let target = dir.path().join("program.py");
    std::fs::write(&target, "a\nb\nc\n")?;

    let engine = PatchEngine::new(target.clone(), Scope::Wholefile);
    let patch = engine.parse("--- a/program.py\n+++ b/program.py\n@@ -1,3 +1,3 @@\n a\n-b\n+B\n c\n")?;
    let guard = engine.apply(&patch).await?;
    guard.commit();
    assert_eq!(std::fs::read_to_string(&target)?, "a\nB\nc\n");
    Ok(())
}

#[tokio::test]
async fn strict_context_mismatch_leaves_file_untouched() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let target = dir.path().join("program.py");
    std::fs::write(&target, "a\nb\nc\n")?;

    let engine = PatchEngine::new(target.clone(), Scope::Wholefile);
    let patch = engine.parse("@@ -1,2 +1,2 @@\n a\n-x\n+y\n")?;
    let err = engine.apply(&patch).await.unwrap_err();
    assert!(matches!(err, EvolveError::PatchApply(_)));
    assert_eq!(std::fs::read_to_string(&target)?, "a\nb\nc\n");
    Ok(())
}

#[tokio::test]
async fn fenced_json_patch_is_accepted() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let target = dir.path().join("program.py");
    std::fs::write(&target, INITIAL)?;

    let engine = PatchEngine::new(target.clone(), Scope::Blocks);
    let patch = engine.parse(
        "```json\n{\"diffs\": [{\"block\": \"body\", \"search\": \"total = 0\", \"replace\": \"total = 0  # acc\"}]}\n```",
    )?;
    let guard = engine.apply(&patch).await?;
    assert!(guard.new_source.contains("# acc"));
    guard.revert()?;
    Ok(())
}
