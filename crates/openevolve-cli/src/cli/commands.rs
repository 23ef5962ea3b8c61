use super::args::*;
use openevolve_core::config::{load_config, write_sample_config};
use openevolve_core::engine::Engine;
use openevolve_core::providers::llm::client_from_config;
use openevolve_core::storage::Store;
use std::sync::atomic::Ordering;

pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const RUN_FAILED: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::Init(args) => cmd_init(args),
        Command::Run(args) => cmd_run(args, false).await,
        Command::Resume(args) => cmd_run(args, true).await,
        Command::Inspect(args) => cmd_inspect(args),
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(args: InitArgs) -> anyhow::Result<i32> {
    if args.config.exists() {
        eprintln!("note: {} already exists (skipped)", args.config.display());
        return Ok(exit_codes::OK);
    }
    write_sample_config(&args.config)?;
    eprintln!("created {}", args.config.display());
    Ok(exit_codes::OK)
}

async fn cmd_run(args: RunArgs, resume: bool) -> anyhow::Result<i32> {
    let cfg = match load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };

    let run_id = match (&args.run_id, resume) {
        (Some(id), _) => id.clone(),
        (None, true) => {
            eprintln!("config error: resume requires --run-id");
            return Ok(exit_codes::CONFIG_ERROR);
        }
        (None, false) => format!("run-{}", chrono::Utc::now().format("%Y%m%d%H%M%S")),
    };

    let llm = client_from_config(&cfg.llm)?;
    let target = args.generations.unwrap_or(cfg.generations);

    let mut engine = if resume {
        Engine::resume(cfg, run_id.clone(), llm)?
    } else {
        Engine::create(cfg, run_id.clone(), llm)?
    };

    // ctrl-c stops between slots; in-flight work settles cleanly
    let shutdown = engine.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, finishing in-flight slots");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    match engine.run(target).await {
        Ok(()) => {
            let latest = engine
                .store()
                .latest_generation(&run_id)?
                .unwrap_or(0);
            println!(
                "run {} at generation {} (archive size {})",
                run_id,
                latest,
                engine.archive_size()
            );
            Ok(exit_codes::OK)
        }
        Err(e) => {
            eprintln!("run failed: {}", e);
            Ok(exit_codes::RUN_FAILED)
        }
    }
}

fn cmd_inspect(args: InspectArgs) -> anyhow::Result<i32> {
    let cfg = match load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };
    let store = Store::open(&cfg.db_path)?;
    store.init_schema()?;

    let Some(run) = store.get_run(&args.run_id)? else {
        eprintln!("run '{}' not found", args.run_id);
        return Ok(exit_codes::CONFIG_ERROR);
    };

    println!("run {} (started {})", run.run_id, run.started_at);
    let latest = store.latest_generation(&run.run_id)?.unwrap_or(0);
    println!("latest generation: {}", latest);

    let candidates = store.list_candidates(&run.run_id, None)?;
    let ids: Vec<String> = candidates.iter().map(|c| c.cand_id.clone()).collect();
    let evals = store.candidate_evals(&ids)?;
    let accepted = store.accepted_candidates(&run.run_id)?;
    println!(
        "candidates: {} total, {} accepted",
        candidates.len(),
        accepted.len()
    );

    for cand in &candidates {
        let rows = evals.get(&cand.cand_id);
        let status = match rows {
            Some(rows) if !rows.is_empty() => {
                if rows.iter().all(|r| r.passed) {
                    "accepted".to_string()
                } else {
                    let tag = rows
                        .iter()
                        .find_map(|r| r.error.as_deref())
                        .unwrap_or("failed");
                    format!("failed ({})", tag)
                }
            }
            _ if cand.gen == 0 => "seed".to_string(),
            _ => "unevaluated".to_string(),
        };
        println!(
            "  gen {:>3}  {}  {}  parents=[{}]",
            cand.gen,
            cand.cand_id,
            status,
            cand.parent_ids.join(", ")
        );
    }

    println!("meta-prompts by fitness:");
    for mp in store.list_meta_prompts(&run.run_id)? {
        let first_line = mp.template.lines().next().unwrap_or("");
        println!(
            "  {:.4}  {}  {}",
            mp.fitness,
            mp.meta_prompt_id,
            truncate(first_line, 60)
        );
    }
    Ok(exit_codes::OK)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}
