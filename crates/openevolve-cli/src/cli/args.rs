use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "openevolve",
    version,
    about = "LLM-guided evolutionary search over source programs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Write a starter config next to the current directory
    Init(InitArgs),
    /// Start a new run (errors if the run id already exists)
    Run(RunArgs),
    /// Continue an existing run from its last completed generation
    Resume(RunArgs),
    /// Summarise a run: generations, candidates, archive, meta-prompt fitness
    Inspect(InspectArgs),
    Version,
}

#[derive(Parser, Clone)]
pub struct InitArgs {
    #[arg(long, default_value = "evolve.yaml")]
    pub config: PathBuf,
}

#[derive(Parser, Clone)]
pub struct RunArgs {
    #[arg(long, default_value = "evolve.yaml")]
    pub config: PathBuf,

    /// Stable run identifier; generated from the clock when omitted
    #[arg(long)]
    pub run_id: Option<String>,

    /// Override the configured generation target
    #[arg(long)]
    pub generations: Option<i64>,
}

#[derive(Parser, Clone)]
pub struct InspectArgs {
    #[arg(long, default_value = "evolve.yaml")]
    pub config: PathBuf,

    #[arg(long)]
    pub run_id: String,
}
