//! CLI argument parsing for the research memo workflow.
//!
//! The CLI is intentionally thin: commands route to the store, engine, and
//! executor without embedding policy, so the same core logic can be reused
//! as a library.
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Default storage root for passages and workflow runs.
pub const DEFAULT_DATA_DIR: &str = "./lexmemo_data";

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "lexmemo",
    version,
    about = "Citation-grounded legal research memos over your own documents",
    after_help = "Examples:\n  lexmemo ingest --document-id civ_code --title \"Civil Code\" --file code.txt\n  lexmemo query \"limitations period for breach of contract\" --top-k 5\n  lexmemo run create --owner ada --input research_question=\"Is the claim time-barred?\" \\\n      --input jurisdictions=California --input court_level=trial --input matter_posture=\"motion to dismiss\"\n  lexmemo run resume --run-id <ID>\n  lexmemo run advance --run-id <ID> --all\n  lexmemo export --run-id <ID> --out ./memo_out",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Storage root for passages, definitions, and runs
    #[arg(long, value_name = "DIR", default_value = DEFAULT_DATA_DIR, global = true)]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    Ingest(IngestArgs),
    Remove(RemoveArgs),
    Query(QueryArgs),
    Stats,
    #[command(subcommand)]
    Run(RunCommand),
    Export(ExportArgs),
}

/// Ingest a document into the passage store.
#[derive(Parser, Debug)]
#[command(about = "Chunk, embed, and store a document")]
pub struct IngestArgs {
    /// Stable identifier for the document
    #[arg(long, value_name = "ID")]
    pub document_id: String,

    /// Human-readable title carried into citations
    #[arg(long, value_name = "TITLE")]
    pub title: String,

    /// Path to the document text
    #[arg(long, value_name = "PATH")]
    pub file: PathBuf,
}

/// Remove every passage of a document.
#[derive(Parser, Debug)]
#[command(about = "Remove a document's passages from the store")]
pub struct RemoveArgs {
    /// Document identifier to remove
    #[arg(long, value_name = "ID")]
    pub document_id: String,
}

/// Similarity search over stored passages.
#[derive(Parser, Debug)]
#[command(about = "Search stored passages by semantic similarity")]
pub struct QueryArgs {
    /// Query text
    pub text: String,

    /// Number of passages to return
    #[arg(long, value_name = "N", default_value_t = 5)]
    pub top_k: usize,
}

/// Workflow run operations.
#[derive(Subcommand, Debug)]
pub enum RunCommand {
    Create(RunCreateArgs),
    Advance(RunAdvanceArgs),
    Resume(RunResumeArgs),
    Rerun(RunRerunArgs),
    Show(RunShowArgs),
    List(RunListArgs),
}

/// Create a workflow run.
#[derive(Parser, Debug)]
#[command(about = "Create a run of the litigation research memo workflow")]
pub struct RunCreateArgs {
    /// Owner recorded on the run
    #[arg(long, value_name = "NAME")]
    pub owner: String,

    /// Run input as key=value (repeatable)
    #[arg(long = "input", value_name = "KEY=VALUE")]
    pub inputs: Vec<String>,
}

/// Advance a run through its phases.
#[derive(Parser, Debug)]
#[command(about = "Execute the next phase (or all phases until input is needed)")]
pub struct RunAdvanceArgs {
    /// Run identifier
    #[arg(long, value_name = "ID")]
    pub run_id: String,

    /// Keep advancing until the run parks, fails, or completes
    #[arg(long)]
    pub all: bool,

    /// LM command override (defaults to LEXMEMO_LM_COMMAND)
    #[arg(long, value_name = "CMD")]
    pub lm: Option<String>,
}

/// Resolve a run parked on human input.
#[derive(Parser, Debug)]
#[command(about = "Provide human input to a parked run")]
pub struct RunResumeArgs {
    /// Run identifier
    #[arg(long, value_name = "ID")]
    pub run_id: String,

    /// Reviewer note (repeatable)
    #[arg(long = "note", value_name = "TEXT")]
    pub notes: Vec<String>,
}

/// Rerun a failed run from an earlier phase.
#[derive(Parser, Debug)]
#[command(about = "Discard results from a phase onward and rerun")]
pub struct RunRerunArgs {
    /// Run identifier
    #[arg(long, value_name = "ID")]
    pub run_id: String,

    /// Phase index to rerun from
    #[arg(long, value_name = "N")]
    pub phase: usize,

    /// Keep advancing after the reset
    #[arg(long)]
    pub all: bool,

    /// LM command override (defaults to LEXMEMO_LM_COMMAND)
    #[arg(long, value_name = "CMD")]
    pub lm: Option<String>,
}

/// Show a run as JSON.
#[derive(Parser, Debug)]
#[command(about = "Print the full run record as JSON")]
pub struct RunShowArgs {
    /// Run identifier
    #[arg(long, value_name = "ID")]
    pub run_id: String,
}

/// List runs.
#[derive(Parser, Debug)]
#[command(about = "List runs, newest first")]
pub struct RunListArgs {
    /// Only runs owned by this name
    #[arg(long, value_name = "NAME")]
    pub owner: Option<String>,
}

/// Export a completed run's memo bundle.
#[derive(Parser, Debug)]
#[command(about = "Write memo.md and report.json for a completed run")]
pub struct ExportArgs {
    /// Run identifier
    #[arg(long, value_name = "ID")]
    pub run_id: String,

    /// Output directory
    #[arg(long, value_name = "DIR")]
    pub out: PathBuf,
}

/// Parse repeatable `key=value` inputs into a map.
pub fn parse_inputs(
    pairs: &[String],
) -> Result<std::collections::BTreeMap<String, String>, String> {
    let mut map = std::collections::BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(format!("input must be key=value, got: {pair}"));
        };
        map.insert(key.trim().to_string(), value.to_string());
    }
    Ok(map)
}
