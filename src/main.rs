use anyhow::{Context, Result};
use clap::Parser;
use lexmemo::cli::{
    parse_inputs, Command, ExportArgs, IngestArgs, QueryArgs, RemoveArgs, RootArgs, RunCommand,
};
use lexmemo::embed::HttpEmbedder;
use lexmemo::engine::WorkflowEngine;
use lexmemo::executor::Executor;
use lexmemo::export::write_bundle;
use lexmemo::lm::LmCommand;
use lexmemo::model::{WorkflowRun, WorkflowStatus};
use lexmemo::phases::litigation_memo_definition;
use lexmemo::store::PassageStore;
use std::path::Path;

fn main() -> Result<()> {
    init_tracing()?;
    let args = RootArgs::parse();
    let data_dir = args.data_dir;

    match args.command {
        Command::Ingest(ingest) => cmd_ingest(&data_dir, ingest),
        Command::Remove(remove) => cmd_remove(&data_dir, remove),
        Command::Query(query) => cmd_query(&data_dir, query),
        Command::Stats => cmd_stats(&data_dir),
        Command::Run(run) => cmd_run(&data_dir, run),
        Command::Export(export) => cmd_export(&data_dir, export),
    }
}

fn init_tracing() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("LEXMEMO_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;
    Ok(())
}

fn open_store(data_dir: &Path) -> Result<PassageStore> {
    let store = PassageStore::open(data_dir, Box::new(HttpEmbedder::from_env()))?;
    Ok(store)
}

fn open_engine(data_dir: &Path) -> Result<WorkflowEngine> {
    let engine = WorkflowEngine::open(data_dir)?;
    engine.register_definition(litigation_memo_definition())?;
    Ok(engine)
}

fn cmd_ingest(data_dir: &Path, args: IngestArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.file)
        .with_context(|| format!("read {}", args.file.display()))?;
    let store = open_store(data_dir)?;
    let count = store.ingest(&args.document_id, &args.title, &text)?;
    println!("ingested {count} passages from {}", args.document_id);
    Ok(())
}

fn cmd_remove(data_dir: &Path, args: RemoveArgs) -> Result<()> {
    let store = open_store(data_dir)?;
    let removed = store.remove(&args.document_id)?;
    println!("removed {removed} passages of {}", args.document_id);
    Ok(())
}

fn cmd_query(data_dir: &Path, args: QueryArgs) -> Result<()> {
    let store = open_store(data_dir)?;
    let hits = store.query(&args.text, args.top_k)?;
    if hits.is_empty() {
        println!("no matching passages");
        return Ok(());
    }
    for hit in hits {
        let page = hit.page.map(|p| format!(" p.{p}")).unwrap_or_default();
        println!(
            "{:.3}  {}{page}  {}",
            hit.similarity, hit.document_title, hit.passage_id
        );
        let preview: String = hit.text.chars().take(160).collect();
        println!("       {preview}");
    }
    Ok(())
}

fn cmd_stats(data_dir: &Path) -> Result<()> {
    let store = open_store(data_dir)?;
    let stats = store.stats();
    println!(
        "{} passages across {} documents (embedding dim {})",
        stats.total_passages, stats.total_documents, stats.embedding_dim
    );
    Ok(())
}

fn cmd_run(data_dir: &Path, command: RunCommand) -> Result<()> {
    let engine = open_engine(data_dir)?;
    match command {
        RunCommand::Create(args) => {
            let inputs = parse_inputs(&args.inputs).map_err(|e| anyhow::anyhow!(e))?;
            let run = engine.create_run("litigation_research_memo_v1", &args.owner, inputs)?;
            println!("created run {}", run.run_id);
            println!("next: lexmemo run resume --run-id {} (intake)", run.run_id);
            Ok(())
        }
        RunCommand::Advance(args) => {
            let store = open_store(data_dir)?;
            let generator = LmCommand::resolve(args.lm.as_deref())?;
            let executor = Executor::new(&engine, &store, &generator);
            let run = if args.all {
                executor.run_to_completion(&args.run_id)?
            } else {
                executor.advance(&args.run_id)?
            };
            print_run_summary(&run);
            Ok(())
        }
        RunCommand::Resume(args) => {
            let store = open_store(data_dir)?;
            // Resolving human input never invokes the LM.
            let generator = LmCommand::new("");
            let executor = Executor::new(&engine, &store, &generator);
            let run = executor.resume(&args.run_id, args.notes)?;
            print_run_summary(&run);
            Ok(())
        }
        RunCommand::Rerun(args) => {
            let store = open_store(data_dir)?;
            let generator = LmCommand::resolve(args.lm.as_deref())?;
            let executor = Executor::new(&engine, &store, &generator);
            let mut run = executor.rerun_phase(&args.run_id, args.phase)?;
            if args.all {
                run = executor.run_to_completion(&args.run_id)?;
            }
            print_run_summary(&run);
            Ok(())
        }
        RunCommand::Show(args) => {
            let run = engine.get_run(&args.run_id)?;
            println!("{}", serde_json::to_string_pretty(&run)?);
            Ok(())
        }
        RunCommand::List(args) => {
            let runs = engine.list_runs(args.owner.as_deref())?;
            if runs.is_empty() {
                println!("no runs");
                return Ok(());
            }
            for run in runs {
                println!(
                    "{}  {:?}  phase {}/{}  owner {}",
                    run.run_id,
                    run.status,
                    run.current_phase,
                    run.phase_results.len(),
                    run.owner
                );
            }
            Ok(())
        }
    }
}

fn cmd_export(data_dir: &Path, args: ExportArgs) -> Result<()> {
    let engine = open_engine(data_dir)?;
    let run = engine.get_run(&args.run_id)?;
    let paths = write_bundle(&run, &args.out)?;
    for path in paths {
        println!("wrote {}", path.display());
    }
    Ok(())
}

fn print_run_summary(run: &WorkflowRun) {
    println!("run {}  status {:?}", run.run_id, run.status);
    match run.status {
        WorkflowStatus::NeedsInput => {
            println!(
                "parked at phase {} for human input; resolve with: lexmemo run resume --run-id {}",
                run.current_phase, run.run_id
            );
        }
        WorkflowStatus::Failed => {
            if let Some(message) = &run.error_message {
                println!("error: {message}");
            }
            if let Some(plan) = &run.correction_plan {
                println!("correction plan:");
                for item in plan {
                    println!("  [{}] {}", item.check, item.detail);
                    println!("      fix: {}", item.remediation);
                }
            }
        }
        WorkflowStatus::Completed => {
            println!("completed; export with: lexmemo export --run-id {} --out ./memo_out", run.run_id);
        }
        _ => {
            println!("phase {}/{}", run.current_phase, run.phase_results.len());
        }
    }
}
