//! # Answer Harness CLI (`ans`)
//!
//! Ingest documents into a local knowledge base and ask questions that are
//! answered with numbered citations back to the source passages.
//!
//! ## Usage
//!
//! ```bash
//! ans --config ./config/ans.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ans init` | Write a starter config (if missing) and create the index |
//! | `ans ingest <path>...` | Ingest files or directories (.txt, .md, .markdown, .csv) |
//! | `ans ingest-text "<text>"` | Ingest a piece of text |
//! | `ans query "<question>"` | Answer a question with citations |
//! | `ans chunks` | List stored chunks |
//! | `ans stats` | Show index statistics |
//! | `ans clear --yes` | Remove everything from the knowledge base |
//! | `ans eval <gold.json>` | Score the pipeline against a gold set |
//! | `ans serve` | Start the HTTP API server |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`,
//! `-v` for `debug`). A `.env` file in the working directory is loaded at
//! start-up, so API keys can live there.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use answer_harness::config::{self, CONFIG_TEMPLATE};
use answer_harness::eval;
use answer_harness::ingest;
use answer_harness::models::QueryResult;
use answer_harness::pipeline::Pipeline;
use answer_harness::server;

/// Answer Harness: grounded question answering over your own documents.
#[derive(Parser)]
#[command(
    name = "ans",
    about = "Answer Harness: grounded question answering over your own documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ans.toml")]
    config: PathBuf,

    /// Enable debug logging (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config if none exists and create the index.
    Init,

    /// Ingest files or directories (walked recursively).
    ///
    /// Unsupported file types are skipped with a warning. Re-ingesting an
    /// unchanged file replaces its earlier chunks.
    Ingest {
        /// Files or directories to ingest.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Document title (single file only; defaults to the file name).
        #[arg(long)]
        title: Option<String>,
    },

    /// Ingest a piece of text given on the command line.
    IngestText {
        text: String,

        #[arg(long)]
        title: Option<String>,

        /// Source identifier shown in citations.
        #[arg(long)]
        source: Option<String>,
    },

    /// Answer a question from the knowledge base.
    Query {
        question: String,

        /// Number of candidates to retrieve.
        #[arg(long)]
        top_k: Option<usize>,

        /// Number of passages kept after reranking.
        #[arg(long)]
        rerank_top_k: Option<usize>,

        /// Print the full result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List stored chunks.
    Chunks {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show index statistics.
    Stats,

    /// Remove every document from the knowledge base.
    Clear {
        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },

    /// Evaluate answers against a gold set of questions.
    Eval {
        /// JSON gold set file.
        gold: PathBuf,

        /// Write the detailed report as JSON to this file.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Start the HTTP API server.
    Serve,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if matches!(cli.command, Commands::Init) && !cli.config.exists() {
        if let Some(parent) = cli.config.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&cli.config, CONFIG_TEMPLATE)
            .with_context(|| format!("Failed to write config: {}", cli.config.display()))?;
        println!("Wrote {}", cli.config.display());
    }

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Serve = cli.command {
        return server::run_server(&cfg).await;
    }

    let pipeline = Pipeline::from_config(cfg).await?;

    match cli.command {
        Commands::Init => {
            let stats = pipeline.stats().await?;
            println!(
                "Index '{}' ready ({} backend, {} chunks).",
                stats.index_name, stats.backend, stats.total_vectors
            );
        }
        Commands::Ingest { paths, title } => {
            println!("ingest");
            let summary = ingest::ingest_paths(&pipeline, &paths, title.as_deref()).await?;
            println!("  files found: {}", summary.files_found);
            println!("  documents ingested: {}", summary.documents_ingested);
            println!("  chunks created: {}", summary.chunks_created);
            println!("  skipped: {}", summary.skipped);
            if summary.failed > 0 {
                bail!("{} file(s) failed to ingest", summary.failed);
            }
            println!("ok");
        }
        Commands::IngestText {
            text,
            title,
            source,
        } => {
            let report = pipeline
                .ingest_text(&text, title.as_deref(), source.as_deref())
                .await?;
            println!(
                "Ingested document {} ({} chunks, {:.0} ms)",
                report.document_id, report.chunks_created, report.processing_time_ms
            );
        }
        Commands::Query {
            question,
            top_k,
            rerank_top_k,
            json,
        } => {
            let result = pipeline.query(&question, top_k, rerank_top_k).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_answer(&result);
            }
        }
        Commands::Chunks { limit } => {
            let chunks = pipeline.list_chunks(limit).await?;
            if chunks.is_empty() {
                println!("No chunks stored.");
            }
            for chunk in chunks {
                let preview: String = chunk.text.chars().take(80).collect();
                println!(
                    "{}  {} #{}  [{}..{}) {} tokens",
                    chunk.id, chunk.title, chunk.position, chunk.start, chunk.end, chunk.token_count
                );
                println!("    {}", preview.replace('\n', " "));
            }
        }
        Commands::Stats => {
            let stats = pipeline.stats().await?;
            println!("index: {}", stats.index_name);
            println!("  backend: {}", stats.backend);
            println!("  documents: {}", stats.total_documents);
            println!("  vectors: {}", stats.total_vectors);
            match stats.dimensions {
                Some(d) => println!("  dimensions: {}", d),
                None => println!("  dimensions: unknown"),
            }
        }
        Commands::Clear { yes } => {
            if !yes {
                bail!("Refusing to clear the knowledge base without --yes");
            }
            pipeline.clear().await?;
            println!("Knowledge base cleared.");
        }
        Commands::Eval { gold, output } => {
            let items = eval::load_gold_set(&gold)?;
            let summary = eval::run_eval(&pipeline, &items).await;

            for r in &summary.detailed_results {
                let verdict = if r.success { "PASS" } else { "FAIL" };
                println!("Q{} {} — {}", r.id, verdict, r.question);
                match &r.error {
                    Some(e) => println!("    error: {}", e),
                    None => println!(
                        "    keywords {:.0}%, citations {}, no-answer {}",
                        r.keyword_score * 100.0,
                        r.citation_count,
                        r.is_no_answer
                    ),
                }
            }
            println!();
            println!(
                "Success rate: {}/{} ({:.0}%)",
                summary.successful,
                summary.total_queries,
                summary.success_rate * 100.0
            );
            println!("Avg keyword score: {:.0}%", summary.avg_keyword_score * 100.0);
            println!("Avg citations: {:.1}", summary.avg_citations);
            println!("Avg retrieval time: {:.0} ms", summary.avg_retrieval_time_ms);
            println!("Avg rerank time: {:.0} ms", summary.avg_rerank_time_ms);
            println!("Avg generation time: {:.0} ms", summary.avg_generation_time_ms);

            if let Some(path) = output {
                std::fs::write(&path, serde_json::to_string_pretty(&summary)?)
                    .with_context(|| format!("Failed to write report: {}", path.display()))?;
                println!("Report written to {}", path.display());
            }
            if !summary.passed {
                bail!(
                    "success rate {:.0}% is below the {:.0}% threshold",
                    summary.success_rate * 100.0,
                    eval::SUCCESS_THRESHOLD * 100.0
                );
            }
        }
        Commands::Serve => unreachable!("handled above"),
    }

    Ok(())
}

fn print_answer(result: &QueryResult) {
    println!("{}", result.answer);
    if !result.citations.is_empty() {
        println!();
        println!("Citations:");
        for c in &result.citations {
            println!(
                "  [{}] {} ({}) relevance {:.2}",
                c.number, c.title, c.source, c.relevance_score
            );
        }
    }
    for warning in &result.warnings {
        eprintln!("warning: {}", warning);
    }
    println!();
    println!(
        "retrieval {:.1} ms | total {:.1} ms | tokens {} | cost ${:.6}",
        result.timings.retrieval_time_ms,
        result.timings.total_time_ms,
        result.token_usage.total_tokens,
        result.cost_estimate
    );
}
