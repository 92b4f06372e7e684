//! # repodoc CLI
//!
//! ```bash
//! repodoc --config ./config/repodoc.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `repodoc init` | Create the SQLite database and run schema migrations |
//! | `repodoc chunk <repo>` | Print the chunk set of a checkout |
//! | `repodoc index <repo>` | Chunk and embed, reusing cached vectors |
//! | `repodoc generate <repo>` | Run the full pipeline and write the sections |
//! | `repodoc verdicts` | Print the verdict audit log |
//! | `repodoc completions <shell>` | Emit shell completions |

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use repodoc::config::{self, Config};
use repodoc::context::Capabilities;
use repodoc::error::RunError;
use repodoc::pipeline::{self, PipelineInputs};
use repodoc::progress::ProgressMode;
use repodoc::store::{self, SqliteAudit};
use repodoc::{db, embedding, export, llm, migrate};

/// repodoc: evidence-grounded documentation for source repositories.
#[derive(Parser)]
#[command(
    name = "repodoc",
    version,
    about = "Evidence-grounded technical documentation for source repositories",
    long_about = "repodoc chunks a repository checkout, embeds it into prose and code indexes, \
    and writes each documentation section through a write, judge, revise loop in which every \
    claim cites a line range of the repository."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/repodoc.toml")]
    config: PathBuf,

    /// Progress output on stderr.
    #[arg(long, global = true, value_enum, default_value = "auto")]
    progress: ProgressMode,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite file and the embedding cache, verdict, and section
    /// output tables. Safe to run repeatedly.
    Init,

    /// Chunk a repository checkout and print the chunk set.
    Chunk {
        /// Repository root.
        repo: PathBuf,

        /// Print the chunks as JSON instead of one tag per line.
        #[arg(long)]
        json: bool,
    },

    /// Chunk and embed a repository, reusing cached embeddings.
    Index {
        /// Repository root.
        repo: PathBuf,
    },

    /// Generate documentation sections for a repository.
    Generate {
        /// Repository root.
        repo: PathBuf,

        /// Output directory; defaults to `[run].output_dir`.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Only generate these sections (and the sections they depend on).
        #[arg(long = "section")]
        sections: Vec<String>,
    },

    /// Print persisted verdicts.
    Verdicts {
        /// Only show verdicts for this section.
        #[arg(long)]
        section: Option<String>,
    },

    /// Generate shell completions.
    Completions {
        shell: clap_complete::Shell,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("repodoc=info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter);
    tracing_subscriber::registry().with(stderr_layer).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "repodoc", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Chunk { repo, json } => {
            let report = pipeline::chunk_repository(&repo, &cfg)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report.chunks)?);
            } else {
                for chunk in &report.chunks {
                    println!("{}\t{}\t{:?}", chunk.tag(), chunk.kind.collection(), chunk.quality);
                }
                for (path, line) in &report.oversized_lines {
                    eprintln!("line above chunk budget: {}:{}", path, line);
                }
                for issue in &report.issues {
                    eprintln!("skipped: {}", issue);
                }
            }
        }
        Commands::Index { repo } => run_index(&cfg, &repo, cli.progress).await?,
        Commands::Generate {
            repo,
            out,
            sections,
        } => run_generate(&cfg, &repo, out, sections, cli.progress).await?,
        Commands::Verdicts { section } => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            let records = store::list_verdicts(&pool, section.as_deref()).await?;
            if records.is_empty() {
                println!("No verdicts recorded.");
            }
            for r in records {
                let v = &r.verdict;
                println!(
                    "{}  {:<16} rev {}  score {:.2}  factual={} cites_ok={} hallucinated={}",
                    r.run_id, r.section_id, r.revision, v.score, v.factual, v.cites_ok, v.hallucinated
                );
                if !v.notes.is_empty() {
                    println!("    {}", v.notes);
                }
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

async fn run_index(cfg: &Config, repo: &std::path::Path, progress: ProgressMode) -> anyhow::Result<()> {
    let pool = db::connect(&cfg.db.path).await?;
    migrate::run_migrations(&pool).await?;
    let embedder = embedding::create_embedder(&cfg.embedding)?;
    let reporter = progress.reporter();

    let (_, indexes, build) =
        pipeline::index_repository(repo, cfg, embedder, Some(&pool), reporter.as_ref()).await?;

    println!(
        "Indexed {} text / {} code chunks ({} embedded, {} reused, {} unindexed, {} pruned)",
        indexes.text.len(),
        indexes.code.len(),
        build.embedded,
        build.reused,
        build.unindexed.len(),
        build.pruned
    );
    for u in &build.unindexed {
        eprintln!("  unindexed {}: {}", u.tag, u.error);
    }
    for (collection, count) in store::collection_counts(&pool).await? {
        println!("  {}: {} cached vectors", collection, count);
    }
    Ok(())
}

async fn run_generate(
    cfg: &Config,
    repo: &std::path::Path,
    out: Option<PathBuf>,
    only: Vec<String>,
    progress: ProgressMode,
) -> anyhow::Result<()> {
    let pool = db::connect(&cfg.db.path).await?;
    migrate::run_migrations(&pool).await?;

    let embedder = embedding::create_embedder(&cfg.embedding)?;
    let (generator, judge) = llm::create_models(&cfg.generation)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let inputs = PipelineInputs {
        capabilities: Capabilities {
            embedder,
            generator,
            judge,
        },
        audit: Arc::new(SqliteAudit::new(pool.clone())),
        cache: Some(&pool),
        progress: Arc::from(progress.reporter()),
        cancel,
        only,
    };

    let report = match pipeline::run_pipeline(repo, cfg, inputs).await {
        Ok(report) => report,
        Err(e) => match e.downcast_ref::<RunError>() {
            Some(RunError::EmptyIndexes) => {
                anyhow::bail!("{}: check embedding settings and include globs", e)
            }
            _ => return Err(e),
        },
    };

    let out_dir = out.unwrap_or_else(|| cfg.run.output_dir.clone());
    let manifest = export::write_outputs(
        &out_dir,
        &report.run_id,
        &report.run.outcomes,
        report.run.cancelled,
    )
    .with_context(|| format!("Failed to write outputs to {}", out_dir.display()))?;

    for outcome in &report.run.outcomes {
        println!(
            "{:<20} {:<7} revision {}  score {:.2}",
            outcome.section_id,
            if outcome.forced_accept { "forced" } else { "passed" },
            outcome.draft.revision,
            outcome.verdict.score
        );
    }
    println!("Run {} → {}", report.run_id, manifest.display());

    if report.run.cancelled {
        return Err(RunError::Cancelled.into());
    }
    Ok(())
}
