use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aidd_memory::config::{MemoryConfig, DATA_DIR};
use aidd_memory::drafts::{DraftManager, ProjectLayout};
use aidd_memory::evolution::{PromotionThresholds, Promoter};
use aidd_memory::models::*;
use aidd_memory::store::{self, MemoryStore};

#[derive(Parser)]
#[command(name = "aidd-mem")]
#[command(about = "Session memory and evolution gate for AI-assisted development")]
struct Cli {
    /// Project root
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and open the store
    Init,
    /// Show backend, schema, session and evolution status
    Status,
    /// Shadow test a candidate read from a JSON file and record the decision
    Promote {
        /// Candidate JSON file
        file: PathBuf,
    },
    /// List drafts
    Drafts {
        #[arg(short, long)]
        category: Option<String>,

        #[arg(short, long)]
        status: Option<String>,

        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Approve a draft and write its content into the project
    Approve {
        id: String,

        /// Write here instead of the category directory
        #[arg(short, long)]
        target: Option<PathBuf>,
    },
    /// Reject a draft
    Reject {
        id: String,

        #[arg(short, long)]
        reason: Option<String>,
    },
    /// Edit a pending draft
    EditDraft {
        id: String,

        #[arg(long)]
        title: Option<String>,

        /// File holding the new content
        #[arg(long)]
        content_file: Option<PathBuf>,

        #[arg(short, long)]
        category: Option<String>,

        #[arg(long)]
        confidence: Option<f64>,

        #[arg(short, long)]
        filename: Option<String>,
    },
    /// Approve a pending or drafted evolution candidate directly
    ApproveCandidate { id: String },
    /// Reject a pending or drafted evolution candidate directly
    RejectCandidate {
        id: String,

        #[arg(short, long)]
        reason: Option<String>,
    },
    /// Full-text search over observations and permanent memory
    Search {
        query: String,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

/// Logs go to stderr; stdout carries JSON only.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "aidd_memory=info".into()),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[derive(Serialize)]
struct StatusReport {
    backend: &'static str,
    schema_version: u32,
    data_dir: PathBuf,
    sessions: SessionSummary,
    evolution: EvolutionStatus,
    patterns: PatternStats,
}

#[derive(Serialize)]
struct SearchReport {
    observations: Vec<Observation>,
    permanent_memory: Vec<PermanentMemory>,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open(project: &Path, config: &MemoryConfig) -> anyhow::Result<Arc<dyn MemoryStore>> {
    let data_dir = config.data_dir(project);
    store::open_store(&config.storage, &data_dir)
        .await
        .with_context(|| format!("Failed to open memory store in {}", data_dir.display()))
}

fn parse_category(raw: &str) -> anyhow::Result<DraftCategory> {
    DraftCategory::from_str(raw).ok_or_else(|| anyhow::anyhow!("Unknown draft category: {}", raw))
}

fn draft_manager(project: &Path, store: Arc<dyn MemoryStore>) -> DraftManager {
    DraftManager::new(store, Arc::new(ProjectLayout::detect(project)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let project = cli.project;
    let config = MemoryConfig::load(&project);
    let store = open(&project, &config).await?;

    match cli.command {
        Commands::Init => {
            if !project.join(DATA_DIR).join("config.json").exists() {
                config.save(&project)?;
            }
            tracing::info!("Initialized memory in {}", config.data_dir(&project).display());
            print_json(&serde_json::json!({
                "backend": store.kind().as_str(),
                "data_dir": config.data_dir(&project),
            }))?;
        }
        Commands::Status => {
            print_json(&StatusReport {
                backend: store.kind().as_str(),
                schema_version: store.schema_version().await?,
                data_dir: config.data_dir(&project),
                sessions: store.session_summary().await?,
                evolution: store.evolution_status().await?,
                patterns: store.pattern_stats().await?,
            })?;
        }
        Commands::Promote { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let candidate: EvolutionCandidate =
                serde_json::from_str(&content).context("Failed to parse candidate")?;

            let promoter = Promoter::from_config(Arc::clone(&store), &config.evolution);
            let thresholds = PromotionThresholds::from(&config.evolution);
            let result = promoter.promote_candidate(candidate, &thresholds).await?;
            print_json(&result)?;
        }
        Commands::Drafts {
            category,
            status,
            limit,
        } => {
            let filter = DraftFilter {
                category: category.as_deref().map(parse_category).transpose()?,
                status: status
                    .map(|s| {
                        DraftStatus::from_str(&s)
                            .ok_or_else(|| anyhow::anyhow!("Unknown draft status: {}", s))
                    })
                    .transpose()?,
                evolution_candidate_id: None,
                limit,
            };
            let drafts = draft_manager(&project, store).list(&filter).await?;
            print_json(&drafts)?;
        }
        Commands::Approve { id, target } => {
            let resolution = draft_manager(&project, store)
                .approve(&id, target.as_deref())
                .await?;
            print_json(&resolution)?;
        }
        Commands::Reject { id, reason } => {
            let resolution = draft_manager(&project, store).reject(&id, reason).await?;
            print_json(&resolution)?;
        }
        Commands::EditDraft {
            id,
            title,
            content_file,
            category,
            confidence,
            filename,
        } => {
            let content = content_file
                .map(|file| {
                    std::fs::read_to_string(&file)
                        .with_context(|| format!("Failed to read {}", file.display()))
                })
                .transpose()?;
            let input = UpdateDraftInput {
                title,
                content,
                category: category.as_deref().map(parse_category).transpose()?,
                confidence,
                filename,
            };
            let draft = draft_manager(&project, store).update(&id, input).await?;
            print_json(&draft)?;
        }
        Commands::ApproveCandidate { id } => {
            let promoter = Promoter::from_config(store, &config.evolution);
            print_json(&promoter.approve_candidate(&id).await?)?;
        }
        Commands::RejectCandidate { id, reason } => {
            let promoter = Promoter::from_config(store, &config.evolution);
            print_json(&promoter.reject_candidate(&id, reason).await?)?;
        }
        Commands::Search { query, limit } => {
            print_json(&SearchReport {
                observations: store.search_observations(&query, limit).await?,
                permanent_memory: store.search_permanent_memory(&query, limit).await?,
            })?;
        }
    }

    Ok(())
}
