//! `worknotes`: admin CLI over the work-note index.
//!
//! ```bash
//! worknotes search "kafka lag" --department Data
//! worknotes reindex-all --batch-size 100
//! worknotes dead-letter list
//! worknotes sweep            # long-running retry sweeper
//! ```

mod config;

use std::{path::PathBuf, sync::Arc, time::Duration};

use {
    clap::{Parser, Subcommand},
    serde::Serialize,
    sqlx::{
        SqlitePool,
        sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    },
    tracing::info,
    tracing_subscriber::EnvFilter,
    worknotes_index::{
        chunker::{Chunker, ChunkerConfig},
        config::IndexConfig,
        embeddings::EmbeddingProvider,
        embeddings_openai::OpenAiEmbeddingProvider,
        hybrid::HybridMerger,
        lexical::{LexicalSearcher, SearchFilters},
        retry_queue::RetryQueue,
        schema::run_migrations,
        store_sqlite::SqliteWorkNoteStore,
        sync::EmbeddingSyncCoordinator,
        vector_index::VectorIndexAdapter,
        vector_store_sqlite::SqliteVectorStore,
    },
};

#[derive(Parser)]
#[command(name = "worknotes", version, about = "Work-note index administration")]
struct Cli {
    /// Config file (default: platform config dir, then built-in defaults)
    #[arg(long, global = true, env = "WORKNOTES_CONFIG")]
    config: Option<PathBuf>,

    /// Override the database path from the config file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Embedding API key
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Hybrid keyword + semantic search
    Search {
        query: String,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        person: Option<String>,
        #[arg(long)]
        department: Option<String>,
    },
    /// Re-embed every note
    ReindexAll {
        #[arg(long, default_value = "50")]
        batch_size: usize,
    },
    /// Re-embed one note
    ReindexOne { id: String },
    /// Embed notes never embedded or edited since their last embedding
    EmbedPending {
        #[arg(long, default_value = "50")]
        batch_size: usize,
    },
    /// Inspect or re-arm dead-lettered retries
    DeadLetter {
        #[command(subcommand)]
        action: DeadLetterAction,
    },
    /// Retry queue counts per status
    Stats,
    /// Drain the retry queue
    Sweep {
        /// Run a single sweep and exit
        #[arg(long)]
        once: bool,
    },
}

#[derive(Subcommand)]
enum DeadLetterAction {
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    Retry { id: String },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn open_pool(path: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    run_migrations(&pool).await?;
    SqliteVectorStore::init(&pool).await?;
    Ok(pool)
}

/// Wired components for commands that embed.
struct Services {
    coordinator: Arc<EmbeddingSyncCoordinator>,
    merger: HybridMerger,
}

fn build_services(
    config: &IndexConfig,
    pool: &SqlitePool,
    api_key: Option<String>,
) -> anyhow::Result<Services> {
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(
        OpenAiEmbeddingProvider::new(config::require_api_key(api_key)?)
            .with_base_url(config.embeddings.base_url.clone())
            .with_model(config.embeddings.model.clone(), config.embeddings.dimensions),
    );
    let store = Arc::new(SqliteWorkNoteStore::new(pool.clone()));
    let index = Arc::new(
        VectorIndexAdapter::new(embedder, Arc::new(SqliteVectorStore::new(pool.clone())))
            .with_metadata_byte_budget(config.metadata_byte_budget)
            .with_stale_scan_limit(config.stale_scan_limit),
    );
    let chunker = Chunker::new(ChunkerConfig {
        chunk_size_tokens: config.chunk_size_tokens,
        overlap_ratio: config.chunk_overlap_ratio,
    });
    let queue = Arc::new(RetryQueue::new(pool.clone()).with_max_attempts(config.retry_max_attempts));
    let coordinator = Arc::new(
        EmbeddingSyncCoordinator::new(store.clone(), index.clone(), queue).with_chunker(chunker),
    );
    let merger = HybridMerger::new(Arc::new(LexicalSearcher::new(pool.clone())), index, store)
        .with_rrf_k(config.rrf_k)
        .with_overfetch_factor(config.search_overfetch_factor)
        .with_default_limit(config.default_search_limit)
        .with_metadata_byte_budget(config.metadata_byte_budget);
    Ok(Services {
        coordinator,
        merger,
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = config::load_config(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.db_path = db.display().to_string();
    }
    let pool = open_pool(&config.db_path).await?;

    match cli.command {
        Command::DeadLetter { action } => {
            let queue = RetryQueue::new(pool.clone());
            match action {
                DeadLetterAction::List { limit, offset } => {
                    print_json(&queue.list_dead_letter(limit, offset).await?)?;
                },
                DeadLetterAction::Retry { id } => {
                    let outcome = queue.retry_dead_letter_item(&id).await?;
                    print_json(&serde_json::json!({ "id": id, "outcome": outcome }))?;
                },
            }
        },
        Command::Stats => {
            print_json(&RetryQueue::new(pool.clone()).stats().await?)?;
        },
        command => {
            let services = build_services(&config, &pool, cli.api_key)?;
            run_embedding_command(command, &config, services).await?;
        },
    }

    pool.close().await;
    Ok(())
}

async fn run_embedding_command(
    command: Command,
    config: &IndexConfig,
    services: Services,
) -> anyhow::Result<()> {
    let Services {
        coordinator,
        merger,
    } = services;
    match command {
        Command::Search {
            query,
            limit,
            category,
            person,
            department,
        } => {
            let filters = SearchFilters {
                category,
                person_id: person,
                department,
                limit,
                ..Default::default()
            };
            print_json(&merger.hybrid_search(&query, &filters).await?)?;
        },
        Command::ReindexAll { batch_size } => {
            print_json(&coordinator.reindex_all(batch_size).await?)?;
        },
        Command::ReindexOne { id } => {
            let found = coordinator.reindex_one(&id).await?;
            print_json(&serde_json::json!({ "id": id, "reindexed": found }))?;
        },
        Command::EmbedPending { batch_size } => {
            print_json(&coordinator.embed_pending(batch_size).await?)?;
        },
        Command::Sweep { once: true } => {
            print_json(
                &coordinator
                    .process_retry_queue(config.retry_sweep_batch_size)
                    .await?,
            )?;
        },
        Command::Sweep { once: false } => {
            let interval = Duration::from_secs(config.retry_sweep_interval_secs.max(1));
            info!(interval_secs = interval.as_secs(), "retry sweeper running");
            let sweeper =
                coordinator.spawn_retry_sweeper(interval, config.retry_sweep_batch_size);
            tokio::signal::ctrl_c().await?;
            sweeper.abort();
            info!("retry sweeper stopped");
        },
        Command::DeadLetter { .. } | Command::Stats => {},
    }
    Ok(())
}
