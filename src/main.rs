//! Main module for the helpdesk CLI.
//!
//! ```sh
//! helpdesk init
//! helpdesk sync
//! helpdesk ask "Касса не включается"
//! helpdesk interactive --user 42
//! ```

use std::{error::Error, fs, sync::Arc, time::Duration};

use clap::Parser;
use helpdesk_resolver::{
    commands::{Cli, Commands},
    config::{ResolverConfig, load_config},
    config_dir,
    embedding::{Embedder, EmbeddingService, SentenceEmbedder},
    generative::{GenerativeService, OpenAiGenerator},
    index::{Category, Collection, KnowledgeIndex},
    pipeline::{Resolution, Resolver},
    source::SheetSource,
    state::SystemState,
    sync::{CategoryBinding, Synchronizer},
    template::{PromptTemplate, load_or_default},
};
use once_cell::sync::OnceCell;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

static TRACING: OnceCell<()> = OnceCell::new();

/// Shown when the pipeline has no answer.
const NO_ANSWER_REPLY: &str = "Не нашёл точного решения. Опиши подробнее или обратись к модератору.";

fn main() -> Result<(), Box<dyn Error>> {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt::init();
    });
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    if cli.command == Commands::Init {
        return init();
    }

    let config_path = match cli.config {
        Some(path) => path,
        None => config_dir()?.join("config.yaml"),
    };
    debug!("Loading config from: {}", config_path.display());
    let config = load_config(
        config_path
            .to_str()
            .ok_or("config path is not valid UTF-8")?,
    )?;

    let app = App::build(&config).await?;

    match cli.command {
        Commands::Sync => {
            let report = app.sync.rebuild().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Ask { question, user } => {
            app.initial_sync().await;
            let resolution = app.resolver.resolve(&user, &question, &app.state).await;
            print_resolution(&resolution);
        }
        Commands::Interactive { user } => {
            app.initial_sync().await;
            let refresh = Arc::clone(&app.sync).spawn_periodic(
                Duration::from_secs(config.sync.initial_delay_secs),
                Duration::from_secs(config.sync.interval_secs),
            );

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                let resolution = app.resolver.resolve(&user, &line, &app.state).await;
                print_resolution(&resolution);
            }

            refresh.abort();
            let snapshot = app.resolver.metrics().snapshot();
            info!("session metrics: {}", serde_json::to_string(&snapshot)?);
        }
        Commands::Init => init()?,
    }

    Ok(())
}

/// Everything one process needs, wired from the config.
struct App {
    resolver: Resolver,
    sync: Arc<Synchronizer>,
    state: SystemState,
}

impl App {
    async fn build(config: &ResolverConfig) -> Result<Self, Box<dyn Error>> {
        let embedding = &config.embedding;
        let mut embeddings = EmbeddingService::new(embedding.cache_capacity);

        let general = load_embedder(&embedding.general_model, &embedding.revision).await?;
        let general_dim = general.dimension();
        embeddings.register(general);

        let technical_dim = if embedding.technical_model == embedding.general_model {
            general_dim
        } else {
            let technical = load_embedder(&embedding.technical_model, &embedding.revision).await?;
            let dim = technical.dimension();
            embeddings.register(technical);
            dim
        };
        let embeddings = Arc::new(embeddings);

        let index = Arc::new(KnowledgeIndex::new(
            Collection::empty(Category::General, &embedding.general_model, general_dim),
            Collection::empty(Category::Technical, &embedding.technical_model, technical_dim),
        ));

        let generator: Option<Arc<dyn GenerativeService>> =
            if config.generative.enabled || config.paraphrase.enabled {
                Some(Arc::new(OpenAiGenerator::new(config)))
            } else {
                None
            };

        let mut resolver = Resolver::new(
            config.clone(),
            Arc::clone(&index),
            Arc::clone(&embeddings),
            generator,
        )
        .with_fallback_template(load_or_default(
            &config.generative.template,
            PromptTemplate::fallback_default(),
        ));
        if config.paraphrase.enabled {
            resolver = resolver.with_paraphrase(load_or_default(
                &config.paraphrase.template,
                PromptTemplate::paraphrase_default(),
            ));
        }

        let sync = Arc::new(Synchronizer::new(
            Arc::new(SheetSource::new(&config.source)),
            embeddings,
            index,
            Arc::clone(resolver.cache()),
            Arc::clone(resolver.metrics()),
            vec![
                CategoryBinding::new(
                    Category::General,
                    &config.source.general_range,
                    &embedding.general_model,
                ),
                CategoryBinding::new(
                    Category::Technical,
                    &config.source.technical_range,
                    &embedding.technical_model,
                ),
            ],
            config.retry.policy(),
        ));

        Ok(Self {
            resolver,
            sync,
            state: SystemState::from_config(config),
        })
    }

    /// Load the knowledge base before the first question. A failure is not
    /// fatal: the cache and generative stages still work.
    async fn initial_sync(&self) {
        if let Err(err) = self.sync.rebuild().await {
            warn!("starting without a knowledge base: {err}");
        }
    }
}

async fn load_embedder(repo: &str, revision: &str) -> Result<Arc<dyn Embedder>, Box<dyn Error>> {
    let repo = repo.to_string();
    let revision = revision.to_string();
    let model =
        tokio::task::spawn_blocking(move || SentenceEmbedder::load(&repo, &revision)).await??;
    Ok(Arc::new(model))
}

fn print_resolution(resolution: &Resolution) {
    match resolution {
        Resolution::Resolved(result) => {
            debug!(
                "source {:?}, distance {:.3}, stages {:?}",
                result.source, result.distance, result.stages
            );
            println!("{}", result.answer.as_deref().unwrap_or(NO_ANSWER_REPLY));
        }
        Resolution::Skipped(reason) => {
            debug!("skipped: {reason:?}");
        }
    }
}

/// Writes the default config and both prompt templates under the config
/// directory. Existing files are left alone.
fn init() -> Result<(), Box<dyn Error>> {
    let config_dir = config_dir()?;
    let templates = config_dir.join("templates");
    info!("Creating template config directory: {}", templates.display());
    fs::create_dir_all(&templates)?;

    let files = [
        (
            config_dir.join("config.yaml"),
            serde_yaml::to_string(&ResolverConfig::default())?,
        ),
        (
            templates.join("fallback.yaml"),
            serde_yaml::to_string(&PromptTemplate::fallback_default())?,
        ),
        (
            templates.join("paraphrase.yaml"),
            serde_yaml::to_string(&PromptTemplate::paraphrase_default())?,
        ),
    ];

    for (path, content) in files {
        if path.exists() {
            info!("Keeping existing file: {}", path.display());
            continue;
        }
        info!("Creating file: {}", path.display());
        fs::write(path, content)?;
    }

    Ok(())
}
