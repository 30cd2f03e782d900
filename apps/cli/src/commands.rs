//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Local, NaiveDate};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use postforge_core::pipeline::{GenerateOutcome, GenerateRequest, LOCAL_CALLER, PostService};
use postforge_core::products::parse_catalog_export;
use postforge_core::theme::{ThemeDescriptor, resolve_theme, second_post_theme};
use postforge_llm::{Embedder, LlmClient, OpenAiCompatClient};
use postforge_shared::{
    AppConfig, Channel, Post, PostId, PostStatus, init_config, load_config,
    resolve_db_path, validate_api_key,
};
use postforge_storage::Storage;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Postforge: daily posts for an agricultural supply store.
#[derive(Parser)]
#[command(
    name = "postforge",
    version,
    about = "Generate deduplicated, channel-ready social media posts from a weekday calendar.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Generate one post for a date.
    Generate {
        /// Target date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Topic suggestion for the first attempt.
        #[arg(long)]
        topic: Option<String>,

        /// Force a delivery channel (e.g. fb-post, tiktok, wa-status).
        #[arg(long)]
        channel: Option<Channel>,

        /// Generate Monday's ranch-life post instead of the main one.
        #[arg(long)]
        second_post: bool,

        /// Do not persist the generated post.
        #[arg(long)]
        dry_run: bool,

        /// Print the post as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List posts in a date range, newest first.
    History {
        /// Start date (YYYY-MM-DD). Defaults to `history_days` before `--to`.
        #[arg(long)]
        from: Option<NaiveDate>,

        /// End date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        to: Option<NaiveDate>,

        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Save or upsert a post from a JSON file.
    Save {
        /// Path to a post JSON file.
        file: PathBuf,
    },

    /// Update a post's review status.
    Status {
        /// Post ID.
        id: PostId,

        /// draft, approved, scheduled, published or rejected.
        status: PostStatus,

        /// Free-text reviewer feedback.
        #[arg(long)]
        feedback: Option<String>,
    },

    /// Catalog management.
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },

    /// Show the resolved theme for a date.
    Theme {
        /// Date (YYYY-MM-DD).
        date: NaiveDate,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Catalog subcommands.
#[derive(Subcommand)]
pub(crate) enum CatalogAction {
    /// Upsert catalog items from a JSON export (array or `{"items": [...]}`).
    Import {
        file: PathBuf,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "postforge=info",
        1 => "postforge=debug",
        _ => "postforge=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Generate {
            date,
            topic,
            channel,
            second_post,
            dry_run,
            json,
        } => {
            let mut request = GenerateRequest::new(date.unwrap_or_else(today));
            request.suggested_topic = topic;
            request.forced_channel = channel;
            request.second_post = second_post;
            request.persist = !dry_run;
            cmd_generate(request, json).await
        }
        Command::History { from, to, limit } => cmd_history(from, to, limit).await,
        Command::Save { file } => cmd_save(&file).await,
        Command::Status {
            id,
            status,
            feedback,
        } => cmd_status(&id, status, feedback.as_deref()).await,
        Command::Catalog { action } => match action {
            CatalogAction::Import { file } => cmd_catalog_import(&file).await,
        },
        Command::Theme { date } => cmd_theme(date),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Build the service. Commands that never call the model accept a missing key.
async fn open_service(config: AppConfig, needs_llm: bool) -> Result<PostService> {
    let api_key = if needs_llm {
        validate_api_key(&config)?
    } else {
        validate_api_key(&config).unwrap_or_default()
    };

    let db_path = resolve_db_path(&config)?;
    let storage = Storage::open(&db_path).await?;
    info!(db = %db_path.display(), "storage opened");

    let client = Arc::new(OpenAiCompatClient::from_config(&config.llm, api_key)?);
    let llm: Arc<dyn LlmClient> = client.clone();
    let embedder: Option<Arc<dyn Embedder>> = if config.llm.embedding_model.trim().is_empty() {
        None
    } else {
        Some(client)
    };
    Ok(PostService::new(storage, llm, embedder, config))
}

fn spinner(message: &str) -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));
    Ok(spinner)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("cannot read '{}'", path.display()))?;
    serde_json::from_str(&content).wrap_err_with(|| format!("invalid JSON in '{}'", path.display()))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_generate(request: GenerateRequest, json: bool) -> Result<()> {
    let config = load_config()?;
    let service = open_service(config, true).await?;

    info!(date = %request.date, second_post = request.second_post, "generating post");
    let progress = spinner(&format!("Generating post for {}", request.date))?;
    let result = service.generate(request).await;
    progress.finish_and_clear();
    let outcome = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.post)?);
    } else {
        print_outcome(&outcome);
    }
    Ok(())
}

fn print_outcome(outcome: &GenerateOutcome) {
    let post = &outcome.post;
    println!();
    println!("  Post generated{}", if outcome.persisted { " and saved" } else { "" });
    println!("  ID:       {}", post.id);
    println!("  Date:     {}", post.date_for);
    println!("  Channel:  {}", post.channel);
    println!("  Type:     {} ({})", post.post_type, post.content_tone);
    println!("  Topic:    {}", post.topic);
    println!("  Attempts: {}", outcome.attempts);
    if let Some(product) = &outcome.product {
        println!("  Product:  {} [{}]", product.snapshot.name, product.category);
    }
    if post.possibly_duplicate {
        println!("  Warning:  possibly duplicate, not saved; review before publishing");
    }
    for rejected in &outcome.rejected {
        println!("  Rejected: {} ({})", rejected.topic, rejected.reason);
    }
    println!();
    println!("{}", post.caption);
    if !post.hashtags.is_empty() {
        println!("{}", post.hashtags.join(" "));
    }
    println!();
    println!("  Image prompt: {}", post.image_prompt);
    println!();
}

async fn cmd_history(from: Option<NaiveDate>, to: Option<NaiveDate>, limit: u32) -> Result<()> {
    let config = load_config()?;
    let to = to.unwrap_or_else(today);
    let from = from.unwrap_or(to - Duration::days(config.dedup.history_days));
    let service = open_service(config, false).await?;

    let posts = service.list_recent(from, to, limit).await?;
    if posts.is_empty() {
        println!("No posts between {from} and {to}.");
        return Ok(());
    }
    for post in &posts {
        println!(
            "{}  {}  {:<12} {:<10} {}",
            post.date_for,
            post.id,
            post.channel.as_str(),
            post.status.as_str(),
            post.topic
        );
    }
    Ok(())
}

async fn cmd_save(file: &Path) -> Result<()> {
    let post: Post = read_json(file)?;
    let config = load_config()?;
    let service = open_service(config, false).await?;

    let stored = service.save(post, LOCAL_CALLER).await?;
    println!("Saved post {} ({})", stored.id, stored.topic_hash);
    Ok(())
}

async fn cmd_status(id: &PostId, status: PostStatus, feedback: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let service = open_service(config, false).await?;

    let post = service.update_status(id, status, feedback).await?;
    println!("Post {} is now {}", post.id, post.status.as_str());
    Ok(())
}

async fn cmd_catalog_import(file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .wrap_err_with(|| format!("cannot read '{}'", file.display()))?;
    let items = parse_catalog_export(&content)
        .wrap_err_with(|| format!("invalid catalog export in '{}'", file.display()))?;
    if items.is_empty() {
        return Err(eyre!("'{}' contains no catalog items", file.display()));
    }
    let config = load_config()?;
    let service = open_service(config, false).await?;

    let count = service.import_catalog(&items).await?;
    let embedded = items.iter().filter(|i| i.embedding.is_some()).count();
    println!("Imported {count} catalog items ({embedded} with embeddings)");
    Ok(())
}

fn cmd_theme(date: NaiveDate) -> Result<()> {
    print_theme(&resolve_theme(date));
    if let Some(second) = second_post_theme(date) {
        println!("  Second post:");
        print_theme(&second);
    }
    Ok(())
}

fn print_theme(theme: &ThemeDescriptor) {
    println!();
    println!("  {} ({})", theme.theme_label, theme.day_name);
    println!("  Date:       {}", theme.date);
    println!("  Content:    {}", theme.content_type);
    println!("  Tone:       {}", theme.primary_tone);
    println!("  Post types: {}", theme.recommended_post_types.join(", "));
    println!("  Products:   {:?}", theme.product_strategy);
    println!("  Format:     {:?}", theme.topic_format);
    if let Some(sector) = theme.sector {
        println!("  Sector:     {} {}", sector.emoji(), sector.display_name());
    }
    if let Some(forced) = &theme.forced_post_type {
        println!("  Forced:     {forced}");
    }
    println!("  {}", theme.guidance);
    println!();
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
