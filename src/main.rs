use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use prompt_recorder::cli::{associate, ingest, list, reconcile, serve, show, stats, submit};
use prompt_recorder::config::Config;
use prompt_recorder::record::{parse_timestamp, PromptFilter, Source};
use prompt_recorder::recorder::{Recorder, Submission};

#[derive(Parser)]
#[command(name = "prompt-recorder")]
#[command(about = "Record LLM prompts from intercepted traffic and direct submissions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "prompt-recorder.yaml")]
    config: String,

    /// Log level when RUST_LOG is not set (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run flow events (JSON or JSON lines) through extraction
    Ingest {
        /// File with flow events, or - for stdin
        input: String,
    },

    /// Record a prompt directly
    Submit {
        /// Prompt text
        text: String,
        /// LLM name (ChatGPT, Claude, ...)
        #[arg(long)]
        llm: String,
        /// Model name
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Origin URL
        #[arg(long)]
        url: Option<String>,
        /// Conversation to file the prompt under
        #[arg(long)]
        conversation: Option<String>,
        #[arg(long, value_enum, default_value = "rest")]
        source: SubmitSource,
        /// Extra file to associate (repeatable)
        #[arg(short, long)]
        file: Vec<String>,
    },

    /// List recent prompts
    List {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
        /// Skip this many of the newest prompts
        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Search prompts
    Query {
        #[arg(long)]
        llm: Option<String>,
        /// proxy, assistant-integration or rest-api
        #[arg(long)]
        source: Option<String>,
        /// RFC 3339 lower bound
        #[arg(long)]
        since: Option<String>,
        /// RFC 3339 upper bound
        #[arg(long)]
        until: Option<String>,
        /// Substring of the prompt text
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        conversation: Option<String>,
        /// Substring of an associated file path
        #[arg(long)]
        file: Option<String>,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        #[arg(long)]
        offset: Option<usize>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show one prompt with its files
    Show {
        /// Prompt id or unique prefix
        id: String,
    },

    /// Link a recorded prompt to a file
    Associate {
        prompt_id: String,
        path: String,
        /// Net token delta in the file
        #[arg(long, allow_hyphen_values = true)]
        tokens: Option<i64>,
    },

    /// Restore the database from the backup store
    Reconcile,

    /// Show statistics
    Stats,

    /// Serve JSON-lines requests on stdin/stdout
    Serve,
}

#[derive(Clone, Copy, ValueEnum)]
enum SubmitSource {
    Rest,
    Assistant,
}

impl From<SubmitSource> for Source {
    fn from(source: SubmitSource) -> Self {
        match source {
            SubmitSource::Rest => Source::RestApi,
            SubmitSource::Assistant => Source::AssistantIntegration,
        }
    }
}

fn parse_bound(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|r| parse_timestamp(&r).with_context(|| format!("Invalid timestamp '{}'", r)))
        .transpose()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so the serve channel on stdout stays clean
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Load config
    let config = Config::load(&cli.config)?;

    let recorder = Recorder::open(config);

    match cli.command {
        Commands::Ingest { input } => {
            ingest::run(&recorder, &input)?;
        }
        Commands::Submit {
            text,
            llm,
            model,
            description,
            url,
            conversation,
            source,
            file,
        } => {
            let mut submission = Submission::new(text, llm);
            submission.model_name = model;
            submission.description = description;
            submission.url = url;
            submission.conversation_id = conversation;
            submission.source = source.into();
            submission.files = file;
            submit::run(&recorder, submission)?;
        }
        Commands::List { limit, offset } => {
            list::run(&recorder, limit, offset)?;
        }
        Commands::Query {
            llm,
            source,
            since,
            until,
            text,
            conversation,
            file,
            limit,
            offset,
            json,
        } => {
            let source = source
                .map(|s| Source::parse(&s).with_context(|| format!("Unknown source '{}'", s)))
                .transpose()?;
            let filter = PromptFilter {
                source,
                llm_name: llm,
                since: parse_bound(since)?,
                until: parse_bound(until)?,
                text,
                conversation_id: conversation,
                file_path: file,
                limit,
                offset,
            };
            list::query(&recorder, &filter, json)?;
        }
        Commands::Show { id } => {
            show::run(&recorder, &id)?;
        }
        Commands::Associate {
            prompt_id,
            path,
            tokens,
        } => {
            associate::run(&recorder, &prompt_id, &path, tokens)?;
        }
        Commands::Reconcile => {
            reconcile::run(&recorder)?;
        }
        Commands::Stats => {
            stats::run(&recorder)?;
        }
        Commands::Serve => {
            serve::run(recorder).await?;
        }
    }

    Ok(())
}
