//! Pipeline worker.
//!
//! Runs the retrieval listener and answers queries read from the command line
//! or, with no arguments, from stdin one per line. Stdin also accepts:
//!
//! ```text
//! :rate <token> <1-5>
//! :suggest <token> <text>...
//! :revision <token>
//! :help
//! ```

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use query_pipeline::security::ApiCredentials;
use query_pipeline::{
    FeedbackRecord, GenerationOutput, HttpExternalApi, HttpIntentApi, MemoryKnowledgeBase,
    OpenAiModel, Pipeline, PipelineBuilder, RevisionStatus, TavilyWebSearcher,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "pipeline-worker")]
#[command(about = "Answer campus sports queries through the retrieval pipeline")]
struct Cli {
    /// Queries to answer; with none, queries and commands are read from stdin
    queries: Vec<String>,
}

/// A `:`-prefixed stdin line.
#[derive(Parser, Debug)]
#[command(name = ":", no_binary_name = true)]
struct Line {
    #[command(subcommand)]
    command: LineCommand,
}

#[derive(Subcommand, Debug, PartialEq)]
enum LineCommand {
    /// Rate an answer from 1 to 5
    Rate {
        token: String,
        #[arg(value_parser = clap::value_parser!(u8).range(1..=5))]
        rating: u8,
    },

    /// Ask for a revised answer
    Suggest {
        token: String,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        text: Vec<String>,
    },

    /// Show the revision state of an answer
    Revision { token: String },
}

fn parse_line_command(line: &str) -> std::result::Result<LineCommand, clap::Error> {
    Line::try_parse_from(line.split_whitespace()).map(|line| line.command)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,query_pipeline=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true)
                .with_writer(std::io::stderr),
        )
        .init();

    tracing::info!("Starting pipeline worker");

    let config = Config::from_env().context("Failed to load configuration")?;
    let pipeline = build_pipeline(config).await?;

    let shutdown = CancellationToken::new();
    let listener = pipeline
        .start(shutdown.clone())
        .await
        .context("Failed to start retrieval listener")?;

    if cli.queries.is_empty() {
        tokio::select! {
            result = interactive(&pipeline) => result?,
            _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
        }
    } else {
        for query in cli.queries {
            let output = pipeline.process(None, &query).await;
            print_output(&output);
        }
    }

    pipeline.drain().await;
    shutdown.cancel();
    listener.await.context("Retrieval listener panicked")?;
    tracing::info!("Pipeline worker stopped");
    Ok(())
}

async fn build_pipeline(config: Config) -> Result<Pipeline> {
    let mut credentials = ApiCredentials::new(config.dashscope_api_key.expose());
    if let Some(url) = &config.model_base_url {
        credentials = credentials.with_base_url(url);
    }
    let model = Arc::new(OpenAiModel::from_credentials(&credentials));

    let mut builder = PipelineBuilder::new(config.pipeline).with_model(model);

    if let Some(path) = &config.knowledge_path {
        let knowledge = MemoryKnowledgeBase::from_json_file(path)
            .await
            .with_context(|| format!("Failed to load knowledge base from {}", path.display()))?;
        tracing::info!(documents = knowledge.len(), "Knowledge base loaded");
        builder = builder.with_knowledge(Arc::new(knowledge));
    }

    if !config.external_endpoints.is_empty() {
        let mut api = HttpExternalApi::new().context("Failed to build external API client")?;
        for (intent, url) in config.external_endpoints {
            api = api.with_endpoint(intent, url);
        }
        if let Some(key) = config.external_api_key {
            api = api.with_api_key(key);
        }
        builder = builder.with_external_api(Arc::new(api));
    }

    if let Some(url) = config.intent_api_url {
        let api = HttpIntentApi::new(url).context("Failed to build intent API client")?;
        builder = builder.with_intent_api(Arc::new(api));
    }

    match config.tavily_api_key {
        Some(key) => builder = builder.with_web_searcher(Arc::new(TavilyWebSearcher::new(key))),
        None => tracing::info!("TAVILY_API_KEY not set, web search unavailable"),
    }

    builder.build().context("Failed to build pipeline")
}

async fn interactive(pipeline: &Pipeline) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    // Feedback needs the session a token was issued in.
    let mut sessions: HashMap<String, String> = HashMap::new();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix(':') {
            match parse_line_command(command) {
                Ok(command) => {
                    if let Err(e) = run_command(pipeline, &sessions, command).await {
                        eprintln!("error: {e:#}");
                    }
                }
                // Help and usage errors render their own text.
                Err(e) => eprintln!("{e}"),
            }
            continue;
        }

        let output = pipeline.process(None, line).await;
        sessions.insert(output.feedback_token.clone(), output.session_id.clone());
        print_output(&output);
    }
    Ok(())
}

async fn run_command(
    pipeline: &Pipeline,
    sessions: &HashMap<String, String>,
    command: LineCommand,
) -> Result<()> {
    let session_of = |token: &str| {
        sessions
            .get(token)
            .cloned()
            .with_context(|| format!("unknown feedback token: {token}"))
    };

    match command {
        LineCommand::Rate { token, rating } => {
            let session = session_of(&token)?;
            let receipt = pipeline
                .submit_feedback(FeedbackRecord::new(session, token).with_rating(rating))
                .await?;
            println!("{:?}", receipt.rating);
        }
        LineCommand::Suggest { token, text } => {
            let session = session_of(&token)?;
            let receipt = pipeline
                .submit_feedback(FeedbackRecord::new(session, token).with_suggestions(text.join(" ")))
                .await?;
            println!("{:?}", receipt.revision);
        }
        LineCommand::Revision { token } => match pipeline.revision(&token).await? {
            RevisionStatus::Revised(output) => print_output(&output),
            other => println!("{other:?}"),
        },
    }
    Ok(())
}

fn print_output(output: &GenerationOutput) {
    println!("{}", output.answer);
    for asset in &output.media {
        println!("  [media] {}", asset.url);
    }
    if !output.sources.is_empty() {
        println!("  [sources] {}", output.sources.join(", "));
    }
    for related in &output.related_queries {
        println!("  [related] {related}");
    }
    println!("  [token] {} ({:?})", output.feedback_token, output.status);
}
