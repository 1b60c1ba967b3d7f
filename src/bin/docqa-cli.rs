use std::io::{BufRead, Write};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use docqa::models::IndexStatus;
use docqa::{AppConfig, AppState};

#[derive(Parser, Debug)]
#[command(name = "docqa-cli")]
#[command(about = "Index the data directory and ask questions from the terminal")]
struct Cli {
    /// Embedding model to use instead of EMBEDDING_MODEL.
    #[arg(long, global = true)]
    embedding_model: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the stored index, building one if needed.
    Index {
        #[arg(long, default_value_t = false)]
        rebuild: bool,
    },
    /// Answer questions read from stdin.
    Ask {
        #[arg(long, default_value_t = false)]
        rebuild: bool,
        /// Keep conversation history between questions.
        #[arg(long, default_value_t = false)]
        chat: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = AppConfig::from_env();
    if let Some(model) = cli.embedding_model {
        config.models.embedding_model = model;
    }
    tokio::fs::create_dir_all(&config.data_dir).await?;
    tokio::fs::create_dir_all(config.index_root()).await?;

    let state = AppState::from_config(config).await?;

    match cli.command {
        Command::Index { rebuild } => {
            let status = load_index(&state, rebuild).await?;
            println!(
                "Index {} ready. documents={} chunks={}",
                status.index_id.unwrap_or_default(),
                status.documents,
                status.chunks
            );
        }
        Command::Ask { rebuild, chat } => {
            load_index(&state, rebuild).await?;
            ask_loop(&state, chat).await?;
        }
    }

    Ok(())
}

async fn load_index(state: &AppState, rebuild: bool) -> Result<IndexStatus> {
    if !rebuild && state.restore().await? {
        if let Some(index) = state.slot().current().await {
            return Ok(index.status());
        }
    }

    println!("Building index from {}", state.config().data_dir.display());
    state.rebuild_from_data_dir().await
}

async fn ask_loop(state: &AppState, chat: bool) -> Result<()> {
    let Some(index) = state.slot().current().await else {
        anyhow::bail!("No documents indexed. Please upload files first.");
    };
    let session_id = format!("cli-{}", uuid::Uuid::new_v4());

    println!("Type 'exit' to quit");
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next() else {
            break;
        };
        let question = line?;
        let question = question.trim();
        if question.eq_ignore_ascii_case("exit") {
            break;
        }
        if question.is_empty() {
            continue;
        }

        let answer = if chat {
            state.answers().chat(&index, &session_id, question).await
        } else {
            state.answers().query(&index, question).await
        };

        match answer {
            Ok(answer) => {
                println!("{}", answer.response);
                if !answer.sources.is_empty() {
                    println!("Sources:");
                    for (idx, source) in answer.sources.iter().enumerate() {
                        println!("[{}]: {}", idx + 1, source);
                    }
                }
            }
            Err(err) => eprintln!("error: {err:#}"),
        }
    }

    println!("Goodbye!");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
