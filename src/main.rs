use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use pdf_summarizer::blob::{BlobSource, FsBlobSource, MemoryBlobSource};
use pdf_summarizer::config::{self, Config};
use pdf_summarizer::extract::LopdfExtractor;
use pdf_summarizer::notify::{TracingNotifier, deliver};
use pdf_summarizer::processing::{
    Chunker, Collaborators, DocumentRef, Orchestrator, PromptStore, Stage, UserId,
};
use pdf_summarizer::summarization::OllamaSummarizationClient;
use pdf_summarizer::{api, logging};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "pdf-summarizer", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server.
    Serve,
    /// Summarize one local PDF and print the result.
    Summarize {
        /// PDF file to summarize.
        path: PathBuf,
        /// User whose prompt profile applies.
        #[arg(long, default_value = "local")]
        user: String,
        /// Custom instruction for this run; `{text}` marks where the document goes.
        #[arg(long)]
        instruction: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // Config first: it loads `.env`, which may carry `RUST_LOG` and the log file path.
    let config = config::init_config().context("invalid configuration")?;
    logging::init_tracing(config.log_file.as_deref());
    tracing::debug!(
        ollama_url = %config.ollama_url,
        model = %config.summarization_model,
        chunk_max_units = config.chunk_max_units,
        chunk_unit = ?config.chunk_unit,
        max_concurrency = config.max_concurrency,
        server_port = ?config.server_port,
        "Loaded configuration"
    );

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Summarize {
            path,
            user,
            instruction,
        } => summarize(config, path, UserId(user), instruction).await,
    }
}

fn build_orchestrator(config: &Config, blobs: Arc<dyn BlobSource>) -> Result<Orchestrator> {
    let service = OllamaSummarizationClient::from_config(config)
        .context("failed to build summarization client")?;
    let chunker =
        Chunker::new(&config.chunker_settings()).context("failed to build document chunker")?;
    Ok(Orchestrator::new(
        Collaborators {
            blobs,
            extractor: Arc::new(LopdfExtractor),
            service: Arc::new(service),
        },
        Arc::new(PromptStore::new(config.default_instruction.clone())),
        chunker,
        config.reduction_policy(),
        config.orchestrator_settings(),
    ))
}

async fn serve(config: &Config) -> Result<()> {
    let blobs = Arc::new(FsBlobSource::new(
        &config.storage_dir,
        config.max_document_bytes,
    ));
    let orchestrator = Arc::new(build_orchestrator(config, blobs)?);
    let app = api::create_router(orchestrator);

    let (listener, port) = bind_listener(config)
        .await
        .context("failed to bind listener")?;
    tracing::info!("Listening on http://0.0.0.0:{}", port);
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

async fn summarize(
    config: &Config,
    path: PathBuf,
    user_id: UserId,
    instruction: Option<String>,
) -> Result<()> {
    let blobs = Arc::new(MemoryBlobSource::new(config.max_document_bytes));
    let orchestrator = build_orchestrator(config, blobs.clone())?;
    if let Some(instruction) = instruction {
        orchestrator
            .prompts()
            .set(&user_id, &instruction)
            .context("invalid --instruction")?;
    }

    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let file_ref = blobs
        .store(&file_name, Bytes::from(bytes))
        .await
        .context("failed to stage upload")?;
    let request = orchestrator.submit(
        &user_id,
        DocumentRef {
            file_ref,
            file_name,
        },
    );

    let terminal = tokio::select! {
        terminal = deliver(orchestrator.run(request), &TracingNotifier) => terminal,
        _ = tokio::signal::ctrl_c() => bail!("interrupted"),
    };
    match terminal.map(|event| event.stage) {
        Some(Stage::Completed(summary)) => {
            println!("{}", summary.render(config.max_message_chars));
            Ok(())
        }
        Some(Stage::Failed { cause }) => bail!(cause),
        _ => bail!("summarization ended without a result"),
    }
}

async fn bind_listener(config: &Config) -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    if let Some(port) = config.server_port {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 4100..=4199;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 4100-4199",
    ))
}
