// src/main.rs

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use upload_pipeline::prelude::*;
use upload_pipeline::server;

#[derive(Parser)]
#[command(name = "upload_pipeline", version, about = "Chunked upload and batch processing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the upload server (configured through UPLOAD_* environment variables).
    Serve,
    /// Upload a file to a running server.
    Upload {
        path: PathBuf,
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,
        #[arg(long, value_enum, default_value_t = Kind::LeadImport)]
        upload_type: Kind,
        #[arg(long, default_value = "text/csv")]
        file_type: String,
        /// Trigger batch processing once the upload completes.
        #[arg(long)]
        process: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    LeadImport,
    TemplateAsset,
    BulkEmailAsset,
}

impl From<Kind> for UploadType {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::LeadImport => UploadType::LeadImport,
            Kind::TemplateAsset => UploadType::TemplateAsset,
            Kind::BulkEmailAsset => UploadType::BulkEmailAsset,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match Cli::parse().command {
        Command::Serve => {
            server::serve(ServerConfig::from_env(), Arc::new(AcceptAllProcessor)).await
        }
        Command::Upload { path, server, upload_type, file_type, process } => {
            upload(path, server, upload_type.into(), file_type, process).await
        }
    }
}

async fn upload(
    path: PathBuf,
    server: String,
    upload_type: UploadType,
    file_type: String,
    process: bool,
) -> Result<()> {
    let config = TransferConfig::from_env();
    let api = Arc::new(HttpUploadApi::new(server, config.request_timeout)?);
    let source = Arc::new(FileSource::open(&path).await?);
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());

    let upload = NewUpload { filename, file_type, upload_type, validation_rules: None };
    let (session, mut events) = UploadSession::create(api, source, upload, config).await?;
    println!("job {} created ({} chunks)", session.job_id(), session.job().total_chunks);

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                UploadEvent::UploadProgress(p) => println!(
                    "[upload] {:?} {}/{} chunks",
                    p.status, p.chunks_completed, p.total_chunks
                ),
                UploadEvent::ChunkRetrying { index, retry_count, error } => {
                    println!("[chunk {index}] retry {retry_count}: {error}")
                }
                UploadEvent::ChunkFailed { index, error } => {
                    println!("[chunk {index}] failed: {error}")
                }
                UploadEvent::ProcessingProgress(s) => println!(
                    "[process] {}/{} batches done, {} failed",
                    s.completed_batches, s.total_batches, s.failed_batches
                ),
                UploadEvent::ProcessingCompleted(s) => {
                    println!(
                        "[process] completed: {} ok, {} failed",
                        s.completed_batches, s.failed_batches
                    );
                    break;
                }
                UploadEvent::ProcessingFailed { message, .. } => {
                    println!("[process] failed: {message}");
                    break;
                }
                _ => {}
            }
        }
    });

    let cancel_on_ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let outcome = tokio::select! {
        outcome = session.start() => outcome?,
        _ = cancel_on_ctrl_c => {
            session.cancel().await;
            UploadOutcome::Cancelled
        }
    };

    match outcome {
        UploadOutcome::Cancelled => {
            println!("upload cancelled");
            printer.abort();
            return Ok(());
        }
        UploadOutcome::Uploaded => println!("upload complete"),
    }

    if !process {
        session.stop_polling().await;
        printer.abort();
        return Ok(());
    }

    let stats = session.start_processing(ProcessRequest::default()).await?;
    if stats.total_batches == 0 {
        println!("[process] nothing to process");
        session.stop_polling().await;
        printer.abort();
        return Ok(());
    }
    if printer.await.is_err() {
        bail!("event printer stopped unexpectedly");
    }
    session.stop_polling().await;
    Ok(())
}
