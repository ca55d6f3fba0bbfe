use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::multipart::{Form, Part};

#[derive(Parser)]
#[command(name = "tally", about = "Tally attendance CLI")]
struct Cli {
    /// Daemon base URL (or set TALLY_URL)
    #[arg(long, env = "TALLY_URL", default_value = "http://127.0.0.1:8095")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a person from a face photo
    Register {
        /// Externally assigned identity id
        #[arg(long)]
        id: String,
        /// Display name
        #[arg(long)]
        name: String,
        /// Path to the face image
        image: PathBuf,
    },
    /// List registered identities
    List,
    /// Remove a registered identity
    Remove {
        /// Identity id to remove
        id: String,
    },
    /// Mark attendance once from an image
    Mark {
        /// "entry" or "exit"
        #[arg(long, default_value = "entry")]
        entry_type: String,
        /// Path to the image
        image: PathBuf,
    },
    /// List recorded attendance events
    Events,
    /// Delete an attendance event by id
    DeleteEvent {
        /// Event id to delete
        id: i64,
    },
    /// Rank an image against every registered identity
    Diagnose {
        /// Similarity threshold to flag rows against
        #[arg(long)]
        threshold: Option<f32>,
        /// Path to the image
        image: PathBuf,
    },
    /// Check the daemon is reachable
    Status,
}

async fn image_part(path: &PathBuf) -> Result<Part> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(Part::bytes(bytes).file_name(
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string()),
    ))
}

/// Print a response body as pretty JSON, falling back to raw text.
async fn print_response(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    let body = response.text().await?;
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{body}"),
    }
    if !status.is_success() {
        anyhow::bail!("daemon returned {status}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Register { id, name, image } => {
            let form = Form::new()
                .text("user_id", id)
                .text("name", name)
                .part("image", image_part(&image).await?);
            let response = client.post(format!("{base}/users")).multipart(form).send().await?;
            print_response(response).await?;
        }
        Commands::List => {
            let response = client.get(format!("{base}/users")).send().await?;
            print_response(response).await?;
        }
        Commands::Remove { id } => {
            let response = client.delete(format!("{base}/users/{id}")).send().await?;
            print_response(response).await?;
        }
        Commands::Mark { entry_type, image } => {
            let form = Form::new()
                .text("entry_type", entry_type)
                .part("image", image_part(&image).await?);
            let response = client
                .post(format!("{base}/attendance/mark"))
                .multipart(form)
                .send()
                .await?;
            print_response(response).await?;
        }
        Commands::Events => {
            let response = client.get(format!("{base}/attendance")).send().await?;
            print_response(response).await?;
        }
        Commands::DeleteEvent { id } => {
            let response = client.delete(format!("{base}/attendance/{id}")).send().await?;
            print_response(response).await?;
        }
        Commands::Diagnose { threshold, image } => {
            let mut form = Form::new().part("image", image_part(&image).await?);
            if let Some(threshold) = threshold {
                form = form.text("threshold", threshold.to_string());
            }
            let response = client
                .post(format!("{base}/recognize/debug"))
                .multipart(form)
                .send()
                .await?;
            print_response(response).await?;
        }
        Commands::Status => {
            let response = client.get(format!("{base}/health")).send().await?;
            print_response(response).await?;
        }
    }

    Ok(())
}
