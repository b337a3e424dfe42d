//! Simple command-line client for the musicgen-api server.
//!
//! Sends a generation request, prints the JSON descriptor to stdout and
//! optionally downloads the generated file. Exits 0 on success, 1 on error.
//!
//! # Usage
//!
//! ```sh
//! musicgen-client music "lofi hip hop with warm piano" --download /tmp/lofi.wav
//!
//! musicgen-client image "a watercolor fox" --negative-prompt "blurry"
//! ```

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(name = "musicgen-client", about = "Send a generation request to musicgen-api")]
struct Args {
    /// Server base URL
    #[arg(long, env = "MUSICGEN_API_URL", default_value = "http://localhost:8000")]
    server: String,

    /// Timeout in seconds to wait for generation (default: 600)
    #[arg(long, default_value = "600")]
    timeout_secs: u64,

    /// Save the generated file here
    #[arg(long, global = true)]
    download: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a 10 second music clip
    Music { prompt: String },
    /// Generate a 256x256 image
    Image {
        prompt: String,
        /// What the image should steer away from
        #[arg(long)]
        negative_prompt: Option<String>,
    },
}

#[derive(Serialize)]
#[serde(untagged)]
enum Request {
    Music {
        prompt: String,
    },
    Image {
        prompt: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        negative_prompt: Option<String>,
    },
}

#[derive(Deserialize)]
struct ErrorResponse {
    detail: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let base = args.server.trim_end_matches('/').to_string();

    let (path, request) = match args.command {
        Command::Music { prompt } => ("generate-music", Request::Music { prompt }),
        Command::Image {
            prompt,
            negative_prompt,
        } => (
            "generate-image",
            Request::Image {
                prompt,
                negative_prompt,
            },
        ),
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout_secs))
        .build()?;

    let response = client
        .post(format!("{base}/{path}"))
        .json(&request)
        .send()
        .await
        .with_context(|| format!("failed to reach {base}"))?;

    let status = response.status();
    if !status.is_success() {
        let detail = response
            .json::<ErrorResponse>()
            .await
            .map(|e| e.detail)
            .unwrap_or_else(|_| status.to_string());
        bail!("server returned {status}: {detail}");
    }

    let descriptor: serde_json::Value = response.json().await.context("failed to parse response")?;
    println!("{descriptor}");

    if let Some(target) = args.download {
        let url = descriptor["fileUrl"]
            .as_str()
            .context("response has no fileUrl")?;
        let bytes = client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        tokio::fs::write(&target, &bytes)
            .await
            .with_context(|| format!("failed to write {}", target.display()))?;
        eprintln!("saved {} bytes → {}", bytes.len(), target.display());
    }

    Ok(())
}
