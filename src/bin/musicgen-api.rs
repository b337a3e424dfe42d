//! musicgen-api server: text-to-music and text-to-image over HTTP.
//!
//! Loads MusicGen (required) and Stable Diffusion (optional) at startup,
//! downloading weights from HuggingFace on first run, then serves the API.
//!
//! # Usage
//!
//! ```sh
//! musicgen-api --port 8000 --outputs-dir outputs
//!
//! # Without the image model:
//! MUSICGEN_API_DISABLE_IMAGE_MODEL=1 musicgen-api
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser, builder::FalseyValueParser};
use musicgen_api::{
    api,
    artifact::ArtifactStore,
    config::{ImageConfig, MusicConfig, ServerConfig},
    manager::{GenerationManager, preferred_device},
    pipeline::{MusicGenPipeline, StableDiffusionPipeline},
    service::{GenerationService, ImageBackend},
};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "musicgen-api",
    about = "HTTP API for MusicGen text-to-music and Stable Diffusion text-to-image"
)]
struct Args {
    /// Address to bind.
    #[arg(long, env = "MUSICGEN_API_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, env = "MUSICGEN_API_PORT", default_value_t = 8000)]
    port: u16,

    /// Directory generated files are written to and served from.
    #[arg(long, env = "MUSICGEN_API_OUTPUTS_DIR", default_value = "outputs")]
    outputs_dir: PathBuf,

    /// URL prefix returned as `fileUrl`; the filename is appended.
    #[arg(long, env = "MUSICGEN_API_PUBLIC_BASE_URL", default_value = "http://localhost:8000/files")]
    public_base_url: String,

    /// Allowed CORS origin. Repeat for several.
    #[arg(
        long = "cors-origin",
        env = "MUSICGEN_API_CORS_ORIGINS",
        value_delimiter = ',',
        default_values_t = ServerConfig::default().cors_origins
    )]
    cors_origins: Vec<String>,

    /// HuggingFace repo for MusicGen.
    #[arg(long, env = "MUSICGEN_API_MUSIC_MODEL", default_value = "facebook/musicgen-small")]
    music_model: String,

    /// HuggingFace repo for Stable Diffusion v1.5.
    #[arg(
        long,
        env = "MUSICGEN_API_IMAGE_MODEL",
        default_value = "stable-diffusion-v1-5/stable-diffusion-v1-5"
    )]
    image_model: String,

    /// CUDA device ordinal.
    #[arg(long, env = "MUSICGEN_API_CUDA_DEVICE", default_value_t = 0)]
    cuda_device: usize,

    /// Do not load the image model; /generate-image then always fails.
    /// The env var accepts `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off`.
    #[arg(
        long,
        env = "MUSICGEN_API_DISABLE_IMAGE_MODEL",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new()
    )]
    disable_image_model: bool,
}

impl Args {
    fn into_configs(self) -> (ServerConfig, MusicConfig, ImageConfig) {
        let server = ServerConfig {
            host: self.host,
            port: self.port,
            outputs_dir: self.outputs_dir,
            public_base_url: self.public_base_url,
            cors_origins: self.cors_origins,
            cuda_device: self.cuda_device,
        };
        let music = MusicConfig {
            model_id: self.music_model,
            ..MusicConfig::default()
        };
        let image = ImageConfig {
            model_id: self.image_model,
            disabled: self.disable_image_model,
            ..ImageConfig::default()
        };
        (server, music, image)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (server_config, music_config, image_config) = Args::parse().into_configs();

    let device = preferred_device(server_config.cuda_device);
    info!(device = ?device, "selected compute device");

    let music = {
        let device = device.clone();
        let model_id = music_config.model_id.clone();
        GenerationManager::start("music", move || MusicGenPipeline::load(&model_id, &device))
            .await
            .map_err(|e| anyhow::anyhow!("failed to load music model: {e}"))?
    };

    let image = load_image_backend(&image_config, &device).await;

    let store = ArtifactStore::new(&server_config.outputs_dir, &server_config.public_base_url);
    tokio::fs::create_dir_all(store.dir()).await?;
    info!(outputs = %store.dir().display(), "artifact directory ready");

    let service = Arc::new(GenerationService::new(
        music,
        image,
        store,
        music_config,
        image_config,
    ));
    let app = api::create_router(service, &server_config.cors_origins)?;

    let addr = server_config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Load Stable Diffusion, degrading to [`ImageBackend::Unavailable`] on failure.
async fn load_image_backend(config: &ImageConfig, device: &candle_core::Device) -> ImageBackend {
    if config.disabled {
        warn!("image model disabled; /generate-image will report it as not loaded");
        return ImageBackend::Unavailable("disabled at startup".to_string());
    }

    let config = config.clone();
    let device = device.clone();
    match GenerationManager::start("image", move || StableDiffusionPipeline::load(&config, &device)).await {
        Ok(manager) => ImageBackend::Ready(manager),
        Err(error) => {
            warn!(%error, "failed to load image model; continuing without it");
            ImageBackend::Unavailable(error.to_string())
        }
    }
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            warn!(%error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                warn!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
