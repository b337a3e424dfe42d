//! HTTP API.
//!
//! | method | path | handler |
//! |---|---|---|
//! | GET | `/` | health |
//! | GET | `/docs` | endpoint listing |
//! | POST | `/generate-music` | [`crate::service::GenerationService::generate_music`] |
//! | POST | `/generate-image` | [`crate::service::GenerationService::generate_image`] |
//! | GET | `/files/{filename}` | stored artifact download |

mod error;
mod handlers;

use std::sync::Arc;

use axum::{
    Router,
    http::HeaderValue,
    routing::{get, post},
};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::ApiError;
pub use handlers::{GenerateImageRequest, GenerateMusicRequest};

use crate::service::GenerationService;
use crate::{Error, Result};

/// Build the application router.
pub fn create_router(service: Arc<GenerationService>, cors_origins: &[String]) -> Result<Router> {
    Ok(Router::new()
        .route("/", get(handlers::root))
        .route("/docs", get(handlers::docs))
        .route("/generate-music", post(handlers::generate_music))
        .route("/generate-image", post(handlers::generate_image))
        .route("/files/{filename}", get(handlers::get_file))
        .layer(TraceLayer::new_for_http())
        .layer(create_cors_layer(cors_origins)?)
        .with_state(service))
}

/// Explicit origins with credentials; methods and headers mirror the preflight.
fn create_cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let origins = origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .map_err(|e| Error::Config(format!("invalid CORS origin {origin:?}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request()))
}
