//! Shared helpers: tracing setup, the outbound HTTP client, and the
//! canonical proxy error envelope.

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize dotenv and structured tracing based on RUST_LOG.
///
/// The env file is loaded first so RUST_LOG set there takes effect; a
/// missing .env is not an error.
pub fn init_tracing() {
    let env_source = if dotenvy::dotenv().is_ok() {
        ".env"
    } else {
        "none"
    };

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("environment loaded from: {}", env_source);
}

/// Build the shared outbound HTTP client.
///
/// `PARIO_HTTP_TIMEOUT_SECONDS` caps the overall upstream request time;
/// unset means no client-side timeout (streams can be long-lived).
pub fn build_http_client() -> reqwest::Client {
    let mut builder = reqwest::Client::builder();

    if let Ok(secs) = std::env::var("PARIO_HTTP_TIMEOUT_SECONDS") {
        if let Ok(n) = secs.trim().parse::<u64>() {
            builder = builder.timeout(std::time::Duration::from_secs(n));
        }
    }

    builder = builder.user_agent(format!("pario/{}", env!("CARGO_PKG_VERSION")));
    builder.build().unwrap_or_else(|_| reqwest::Client::new())
}

/// Canonical error envelope for every proxy-originated error:
/// `{"error":{"message":…,"type":"pario_error","code":…}}`.
pub fn error_response(status: StatusCode, message: &str) -> HttpResponse {
    HttpResponse::build(status)
        .content_type("application/json")
        .json(serde_json::json!({
            "error": {
                "message": message,
                "type": "pario_error",
                "code": status.as_u16(),
            }
        }))
}
