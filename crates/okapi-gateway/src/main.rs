//! Okapi gateway — entry point.
//!
//! Reads configuration from environment variables and starts the axum-based
//! gateway service.
//!
//! # Environment variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `OKAPI_PORT` | `9130` | TCP port to listen on. |
//! | `OKAPI_STEP_TIMEOUT_MS` | `30000` | Per-step backend timeout. |
//! | `OKAPI_REDIRECT_LIMIT` | `10` | Redirect hops before a loop is declared. |
//! | `RUST_LOG` | *(none)* | Standard tracing filter directives. |

use okapi_gateway::{AppState, GatewayConfig, serve};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("okapi_gateway=info".parse().expect("static directive")),
        )
        .init();

    let config = match GatewayConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };
    let state = match AppState::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to initialise gateway state");
            std::process::exit(1);
        }
    };

    if let Err(e) = serve(state).await {
        error!(error = %e, "gateway terminated");
        std::process::exit(1);
    }
}
