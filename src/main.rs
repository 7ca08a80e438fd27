use push_deploy::config::{DEFAULT_BIND_ADDRESS, DEFAULT_CONFIG_PATH, WebhookSecret, load_config};
use push_deploy::executor::DeploymentExecutor;
use push_deploy::logging::{FileLogger, setup_logging};
use push_deploy::signature::SignatureVerifier;
use push_deploy::{AppState, router};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let file_logger = std::env::var("LOG_DIR").ok().map(|dir| FileLogger::new(PathBuf::from(dir)));
    let _log_guard = match setup_logging(file_logger.as_ref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to set up logging: {}", e);
            std::process::exit(1);
        }
    };

    let bind_address =
        std::env::var("BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());
    let config_path = PathBuf::from(
        std::env::var("DEPLOY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    );

    // Refuse to start rather than silently rejecting every delivery.
    let secret = match WebhookSecret::from_env() {
        Ok(secret) => secret,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let config = match load_config(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let executor = Arc::new(DeploymentExecutor::from_config(&config));
    let state = Arc::new(AppState::new(SignatureVerifier::new(secret), executor, &config));
    let app = router(state);

    info!("Listening on {}", bind_address);
    info!("Using config at {:?}", config_path);
    info!(
        "Deploying '{}' from {} as container '{}' ({:?} mode, {:?} when busy)",
        config.image_tag,
        config.repo_path.display(),
        config.container_name,
        config.mode,
        config.busy_policy
    );

    let listener = match tokio::net::TcpListener::bind(&bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", bind_address, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
