use tracing::error;

#[tokio::main]
async fn main() {
    // The subscriber comes up before config assembly so override warnings
    // are not lost; LOG_LEVEL is read directly for that reason.
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    sluice::logging::init_logging(&log_level);

    let config = sluice::GatewayConfig::from_env();
    if let Err(errors) = config.validate() {
        error!(
            "Configuration validation failed:\n{}",
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n")
        );
        std::process::exit(1);
    }

    if let Err(e) = sluice::server::serve(config).await {
        error!("{}", e);
        std::process::exit(1);
    }
}
