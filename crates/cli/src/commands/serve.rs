//! `docchat serve`: start the HTTP API server.

use docchat_config::AppConfig;
use tracing::{info, warn};

/// Warn early when the model backend is down; the server still starts.
async fn probe_backend(config: &AppConfig) -> anyhow::Result<()> {
    let llm = docchat_providers::build_provider(&config.llm)?;
    match llm.health_check().await {
        Ok(true) => info!(provider = llm.name(), "Model backend reachable"),
        Ok(false) => warn!(provider = llm.name(), "Model backend reports no models"),
        Err(e) => warn!(provider = llm.name(), error = %e, "Model backend unreachable"),
    }
    Ok(())
}

pub async fn run(mut config: AppConfig, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.gateway.host = host;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }

    println!("DocChat gateway");
    println!("   Listening:   {}:{}", config.gateway.host, config.gateway.port);
    println!("   Model:       {}", config.default_chat_model());
    println!("   Header auth: {}", config.gateway.allow_header_auth);

    probe_backend(&config).await?;
    docchat_gateway::start(config)
        .await
        .map_err(|e| anyhow::anyhow!("Gateway failed: {e}"))
}
