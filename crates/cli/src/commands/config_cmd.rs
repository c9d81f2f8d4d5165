//! `docchat config`: configuration management commands.

use std::path::Path;

use anyhow::Context;
use docchat_config::AppConfig;

const REDACTED: &str = "[REDACTED]";

/// Load the default config file or `path`, then apply environment overrides.
pub fn load(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let Some(path) = path else {
        return AppConfig::load().context("Failed to load config");
    };
    let mut config = AppConfig::load_from(path).context("Failed to load config")?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn redact(secret: &mut Option<String>) {
    if secret.is_some() {
        *secret = Some(REDACTED.into());
    }
}

pub fn show(path: Option<&Path>, defaults: bool) -> anyhow::Result<()> {
    if defaults {
        println!("{}", AppConfig::default_toml());
        return Ok(());
    }

    let mut config = load(path)?;
    redact(&mut config.llm.api_key);
    redact(&mut config.gateway.session_secret);
    redact(&mut config.database.postgres.password);
    redact(&mut config.database.mysql.password);
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

/// Things that load fine but will bite at runtime.
fn warnings(config: &AppConfig) -> Vec<&'static str> {
    let mut warnings = Vec::new();
    if config.gateway.session_secret.is_none() && !config.gateway.allow_header_auth {
        warnings.push("Gateway cannot identify users: set gateway.session_secret or gateway.allow_header_auth");
    }
    if config.gateway.allow_header_auth && config.gateway.host == "0.0.0.0" {
        warnings.push("Header auth trusts any caller, but the gateway binds to 0.0.0.0");
    }
    if config.database.postgres.password.is_none() && config.database.mysql.password.is_none() {
        warnings.push("No dump database passwords set (PG_PASSWORD / MYSQL_PASSWORD)");
    }
    warnings
}

pub fn validate(path: Option<&Path>) -> anyhow::Result<()> {
    println!("Validating configuration...");

    let config = match load(path) {
        Ok(config) => config,
        Err(e) => {
            println!("   Config error: {e:#}");
            return Err(e);
        }
    };
    println!("   Config parsed successfully");

    let warnings = warnings(&config);
    if warnings.is_empty() {
        println!("   All checks passed");
    } else {
        println!();
        for w in &warnings {
            println!("   warning: {w}");
        }
    }

    println!();
    println!("   Provider:    {:?}", config.llm.provider);
    println!("   Model:       {}", config.default_chat_model());
    println!("   Embeddings:  {}", config.llm.embed_model);
    println!("   Database:    {}", config.database.url);
    println!("   Vectors:     {}", config.database.vector_url);
    println!("   Gateway:     {}:{}", config.gateway.host, config.gateway.port);
    println!("   Uploads:     {}", config.ingest.upload_dir.display());
    Ok(())
}

pub fn path() {
    println!("{}", AppConfig::config_dir().join("config.toml").display());
}
