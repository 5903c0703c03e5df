//! Subcommand bodies, kept apart from argument parsing so they can be tested.

use anyhow::{bail, Context as _, Result};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::info;
use xic_core::servant::PING_METHOD;
use xic_core::{echo_servant, Arguments, Engine, EngineConfig};

/// Read engine settings from a JSON file, or use defaults.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config = EngineConfig::from_json_str(&text)
        .with_context(|| format!("Invalid config {}", path.display()))?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Activate an adapter with an echo servant as its default. Returns the bound port.
pub async fn serve(engine: &Engine, endpoint: &str, service: &str) -> Result<u16> {
    let adapter = engine.create_adapter("Main", endpoint)?;
    adapter.set_default_servant(echo_servant(service));
    adapter.activate().await?;

    let endpoints = adapter.endpoints();
    let Some(bound) = endpoints.first() else {
        bail!("Adapter {} has no endpoint", adapter);
    };
    info!("Serving {} on {}", service, bound);
    Ok(bound.port())
}

pub fn parse_arguments(text: &str) -> Result<Arguments> {
    let value: serde_json::Value =
        serde_json::from_str(text).context("Arguments are not valid JSON")?;
    Ok(Arguments::try_from(value)?)
}

/// Invoke `method`. One-way calls return `None`.
pub async fn call(
    engine: &Engine,
    proxy: &str,
    method: &str,
    args: &str,
    oneway: bool,
) -> Result<Option<Arguments>> {
    let proxy = engine.string_to_proxy(proxy)?;
    let args = parse_arguments(args)?;
    if oneway {
        proxy.invoke_oneway(method, args).await?;
        return Ok(None);
    }
    Ok(Some(proxy.invoke(method, args).await?))
}

pub async fn ping(engine: &Engine, proxy: &str) -> Result<Duration> {
    let proxy = engine.string_to_proxy(proxy)?;
    let started = Instant::now();
    proxy.invoke(PING_METHOD, Arguments::new()).await?;
    Ok(started.elapsed())
}
