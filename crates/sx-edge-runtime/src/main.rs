//! # SecureX Edge Runtime
//!
//! Entry point for the edge gateway binary.
//!
//! ## Startup
//!
//! 1. Initialise logging (`SX_LOG`, falling back to `RUST_LOG`, default `info`)
//! 2. Load configuration: defaults, then the TOML file named by `SX_CONFIG`,
//!    then `SX_*` environment overrides
//! 3. Validate once and build the gateway service
//! 4. Serve until Ctrl+C, then shut down gracefully
//!
//! Set `SX_LOG_FORMAT=json` for one JSON object per log line.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sx_edge_gateway::{EdgeGatewayService, GatewayConfig};

fn init_tracing(json: bool) -> Result<()> {
    let filter = std::env::var("SX_LOG")
        .ok()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    if json {
        builder
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install subscriber: {}", e))
    } else {
        builder
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install subscriber: {}", e))
    }
}

/// Load configuration from an optional TOML file plus environment overrides.
///
/// `env` is the variable lookup; `main` passes `std::env::var`.
fn load_config<F>(env: F) -> Result<GatewayConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match env("SX_CONFIG") {
        Some(path) => read_config_file(Path::new(&path))?,
        None => GatewayConfig::default(),
    };

    if let Some(port) = env("SX_HTTP_PORT") {
        config.http.port = port
            .parse()
            .with_context(|| format!("SX_HTTP_PORT is not a port: {}", port))?;
    }
    if let Some(port) = env("SX_ANALYSIS_PORT") {
        config.analysis.port = port
            .parse()
            .with_context(|| format!("SX_ANALYSIS_PORT is not a port: {}", port))?;
    }
    if let Some(url) = env("SX_CONTROL_PLANE_URL") {
        config.key_store.control_plane_url = Some(url);
    }
    if let Some(token) = env("SX_CONTROL_PLANE_TOKEN") {
        config.key_store.control_plane_token = Some(token);
    }
    if let Some(token) = env("SX_ANALYSIS_TOKEN") {
        config.analysis.api_token = Some(token);
    }

    Ok(config)
}

fn read_config_file(path: &Path) -> Result<GatewayConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config = toml::from_str(&raw)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    info!(path = %path.display(), "Loaded configuration file");
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let json = std::env::var("SX_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    init_tracing(json)?;

    let config = load_config(|key| std::env::var(key).ok())?;

    let service = Arc::new(EdgeGatewayService::new(config).context("invalid gateway configuration")?);

    info!("===========================================");
    info!("  {}", sx_edge_gateway::gateway_version());
    info!("  data plane  : {}", service.config().http_addr());
    if service.config().analysis.enabled {
        info!("  analysis    : {}", service.config().analysis_addr());
    }
    info!("===========================================");

    let mut server = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.start().await })
    };

    let joined = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
            info!("Shutdown signal received");
            service.shutdown();
            (&mut server).await
        }
        // Server exited on its own (bind failure etc)
        joined = &mut server => joined,
    };

    joined
        .map_err(|e| anyhow::anyhow!("gateway task panicked: {}", e))?
        .context("gateway server failed")?;

    info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_file() {
        let config = load_config(env_from(&[])).unwrap();
        assert_eq!(config.http.port, GatewayConfig::default().http.port);
        assert!(config.key_store.control_plane_url.is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[http]
port = 9100

[mitigation]
throttle_delay = "450ms"

[[key_store.static_keys]]
project_id = "7b0c6d52-4a53-4a8e-9a2c-5b0d1c3e8f10"
project_name = "shop"
upstream_base_url = "http://127.0.0.1:3000"
secret = "sx_live_local"
"#
        )
        .unwrap();

        let path = file.path().to_string_lossy().to_string();
        let config = load_config(env_from(&[("SX_CONFIG", path.as_str())])).unwrap();

        assert_eq!(config.http.port, 9100);
        assert_eq!(config.mitigation.throttle_delay, Duration::from_millis(450));
        assert_eq!(config.key_store.static_keys.len(), 1);
        assert_eq!(
            config.risk.spike_multiplier,
            GatewayConfig::default().risk.spike_multiplier
        );
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[http]\nport = 9100\n").unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config = load_config(env_from(&[
            ("SX_CONFIG", path.as_str()),
            ("SX_HTTP_PORT", "9200"),
            ("SX_ANALYSIS_TOKEN", "dash-secret"),
            ("SX_CONTROL_PLANE_URL", "http://control.local"),
        ]))
        .unwrap();

        assert_eq!(config.http.port, 9200);
        assert_eq!(config.analysis.api_token.as_deref(), Some("dash-secret"));
        assert_eq!(
            config.key_store.control_plane_url.as_deref(),
            Some("http://control.local")
        );
    }

    #[test]
    fn test_bad_port_is_an_error() {
        let err = load_config(env_from(&[("SX_HTTP_PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("SX_HTTP_PORT"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = load_config(env_from(&[("SX_CONFIG", "/nonexistent/sx-edge.toml")])).unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[http\nport = ").unwrap();
        let path = file.path().to_string_lossy().to_string();
        let err = load_config(env_from(&[("SX_CONFIG", path.as_str())])).unwrap_err();
        assert!(err.to_string().contains("parsing config file"));
    }
}
