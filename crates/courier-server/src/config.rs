use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use courier_gateway::GatewayConfig;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub gateway: GatewayConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source. Unset keys fall back to defaults,
    /// except the JWT secret which is mandatory.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let jwt_secret = lookup("COURIER_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("COURIER_JWT_SECRET is unset or still a placeholder");
        }

        let host = lookup("COURIER_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = lookup("COURIER_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("COURIER_PORT must be a port number")?;
        let db_path: PathBuf = lookup("COURIER_DB_PATH")
            .unwrap_or_else(|| "courier.db".into())
            .into();

        let defaults = GatewayConfig::default();
        let gateway = GatewayConfig {
            typing_expiry: duration(&lookup, "COURIER_TYPING_EXPIRY_MS", Duration::from_millis, defaults.typing_expiry)?,
            store_timeout: duration(&lookup, "COURIER_STORE_TIMEOUT_MS", Duration::from_millis, defaults.store_timeout)?,
            heartbeat_interval: duration(&lookup, "COURIER_HEARTBEAT_SECS", Duration::from_secs, defaults.heartbeat_interval)?,
            ..defaults
        };

        Ok(Self {
            host,
            port,
            db_path,
            jwt_secret,
            gateway,
        })
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

fn duration(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    unit: fn(u64) -> Duration,
    default: Duration,
) -> Result<Duration> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => {
            let value: u64 = raw
                .parse()
                .with_context(|| format!("{} must be a positive integer", key))?;
            if value == 0 {
                bail!("{} must be greater than zero", key);
            }
            Ok(unit(value))
        }
    }
}
