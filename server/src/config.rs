use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use platform_authn::{Algorithm, VerifierConfig};
use platform_authz::SuperuserPrincipal;

/// Immutable process configuration, loaded once from the environment and
/// passed into components at construction.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Verbose error bodies (BENTO_DEBUG).
    pub debug: bool,
    /// Self URL reported by /service-info (BENTO_AUTHZ_SERVICE_URL).
    pub service_url: String,
    pub cors_origins: Vec<String>,
    /// Principals implicitly holding every permission (AUTHZ_SUPERUSERS).
    pub superusers: Vec<SuperuserPrincipal>,
    pub verifier: VerifierConfig,
    pub request_timeout: Duration,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let debug = env_flag("BENTO_DEBUG");
        let disable_verification = env_flag("DISABLE_TOKEN_VERIFICATION");

        let openid_config_url = std::env::var("OPENID_CONFIG_URL").unwrap_or_default();
        let audiences = split_list(
            &std::env::var("TOKEN_AUDIENCE").unwrap_or_else(|_| "account".into()),
        );

        let mut verifier = VerifierConfig::new(openid_config_url, audiences);
        verifier.disable_verification = disable_verification;
        if let Ok(raw) = std::env::var("TOKEN_ALLOWED_ALGORITHMS") {
            verifier.allowed_algorithms = parse_algorithms(&raw)?;
        }
        if let Ok(raw) = std::env::var("TOKEN_LEEWAY_SECONDS") {
            let secs: u64 = raw.parse().context("invalid TOKEN_LEEWAY_SECONDS")?;
            verifier.leeway = Duration::from_secs(secs);
        }
        if let Ok(raw) = std::env::var("JWKS_CACHE_TTL_SECONDS") {
            let secs: u64 = raw.parse().context("invalid JWKS_CACHE_TTL_SECONDS")?;
            verifier.jwks_ttl = Duration::from_secs(secs);
        }

        let superusers = match std::env::var("AUTHZ_SUPERUSERS") {
            Ok(raw) => parse_superusers(&raw)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            debug,
            service_url: std::env::var("BENTO_AUTHZ_SERVICE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:5000".into()),
            cors_origins: split_list(&std::env::var("CORS_ORIGINS").unwrap_or_default()),
            superusers,
            verifier,
            request_timeout: Duration::from_secs(10),
        })
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|value| matches!(value.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|item| {
            let trimmed = item.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

fn parse_algorithms(raw: &str) -> Result<Vec<Algorithm>> {
    split_list(raw)
        .iter()
        .map(|name| {
            Algorithm::from_str(name)
                .map_err(|_| anyhow!("unknown algorithm {name} in TOKEN_ALLOWED_ALGORITHMS"))
        })
        .collect()
}

fn parse_superusers(raw: &str) -> Result<Vec<SuperuserPrincipal>> {
    serde_json::from_str(raw)
        .context("AUTHZ_SUPERUSERS must be a JSON array of {\"iss\", \"sub\"} objects")
}
