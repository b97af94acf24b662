//! Per-issuer JWKS cache.
//!
//! One entry per OpenID discovery URL. Entries expire after a TTL (the JWKS
//! response's `Cache-Control: max-age` when present, a configured default
//! otherwise). Concurrent misses for the same issuer coalesce behind a
//! per-issuer flight lock, so at most one outbound fetch per issuer is in
//! flight at any time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{Jwk, JwkSet, PublicKeyUse};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::AuthnError;

const FETCH_BACKOFFS: [Duration; 2] = [Duration::from_millis(200), Duration::from_millis(800)];

/// Grace window inside which a forced refresh reuses the entry a concurrent
/// caller just fetched instead of going out again.
const REFRESH_COALESCE_WINDOW: Duration = Duration::from_secs(1);

/// Issuer identity plus its current signing keys.
#[derive(Clone, Debug)]
pub struct IssuerKeys {
    pub issuer: String,
    pub keys: Vec<Jwk>,
}

#[derive(Clone)]
struct CachedEntry {
    keys: IssuerKeys,
    fetched_at: Instant,
    ttl: Duration,
}

impl CachedEntry {
    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < self.ttl
    }
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    issuer: String,
    jwks_uri: String,
}

pub struct JwksCache {
    client: reqwest::Client,
    default_ttl: Duration,
    entries: Mutex<HashMap<String, CachedEntry>>,
    flights: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl JwksCache {
    pub fn new(client: reqwest::Client, default_ttl: Duration) -> Self {
        Self {
            client,
            default_ttl,
            entries: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Keys for the issuer behind `openid_config_url`, fetching on a cold or
    /// stale cache.
    pub async fn keys(&self, openid_config_url: &str) -> Result<IssuerKeys, AuthnError> {
        if let Some(entry) = self.lookup(openid_config_url) {
            if entry.is_fresh() {
                return Ok(entry.keys);
            }
        }

        let flight = self.flight_for(openid_config_url);
        let _in_flight = flight.lock().await;
        // Another task may have completed the fetch while we waited.
        if let Some(entry) = self.lookup(openid_config_url) {
            if entry.is_fresh() {
                return Ok(entry.keys);
            }
        }
        self.fetch(openid_config_url).await
    }

    /// Forced refresh for the key-rotation path. Still coalesces: a refresh
    /// that lost the race to a just-completed one reuses its result.
    pub async fn refresh(&self, openid_config_url: &str) -> Result<IssuerKeys, AuthnError> {
        let flight = self.flight_for(openid_config_url);
        let _in_flight = flight.lock().await;
        if let Some(entry) = self.lookup(openid_config_url) {
            if entry.fetched_at.elapsed() < REFRESH_COALESCE_WINDOW {
                return Ok(entry.keys);
            }
        }
        self.fetch(openid_config_url).await
    }

    fn lookup(&self, openid_config_url: &str) -> Option<CachedEntry> {
        self.entries.lock().get(openid_config_url).cloned()
    }

    fn flight_for(&self, openid_config_url: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.flights
            .lock()
            .entry(openid_config_url.to_owned())
            .or_default()
            .clone()
    }

    async fn fetch(&self, openid_config_url: &str) -> Result<IssuerKeys, AuthnError> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(openid_config_url).await {
                Ok(keys) => return Ok(keys),
                Err(err) if attempt < FETCH_BACKOFFS.len() => {
                    warn!(%err, attempt, "JWKS fetch failed; retrying");
                    tokio::time::sleep(FETCH_BACKOFFS[attempt]).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn fetch_once(&self, openid_config_url: &str) -> Result<IssuerKeys, AuthnError> {
        let unreachable =
            |err: reqwest::Error| AuthnError::IssuerUnreachable(err.to_string());

        let discovery: DiscoveryDocument = self
            .client
            .get(openid_config_url)
            .send()
            .await
            .map_err(unreachable)?
            .error_for_status()
            .map_err(unreachable)?
            .json()
            .await
            .map_err(unreachable)?;

        let response = self
            .client
            .get(&discovery.jwks_uri)
            .send()
            .await
            .map_err(unreachable)?
            .error_for_status()
            .map_err(unreachable)?;

        let ttl = response
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_max_age)
            .unwrap_or(self.default_ttl);

        let set: JwkSet = response.json().await.map_err(unreachable)?;
        let keys: Vec<Jwk> = set
            .keys
            .into_iter()
            .filter(|key| {
                matches!(
                    key.common.public_key_use,
                    None | Some(PublicKeyUse::Signature)
                )
            })
            .collect();

        debug!(
            issuer = %discovery.issuer,
            key_count = keys.len(),
            ttl_secs = ttl.as_secs(),
            "JWKS fetched"
        );

        let keys = IssuerKeys {
            issuer: discovery.issuer,
            keys,
        };
        self.entries.lock().insert(
            openid_config_url.to_owned(),
            CachedEntry {
                keys: keys.clone(),
                fetched_at: Instant::now(),
                ttl,
            },
        );
        Ok(keys)
    }
}

fn parse_max_age(header: &str) -> Option<Duration> {
    header.split(',').find_map(|directive| {
        directive
            .trim()
            .to_ascii_lowercase()
            .strip_prefix("max-age=")
            .and_then(|value| value.trim().parse().ok())
            .map(Duration::from_secs)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_age_parsing() {
        assert_eq!(
            parse_max_age("max-age=300"),
            Some(Duration::from_secs(300))
        );
        assert_eq!(
            parse_max_age("public, max-age=86400, must-revalidate"),
            Some(Duration::from_secs(86400))
        );
        assert_eq!(
            parse_max_age("Public, Max-Age=60"),
            Some(Duration::from_secs(60))
        );
        assert_eq!(parse_max_age("no-store"), None);
        assert_eq!(parse_max_age("max-age=abc"), None);
    }
}
