//! Bearer-token verification against a single OpenID Connect issuer.
//!
//! The verifier decodes the unverified header for `kid`, pulls the issuer's
//! JWKS through [`jwks::JwksCache`], checks the signature, then validates
//! `iss`, `aud` and the `exp`/`nbf` window with a configurable leeway. A
//! signature failure (or unknown `kid`) triggers exactly one forced JWKS
//! refresh before the failure is returned — the key-rotation path.

use std::str::FromStr;
use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk};
use jsonwebtoken::{DecodingKey, Header, Validation};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub mod jwks;

pub use jsonwebtoken::Algorithm;

use jwks::{IssuerKeys, JwksCache};

#[derive(Debug, Error)]
pub enum AuthnError {
    /// The bearer string is not a decodable JWT at all.
    #[error("bearer token is not a valid JWT: {0}")]
    Malformed(String),
    /// The token's header algorithm is outside the allow-list.
    #[error("token signed with disallowed algorithm {0}")]
    DisallowedAlgorithm(String),
    /// No usable JWKS key matches the token's `kid`.
    #[error("no signing key matches the token")]
    UnknownKey,
    /// Signature or claim validation failed.
    #[error("token rejected: {0}")]
    Invalid(#[source] jsonwebtoken::errors::Error),
    /// Discovery or JWKS endpoint could not be reached.
    #[error("issuer unreachable: {0}")]
    IssuerUnreachable(String),
}

/// Validated claim set of an accepted token.
#[derive(Clone, Debug)]
pub struct VerifiedClaims {
    pub claims: Value,
}

impl VerifiedClaims {
    pub fn issuer(&self) -> Option<&str> {
        self.claims.get("iss").and_then(Value::as_str)
    }

    pub fn subject(&self) -> Option<&str> {
        self.claims.get("sub").and_then(Value::as_str)
    }
}

#[derive(Clone, Debug)]
pub struct VerifierConfig {
    pub openid_config_url: String,
    pub audiences: Vec<String>,
    pub allowed_algorithms: Vec<Algorithm>,
    pub leeway: Duration,
    pub jwks_ttl: Duration,
    /// Dev-only escape hatch: decode claims without verifying anything.
    pub disable_verification: bool,
}

impl VerifierConfig {
    pub fn new(openid_config_url: impl Into<String>, audiences: Vec<String>) -> Self {
        Self {
            openid_config_url: openid_config_url.into(),
            audiences,
            allowed_algorithms: vec![Algorithm::RS256, Algorithm::ES256],
            leeway: Duration::from_secs(30),
            jwks_ttl: Duration::from_secs(600),
            disable_verification: false,
        }
    }
}

pub struct TokenVerifier {
    config: VerifierConfig,
    jwks: JwksCache,
}

impl TokenVerifier {
    pub fn new(config: VerifierConfig) -> Result<Self, AuthnError> {
        if config.disable_verification {
            warn!("token verification is DISABLED; decoded claims are trusted as-is");
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| AuthnError::IssuerUnreachable(err.to_string()))?;
        let jwks = JwksCache::new(client, config.jwks_ttl);
        Ok(Self { config, jwks })
    }

    pub async fn verify(&self, token: &str) -> Result<VerifiedClaims, AuthnError> {
        if self.config.disable_verification {
            return decode_unverified(token);
        }

        let header = jsonwebtoken::decode_header(token)
            .map_err(|err| AuthnError::Malformed(err.to_string()))?;
        if !self.config.allowed_algorithms.contains(&header.alg) {
            return Err(AuthnError::DisallowedAlgorithm(format!("{:?}", header.alg)));
        }

        let keys = self.jwks.keys(&self.config.openid_config_url).await?;
        let first = self.verify_with_keys(token, &header, &keys);
        let rotation_candidate = match &first {
            Err(AuthnError::UnknownKey) => header.kid.is_some(),
            Err(AuthnError::Invalid(err)) => {
                matches!(err.kind(), ErrorKind::InvalidSignature)
            }
            _ => false,
        };
        if !rotation_candidate {
            return first;
        }

        let refreshed = self.jwks.refresh(&self.config.openid_config_url).await?;
        self.verify_with_keys(token, &header, &refreshed)
    }

    fn verify_with_keys(
        &self,
        token: &str,
        header: &Header,
        issuer_keys: &IssuerKeys,
    ) -> Result<VerifiedClaims, AuthnError> {
        let key = select_key(header, &issuer_keys.keys)?;
        let key_algorithm = key_algorithm(key).ok_or(AuthnError::UnknownKey)?;
        if key_algorithm != header.alg || !self.config.allowed_algorithms.contains(&key_algorithm) {
            return Err(AuthnError::DisallowedAlgorithm(format!("{key_algorithm:?}")));
        }
        let decoding_key = DecodingKey::from_jwk(key).map_err(|err| {
            warn!(%err, kid = ?key.common.key_id, "unusable JWKS key");
            AuthnError::UnknownKey
        })?;

        let mut validation = Validation::new(key_algorithm);
        validation.set_audience(&self.config.audiences);
        validation.set_issuer(&[issuer_keys.issuer.as_str()]);
        validation.leeway = self.config.leeway.as_secs();
        validation.validate_nbf = true;

        let data = jsonwebtoken::decode::<Value>(token, &decoding_key, &validation)
            .map_err(AuthnError::Invalid)?;
        Ok(VerifiedClaims {
            claims: data.claims,
        })
    }
}

/// Key selection: match the header's `kid`; a missing `kid` is accepted only
/// when the set holds exactly one key of the token's algorithm.
fn select_key<'a>(header: &Header, keys: &'a [Jwk]) -> Result<&'a Jwk, AuthnError> {
    match header.kid.as_deref() {
        Some(kid) => keys
            .iter()
            .find(|key| key.common.key_id.as_deref() == Some(kid))
            .ok_or(AuthnError::UnknownKey),
        None => match keys {
            [only] if key_algorithm(only) == Some(header.alg) => Ok(only),
            _ => Err(AuthnError::UnknownKey),
        },
    }
}

fn key_algorithm(key: &Jwk) -> Option<Algorithm> {
    if let Some(declared) = &key.common.key_algorithm {
        return Algorithm::from_str(&declared.to_string()).ok();
    }
    // No alg on the key: infer the conventional one from the key type.
    match &key.algorithm {
        AlgorithmParameters::RSA(_) => Some(Algorithm::RS256),
        AlgorithmParameters::EllipticCurve(params) => match params.curve {
            EllipticCurve::P256 => Some(Algorithm::ES256),
            EllipticCurve::P384 => Some(Algorithm::ES384),
            EllipticCurve::P521 => None,
            EllipticCurve::Ed25519 => Some(Algorithm::EdDSA),
        },
        _ => None,
    }
}

fn decode_unverified(token: &str) -> Result<VerifiedClaims, AuthnError> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.set_required_spec_claims::<&str>(&[]);
    let data = jsonwebtoken::decode::<Value>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|err| AuthnError::Malformed(err.to_string()))?;
    Ok(VerifiedClaims {
        claims: data.claims,
    })
}
