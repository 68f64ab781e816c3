//! Access-token verification
//!
//! Requests arrive from an access proxy. Identity resolution, in order:
//! a pre-authenticated email header, a JWT assertion validated against the
//! proxy's JWKS (service tokens mapped by their `common_name` claim), the
//! `public`/`debug` sentinels, and otherwise rejection. User-scoped quota
//! enforcement is a KV blocklist lookup.

use std::collections::HashMap;

use anyhow::{Context, Result};
use axum::http::HeaderMap;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, TokenData, Validation, decode, decode_header};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ServiceToken;
use crate::error::{ApiError, ApiResult};
use crate::kv::KvStore;

/// Pre-authenticated identity header set by the access proxy
pub const AUTH_EMAIL_HEADER: &str = "Cf-Access-Authenticated-User-Email";

/// JWT assertion header set by the access proxy
pub const JWT_HEADER: &str = "cf-access-jwt-assertion";

/// KV set of user ids rejected on every request
pub const BLACKLIST_NS: &str = "global_blacklist";

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub common_name: Option<String>,
    #[serde(default)]
    pub exp: Option<u64>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
}

/// JWT verifier with its key set and the known service-token registry
pub struct Verifier {
    keys: Vec<(Option<String>, DecodingKey)>,
    validation: Validation,
    service_tokens: HashMap<String, String>,
    debug: bool,
}

impl Verifier {
    /// Fetch the JWKS once at startup and index service tokens by client id
    pub async fn from_jwks(
        http: &reqwest::Client,
        jwks_url: &str,
        audiences: &[String],
        issuers: &[String],
        service_tokens: &[ServiceToken],
        debug: bool,
    ) -> Result<Self> {
        let jwks: JwkSet = http
            .get(jwks_url)
            .send()
            .await
            .context("fetching jwks")?
            .error_for_status()?
            .json()
            .await
            .context("parsing jwks")?;

        let mut keys = Vec::new();
        for jwk in &jwks.keys {
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => keys.push((jwk.common.key_id.clone(), key)),
                Err(e) => warn!("skipping unusable jwk: {e}"),
            }
        }
        anyhow::ensure!(!keys.is_empty(), "jwks at {jwks_url} yielded no usable keys");

        // The access proxy publishes RSA keys; symmetric key sets only show
        // up in local test deployments.
        let algo = if jwks
            .keys
            .iter()
            .any(|k| matches!(k.algorithm, AlgorithmParameters::OctetKey(_)))
        {
            Algorithm::HS256
        } else {
            Algorithm::RS256
        };

        Ok(Self {
            keys,
            validation: access_validation(algo, audiences, issuers),
            service_tokens: token_registry(service_tokens),
            debug,
        })
    }

    /// Resolve the caller identity from request headers.
    ///
    /// `public` marks routes that accept unauthenticated callers.
    pub fn identity(&self, headers: &HeaderMap, public: bool) -> ApiResult<String> {
        if let Some(email) = header_str(headers, AUTH_EMAIL_HEADER) {
            return Ok(email.to_string());
        }

        if let Some(token) = header_str(headers, JWT_HEADER) {
            let data = self.verify(token)?;
            if let Some(email) = data.claims.email {
                return Ok(email);
            }
            if let Some(cn) = &data.claims.common_name {
                if let Some(name) = self.service_tokens.get(cn) {
                    return Ok(name.clone());
                }
            }
            info!("token verified but identity unknown: {:?}", data.claims);
            return Ok("debug_unknown".to_string());
        }

        if public {
            return Ok("public".to_string());
        }
        if self.debug {
            return Ok("debug".to_string());
        }
        Err(ApiError::Unauthorized("missing access credentials".into()))
    }

    fn verify(&self, token: &str) -> ApiResult<TokenData<Claims>> {
        let kid = decode_header(token).ok().and_then(|h| h.kid);

        let candidates = self.keys.iter().filter(|(id, _)| match (&kid, id) {
            (Some(kid), Some(id)) => kid == id,
            _ => true,
        });
        let mut last_err = None;
        for (_, key) in candidates {
            match decode::<Claims>(token, key, &self.validation) {
                Ok(data) => return Ok(data),
                Err(e) => last_err = Some(e),
            }
        }

        // Reject with the raw claims in the log so bad tokens can be
        // diagnosed without ever trusting them.
        if let Some(claims) = unverified_claims(token) {
            warn!(
                "rejecting invalid access token, raw claims: {}",
                serde_json::to_string(&claims).unwrap_or_default()
            );
        }
        Err(ApiError::Unauthorized(format!(
            "invalid access token: {}",
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "no keys".into())
        )))
    }
}

/// Reject callers acting for a blocklisted end user
pub async fn check_blacklist(kv: &KvStore, user_id: &str) -> ApiResult<()> {
    if kv.sismember(BLACKLIST_NS, user_id).await? {
        return Err(ApiError::Unauthorized(format!(
            "user {user_id} is blacklisted"
        )));
    }
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).filter(|v| !v.is_empty())
}

fn access_validation(algo: Algorithm, audiences: &[String], issuers: &[String]) -> Validation {
    let mut validation = Validation::new(algo);
    if !audiences.is_empty() {
        validation.set_audience(audiences);
    } else {
        validation.validate_aud = false;
    }
    if !issuers.is_empty() {
        validation.set_issuer(issuers);
    }
    validation
}

fn token_registry(tokens: &[ServiceToken]) -> HashMap<String, String> {
    tokens
        .iter()
        .map(|t| (t.client_id.clone(), t.name.clone()))
        .collect()
}

fn unverified_claims(token: &str) -> Option<Claims> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    decode::<Claims>(token, &DecodingKey::from_secret(b""), &validation)
        .map(|d| d.claims)
        .ok()
}
