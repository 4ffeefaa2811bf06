//! OIDC token verification.
//!
//! A client presents an ID token and the name of a configured provider.
//! Verification discovers the provider's endpoints, fetches its JWKS and
//! checks the token signature. The audience is checked only when a client
//! id is configured. An empty token or an unknown provider is not an error:
//! the caller gets an empty id and treats the session as a guest.

use crate::config::OidcConfig;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("oidc discovery failed: {0}")]
    Discovery(#[from] reqwest::Error),

    #[error("token has no matching key")]
    UnknownKey,

    #[error("token verification failed: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    preferred_username: Option<String>,
}

/// Verify `id_token` against the provider named `provider` and return the
/// stable user id.
///
/// Returns an empty id (not an error) when the token is empty or no
/// provider with that name is configured.
///
/// # Errors
///
/// Returns an [`AuthError`] when discovery fails or the token does not
/// verify; callers treat the session as unauthenticated either way.
pub async fn authenticate(
    id_token: &str,
    provider: &str,
    providers: &[OidcConfig],
) -> Result<String, AuthError> {
    if id_token.is_empty() || providers.is_empty() {
        return Ok(String::new());
    }
    let Some(config) = providers.iter().find(|p| p.name == provider) else {
        debug!(provider, "no oidc config for provider");
        return Ok(String::new());
    };

    let base = config.provider_url.trim_end_matches('/');
    let discovery: DiscoveryDocument =
        reqwest::get(format!("{base}/.well-known/openid-configuration"))
            .await?
            .error_for_status()?
            .json()
            .await?;
    let jwks: JwkSet = reqwest::get(&discovery.jwks_uri)
        .await?
        .error_for_status()?
        .json()
        .await?;

    let header = jsonwebtoken::decode_header(id_token)?;
    let jwk = match &header.kid {
        Some(kid) => jwks.find(kid),
        None => jwks.keys.first(),
    }
    .ok_or(AuthError::UnknownKey)?;
    let key = DecodingKey::from_jwk(jwk)?;

    let mut validation = Validation::new(header.alg);
    if config.client_id.is_empty() {
        validation.validate_aud = false;
    } else {
        validation.set_audience(&[config.client_id.as_str()]);
    }

    let token = jsonwebtoken::decode::<Claims>(id_token, &key, &validation)?;
    let claims = token.claims;
    Ok(claims.preferred_username.unwrap_or(claims.sub))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn providers() -> Vec<OidcConfig> {
        vec![OidcConfig {
            name: "google".into(),
            client_id: String::new(),
            provider_url: "https://accounts.google.com".into(),
        }]
    }

    #[tokio::test]
    async fn empty_token_is_a_guest() {
        let id = authenticate("", "google", &providers()).await.unwrap();
        assert!(id.is_empty());
    }

    #[tokio::test]
    async fn unknown_provider_is_a_guest() {
        let id = authenticate("some-token", "missing", &providers())
            .await
            .unwrap();
        assert!(id.is_empty());
    }

    #[tokio::test]
    async fn no_providers_configured_is_a_guest() {
        let id = authenticate("some-token", "google", &[]).await.unwrap();
        assert!(id.is_empty());
    }
}
