//! Request credentials to user id.
//!
//! Session tokens have the form `<base64url(user id)>.<hex hmac-sha256>`, the MAC
//! taken over the encoded user id with `gateway.session_secret`.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use docchat_config::GatewayConfig;
use docchat_core::auth::{Credentials, UserResolver};
use docchat_core::error::{AuthError, Error};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// Verifies HMAC-signed bearer tokens.
pub struct SessionTokenResolver {
    secret: Vec<u8>,
}

impl SessionTokenResolver {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|e| AuthError::InvalidToken(e.to_string()))
    }

    /// Sign a token for `user_id`.
    pub fn issue(&self, user_id: &str) -> Result<String, AuthError> {
        let encoded = URL_SAFE_NO_PAD.encode(user_id.as_bytes());
        let mut mac = self.mac()?;
        mac.update(encoded.as_bytes());
        Ok(format!("{encoded}.{}", hex::encode(mac.finalize().into_bytes())))
    }

    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let (encoded, signature) = token
            .split_once('.')
            .ok_or_else(|| AuthError::InvalidToken("malformed token".into()))?;
        let provided = hex::decode(signature).map_err(|_| AuthError::InvalidToken("malformed signature".into()))?;

        let mut mac = self.mac()?;
        mac.update(encoded.as_bytes());
        // Constant-time comparison
        mac.verify_slice(&provided)
            .map_err(|_| AuthError::InvalidToken("bad signature".into()))?;

        let user = URL_SAFE_NO_PAD
            .decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| AuthError::InvalidToken("malformed user id".into()))?;
        Ok(user)
    }
}

impl UserResolver for SessionTokenResolver {
    fn resolve(&self, credentials: &Credentials) -> Result<String, AuthError> {
        match &credentials.bearer {
            Some(token) => self.verify(token),
            None => Err(AuthError::MissingCredentials),
        }
    }
}

/// Trusts an `X-User-Id` header. For local, single-user deployments.
pub struct HeaderUserResolver;

impl UserResolver for HeaderUserResolver {
    fn resolve(&self, credentials: &Credentials) -> Result<String, AuthError> {
        credentials
            .user_header
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .ok_or(AuthError::MissingCredentials)
    }
}

/// Tries each resolver in turn. A rejected token is final; missing credentials
/// fall through to the next resolver.
pub struct ChainedResolver {
    resolvers: Vec<Arc<dyn UserResolver>>,
}

impl ChainedResolver {
    pub fn new(resolvers: Vec<Arc<dyn UserResolver>>) -> Self {
        Self { resolvers }
    }
}

impl UserResolver for ChainedResolver {
    fn resolve(&self, credentials: &Credentials) -> Result<String, AuthError> {
        for resolver in &self.resolvers {
            match resolver.resolve(credentials) {
                Err(AuthError::MissingCredentials) => continue,
                other => return other,
            }
        }
        Err(AuthError::MissingCredentials)
    }
}

/// The resolver the gateway configuration asks for.
pub fn resolver_from_config(config: &GatewayConfig) -> Result<Arc<dyn UserResolver>, Error> {
    let mut resolvers: Vec<Arc<dyn UserResolver>> = Vec::new();
    if let Some(secret) = config.session_secret.as_deref().filter(|s| !s.is_empty()) {
        resolvers.push(Arc::new(SessionTokenResolver::new(secret)));
    }
    if config.allow_header_auth {
        resolvers.push(Arc::new(HeaderUserResolver));
    }
    if resolvers.is_empty() {
        return Err(Error::config(
            "no way to identify users: set gateway.session_secret or gateway.allow_header_auth",
        ));
    }
    Ok(Arc::new(ChainedResolver::new(resolvers)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bearer(token: &str) -> Credentials {
        Credentials {
            bearer: Some(token.into()),
            user_header: None,
        }
    }

    #[test]
    fn issued_tokens_verify() {
        let resolver = SessionTokenResolver::new("s3cret");
        let token = resolver.issue("alice@example.com").unwrap();
        assert_eq!(resolver.resolve(&bearer(&token)).unwrap(), "alice@example.com");
    }

    #[test]
    fn tampered_or_foreign_tokens_are_rejected() {
        let resolver = SessionTokenResolver::new("s3cret");
        let token = resolver.issue("alice").unwrap();
        let (_, sig) = token.split_once('.').unwrap();
        let forged = format!("{}.{sig}", URL_SAFE_NO_PAD.encode("mallory"));
        assert!(matches!(resolver.resolve(&bearer(&forged)), Err(AuthError::InvalidToken(_))));

        let other = SessionTokenResolver::new("different").issue("alice").unwrap();
        assert!(matches!(resolver.resolve(&bearer(&other)), Err(AuthError::InvalidToken(_))));
        assert!(matches!(resolver.resolve(&bearer("garbage")), Err(AuthError::InvalidToken(_))));
        assert!(matches!(
            resolver.resolve(&Credentials::default()),
            Err(AuthError::MissingCredentials)
        ));
    }

    #[test]
    fn header_resolver_requires_a_value() {
        let creds = Credentials {
            bearer: None,
            user_header: Some(" bob ".into()),
        };
        assert_eq!(HeaderUserResolver.resolve(&creds).unwrap(), "bob");
        assert!(HeaderUserResolver.resolve(&Credentials::default()).is_err());
    }

    #[test]
    fn chain_falls_through_missing_but_not_invalid() {
        let mut config = GatewayConfig::default();
        config.session_secret = Some("k".into());
        config.allow_header_auth = true;
        let chain = resolver_from_config(&config).unwrap();

        let header_only = Credentials {
            bearer: None,
            user_header: Some("bob".into()),
        };
        assert_eq!(chain.resolve(&header_only).unwrap(), "bob");

        let bad_token = Credentials {
            bearer: Some("x.00".into()),
            user_header: Some("bob".into()),
        };
        assert!(chain.resolve(&bad_token).is_err());
    }

    #[test]
    fn some_resolver_must_be_configured() {
        assert!(resolver_from_config(&GatewayConfig::default()).is_err());
    }
}
