//! The "who is calling" capability.
//!
//! Session handling itself lives outside the core; the gateway extracts raw
//! credentials from the request and a [`UserResolver`] turns them into a user id.

use crate::error::AuthError;

/// Raw credentials pulled from an inbound request.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Value of `Authorization: Bearer <token>`.
    pub bearer: Option<String>,
    /// Value of the `X-User-Id` header.
    pub user_header: Option<String>,
}

pub trait UserResolver: Send + Sync {
    fn resolve(&self, credentials: &Credentials) -> Result<String, AuthError>;
}
