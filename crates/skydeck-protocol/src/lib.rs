//! Identity-service protocol surface used by skydeck agents.
//!
//! Defines the `IdentityClient` contract (session create/resume/refresh,
//! server probe, profile lookup), its reqwest-backed XRPC implementation,
//! JWT claim decoding for expiry scheduling, and retry/backoff helpers.

pub mod jwt;
pub mod retry;
mod types;
mod xrpc;

pub use jwt::{decode_jwt_claims, encode_unsigned_jwt, JwtClaims};
pub use types::*;
pub use xrpc::{XrpcClient, XrpcClientConfig, DEFAULT_SERVICE_URL};

use async_trait::async_trait;

#[async_trait]
/// Trait contract for `IdentityClient` behavior.
///
/// Implementations never retry `refresh_session`: refresh tokens rotate on
/// use, so the caller owns the retry decision.
pub trait IdentityClient: Send + Sync {
    async fn create_session(
        &self,
        service_url: &str,
        identifier: &str,
        password: &str,
    ) -> Result<CreatedSession, ProtocolError>;

    async fn get_session(
        &self,
        service_url: &str,
        access_jwt: &str,
    ) -> Result<SessionInfo, ProtocolError>;

    async fn refresh_session(
        &self,
        service_url: &str,
        refresh_jwt: &str,
    ) -> Result<CreatedSession, ProtocolError>;

    async fn describe_server(&self, service_url: &str) -> Result<ServerDescription, ProtocolError>;

    async fn get_profile(
        &self,
        service_url: &str,
        access_jwt: &str,
        actor: &str,
    ) -> Result<ProfileView, ProtocolError>;
}
