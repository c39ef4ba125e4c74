//! Join-token exchange
//!
//! A join token is base64 encoded JSON naming the new member, the existing
//! members it may contact, a one-time secret and the fingerprint of the
//! cluster certificate. The joining side tries the addresses in order and
//! only trusts a member whose certificate matches the fingerprint.
//!
//! `hearthd` only serves the issuing side. The joining side is a library
//! entry point: callers bring their own [`CertificateFetcher`] and post the
//! join request to the member [`resolve_join_target`] picks.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{ClusterResult, Error};

/// Port used when an address in a token carries none
pub const DEFAULT_PORT: u16 = 8443;

/// Error type returned by certificate fetchers
pub type FetchError = Box<dyn std::error::Error + Send + Sync>;

/// Decoded join token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinToken {
    /// Name the joining member will take
    pub server_name: String,
    /// Hex SHA-256 fingerprint of the cluster certificate
    pub fingerprint: String,
    /// Addresses of existing members, tried in order
    pub addresses: Vec<String>,
    /// One-time secret proving the token was issued by the cluster
    pub secret: String,
    /// When the token stops being accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl JoinToken {
    /// Decode and validate a token
    pub fn decode(input: &str) -> ClusterResult<Self> {
        let raw = STANDARD
            .decode(input.trim())
            .map_err(|e| Error::invalid_token(format!("Join token is not valid base64: {e}")))?;

        let token: JoinToken = serde_json::from_slice(&raw)
            .map_err(|e| Error::invalid_token(format!("Join token is not valid JSON: {e}")))?;

        if token.server_name.is_empty() {
            return Err(Error::invalid_token("No server name in join token"));
        }
        if token.addresses.is_empty() {
            return Err(Error::invalid_token(
                "No cluster member addresses in join token",
            ));
        }
        if token.secret.is_empty() {
            return Err(Error::invalid_token("No secret in join token"));
        }
        if token.fingerprint.is_empty() {
            return Err(Error::invalid_token(
                "No certificate fingerprint in join token",
            ));
        }

        Ok(token)
    }

    /// Encode the token for handing to an operator
    pub fn encode(&self) -> ClusterResult<String> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    /// Whether the token expired at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Hex SHA-256 fingerprint of a DER certificate
pub fn certificate_fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Normalize an address to `host:port`, adding `default_port` if missing
pub fn canonical_address(address: &str, default_port: u16) -> String {
    let address = address.trim();

    if let Ok(socket) = address.parse::<SocketAddr>() {
        return socket.to_string();
    }

    let bare = address.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return SocketAddr::new(ip, default_port).to_string();
    }

    match address.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => address.to_string(),
        _ => format!("{address}:{default_port}"),
    }
}

/// Retrieves the certificate presented by a remote member
#[async_trait]
pub trait CertificateFetcher: Send + Sync {
    /// DER encoded certificate served at `address` (`host:port`)
    async fn fetch_certificate(&self, address: &str) -> Result<Vec<u8>, FetchError>;
}

/// The member a join will go through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTarget {
    /// Canonical address of the member
    pub address: String,
    /// DER certificate it presented
    pub certificate: Vec<u8>,
}

/// Find the first member in the token whose certificate matches.
///
/// Unreachable members and members presenting a different certificate are
/// skipped. Fails with `InvalidToken` if none matches or the token expired.
///
/// Not called by the daemon itself; tools driving a join call it before
/// posting to `/1.0/cluster/join` on the returned address.
pub async fn resolve_join_target(
    token: &JoinToken,
    fetcher: &dyn CertificateFetcher,
) -> ClusterResult<JoinTarget> {
    if token.is_expired(Utc::now()) {
        return Err(Error::invalid_token(format!(
            "Join token for {} has expired",
            token.server_name
        )));
    }

    for candidate in &token.addresses {
        let address = canonical_address(candidate, DEFAULT_PORT);

        let certificate = match fetcher.fetch_certificate(&address).await {
            Ok(certificate) => certificate,
            Err(e) => {
                warn!("Error connecting to existing cluster member {}: {}", address, e);
                continue;
            }
        };

        let fingerprint = certificate_fingerprint(&certificate);
        if !fingerprint.eq_ignore_ascii_case(&token.fingerprint) {
            warn!(
                "Certificate fingerprint mismatch between join token and cluster member {}",
                address
            );
            continue;
        }

        info!("Joining cluster through member {}", address);
        return Ok(JoinTarget {
            address,
            certificate,
        });
    }

    Err(Error::invalid_token(
        "Unable to connect to any of the cluster members specified in join token",
    ))
}
