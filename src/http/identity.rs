//! Mapping an inbound request to a rate limit identity and tier.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request};
use tracing::debug;

use crate::ratelimit::{ADDRESS_TIER, MAX_TIER};

/// Header carrying the API token.
pub const API_KEY_HEADER: &str = "api_key";

/// How requests are classified.
///
/// `address_only` and `token_only` are mutually exclusive. Setting both is a
/// broken deployment and every request bypasses the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityPolicy {
    /// Ignore tokens and always limit by client address
    pub address_only: bool,
    /// Require a token and limit by it
    pub token_only: bool,
}

/// Why a request was refused before reaching the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The token does not start with a supported tier digit
    TokenMalformed,
    /// A token is required but none was sent
    TokenMissing,
}

impl RejectReason {
    /// Response body for the rejection.
    pub fn message(self) -> &'static str {
        match self {
            RejectReason::TokenMalformed => "token malformed",
            RejectReason::TokenMissing => "token not found",
        }
    }
}

/// Result of classifying a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Ask the limiter about this identity
    Limit { identity: String, tier: u8 },
    /// Forward without consulting the limiter
    Bypass,
    /// Refuse as unauthorized
    Reject(RejectReason),
}

impl IdentityPolicy {
    /// Whether both exclusive modes are switched on.
    pub fn is_conflicting(&self) -> bool {
        self.address_only && self.token_only
    }

    /// Classify a request from its token and client address.
    ///
    /// An unknown client address yields an empty identity, which the limiter
    /// always denies.
    pub fn resolve(&self, token: Option<&str>, client_ip: Option<IpAddr>) -> Resolution {
        if self.is_conflicting() {
            return Resolution::Bypass;
        }

        let address = || client_ip.map(|ip| ip.to_string()).unwrap_or_default();

        if self.address_only {
            return Resolution::Limit {
                identity: address(),
                tier: ADDRESS_TIER,
            };
        }

        match token {
            Some(token) => match token_tier(token) {
                Some(tier) => Resolution::Limit {
                    identity: token.to_string(),
                    tier,
                },
                None => Resolution::Reject(RejectReason::TokenMalformed),
            },
            None if self.token_only => Resolution::Reject(RejectReason::TokenMissing),
            None => Resolution::Limit {
                identity: address(),
                tier: ADDRESS_TIER,
            },
        }
    }
}

/// Tier selected by a token: its first character as a decimal digit.
///
/// Returns `None` for a token that does not start with a digit or whose digit
/// exceeds [`MAX_TIER`].
pub fn token_tier(token: &str) -> Option<u8> {
    let digit = token.chars().next()?.to_digit(10)?;
    u8::try_from(digit).ok().filter(|tier| *tier <= MAX_TIER)
}

/// Read the API token header.
///
/// An absent or empty header is `Ok(None)`. A value that is not visible
/// ASCII cannot be a valid token and is reported as malformed.
pub fn extract_token(headers: &HeaderMap) -> Result<Option<&str>, RejectReason> {
    match headers.get(API_KEY_HEADER) {
        None => Ok(None),
        Some(value) => {
            let token = value.to_str().map_err(|_| RejectReason::TokenMalformed)?;
            Ok(Some(token).filter(|t| !t.is_empty()))
        }
    }
}

/// Resolve the real client address of a request.
///
/// Proxy headers win over the socket peer: `X-Forwarded-For` (leftmost
/// entry), then `X-Real-IP`, then RFC 7239 `Forwarded`, then the connection.
pub fn extract_client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    let headers = req.headers();
    let ip = from_forwarded_for(headers)
        .or_else(|| from_real_ip(headers))
        .or_else(|| from_forwarded(headers))
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        });
    debug!(ip = ?ip, "Resolved client address");
    ip
}

fn from_forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|ip| ip.trim().parse().ok())
}

fn from_real_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

fn from_forwarded(headers: &HeaderMap) -> Option<IpAddr> {
    // for=192.0.2.60;proto=http or for="[2001:db8::1]:4711"
    let value = headers.get("forwarded")?.to_str().ok()?;
    let first_hop = value.split(',').next()?;
    first_hop.split(';').find_map(|part| {
        let (key, node) = part.trim().split_once('=')?;
        if !key.eq_ignore_ascii_case("for") {
            return None;
        }
        let node = node.trim_matches('"');
        if let Some(rest) = node.strip_prefix('[') {
            return rest.split(']').next()?.parse().ok();
        }
        node.parse()
            .ok()
            .or_else(|| node.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
    })
}
