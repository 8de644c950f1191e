//! Shared network helpers
//!
//! Origin-allow-list policy and forwarded-for IP extraction, used by both
//! the WebSocket connection handler and the HTTP invite-validate endpoint
//! (§4.7, §4.8, §4.10).

use std::net::{IpAddr, SocketAddr};

use crate::config::{Config, EnvironmentMode};
use crate::error::BrokerError;

/// Decides whether an `Origin` header is acceptable, per §4.7 step 1.
pub struct OriginPolicy {
    environment: EnvironmentMode,
    allowed: Vec<String>,
}

impl OriginPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            environment: config.environment,
            allowed: config.allowed_origins.clone(),
        }
    }

    /// `None` origin header: allowed in development, rejected in
    /// production/test. A present header must match the allow-list.
    pub fn check(&self, origin: Option<&str>) -> Result<(), BrokerError> {
        match origin {
            None => {
                if self.environment == EnvironmentMode::Development {
                    Ok(())
                } else {
                    Err(BrokerError::OriginRequired)
                }
            }
            Some(origin) => {
                if self.allowed.iter().any(|a| a == origin) {
                    Ok(())
                } else {
                    Err(BrokerError::OriginNotAllowed)
                }
            }
        }
    }
}

/// First hop of the `X-Forwarded-For` chain if present, else the socket
/// peer address. Shared by the connection handler and the HTTP surface
/// so both agree on what "client IP" means for rate limiting.
pub fn client_ip(forwarded_for: Option<&str>, peer: SocketAddr) -> IpAddr {
    forwarded_for
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim())
        .and_then(|s| s.parse::<IpAddr>().ok())
        .unwrap_or_else(|| peer.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(environment: EnvironmentMode, allowed: Vec<&str>) -> OriginPolicy {
        OriginPolicy {
            environment,
            allowed: allowed.into_iter().map(String::from).collect(),
        }
    }

    #[test]
    fn missing_origin_allowed_in_development() {
        let p = policy(EnvironmentMode::Development, vec![]);
        assert!(p.check(None).is_ok());
    }

    #[test]
    fn missing_origin_rejected_in_production() {
        let p = policy(EnvironmentMode::Production, vec![]);
        assert!(matches!(p.check(None), Err(BrokerError::OriginRequired)));
    }

    #[test]
    fn allowed_origin_accepted() {
        let p = policy(EnvironmentMode::Production, vec!["https://example.test"]);
        assert!(p.check(Some("https://example.test")).is_ok());
    }

    #[test]
    fn unlisted_origin_rejected() {
        let p = policy(EnvironmentMode::Production, vec!["https://example.test"]);
        assert!(matches!(
            p.check(Some("https://evil.test")),
            Err(BrokerError::OriginNotAllowed)
        ));
    }

    #[test]
    fn client_ip_prefers_first_forwarded_hop() {
        let peer: SocketAddr = "192.168.1.1:9999".parse().unwrap();
        let ip = client_ip(Some("10.0.0.5, 10.0.0.6"), peer);
        assert_eq!(ip, "10.0.0.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn client_ip_falls_back_to_peer() {
        let peer: SocketAddr = "192.168.1.1:9999".parse().unwrap();
        assert_eq!(client_ip(None, peer), peer.ip());
        assert_eq!(client_ip(Some("not-an-ip"), peer), peer.ip());
    }
}
