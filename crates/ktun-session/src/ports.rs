//! Exposed port specs and the pre-checks run before dispatch
//!
//! Ports are given as a comma separated list of `<port>` or
//! `<local>:<remote>` entries, e.g. `7001,8080:80`.

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

/// Time allowed for probing a local port
pub const LOCAL_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid port spec '{spec}': {reason}")]
pub struct PortSpecError {
    spec: String,
    reason: String,
}

/// One exposed port: where the local application listens and which
/// port it answers for on the remote side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortMapping {
    pub local: u16,
    pub remote: u16,
}

impl PortMapping {
    pub fn new(local: u16, remote: u16) -> Self {
        Self { local, remote }
    }

    /// Parse a comma separated list of mappings
    pub fn parse_list(spec: &str) -> Result<Vec<PortMapping>, PortSpecError> {
        spec.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for PortMapping {
    type Err = PortSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_port = |value: &str| {
            value
                .trim()
                .parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| PortSpecError {
                    spec: s.to_string(),
                    reason: format!("'{}' is not a valid port", value),
                })
        };

        match s.split_once(':') {
            Some((local, remote)) => Ok(PortMapping::new(parse_port(local)?, parse_port(remote)?)),
            None => {
                let port = parse_port(s)?;
                Ok(PortMapping::new(port, port))
            }
        }
    }
}

/// First local port with nothing listening on it
pub async fn find_broken_local_port(mappings: &[PortMapping]) -> Option<u16> {
    for mapping in mappings {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, mapping.local));
        let reachable = matches!(
            tokio::time::timeout(LOCAL_CHECK_TIMEOUT, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        );
        if !reachable {
            debug!("No application listening on local port {}", mapping.local);
            return Some(mapping.local);
        }
    }
    None
}

/// First remote port that is not one of the target's ports
pub fn find_invalid_remote_port(mappings: &[PortMapping], target_ports: &[u16]) -> Option<u16> {
    mappings
        .iter()
        .map(|mapping| mapping.remote)
        .find(|port| !target_ports.contains(port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_single_and_mapped_ports() {
        let mappings = PortMapping::parse_list("7001, 8080:80").unwrap();
        assert_eq!(
            mappings,
            vec![PortMapping::new(7001, 7001), PortMapping::new(8080, 80)]
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("http".parse::<PortMapping>().is_err());
        assert!("8080:".parse::<PortMapping>().is_err());
        assert!("0".parse::<PortMapping>().is_err());
        assert!("70000".parse::<PortMapping>().is_err());

        let err = PortMapping::parse_list("80,abc").unwrap_err();
        assert!(err.to_string().contains("'abc' is not a valid port"));
    }

    #[test]
    fn test_empty_list() {
        assert!(PortMapping::parse_list("").unwrap().is_empty());
    }

    #[test]
    fn test_find_invalid_remote_port() {
        let mappings = PortMapping::parse_list("8080:80,9090:9000").unwrap();
        assert_eq!(find_invalid_remote_port(&mappings, &[80, 9000]), None);
        assert_eq!(find_invalid_remote_port(&mappings, &[80]), Some(9000));
    }

    #[tokio::test]
    async fn test_find_broken_local_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap().port();

        let dead = {
            let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
            unused.local_addr().unwrap().port()
        };

        assert_eq!(find_broken_local_port(&[PortMapping::new(live, 80)]).await, None);
        assert_eq!(
            find_broken_local_port(&[PortMapping::new(live, 80), PortMapping::new(dead, 81)]).await,
            Some(dead)
        );
    }
}
