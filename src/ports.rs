//! Port declaration translation
//!
//! Turns `8080`, `":80"`, `"9000:90"` and `"127.0.0.1:9001:91"` style
//! declarations into the exposed-port set and the published-port bindings the
//! engine expects.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const PROTOCOL: &str = "tcp";

/// One port declaration as written by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortToken {
    /// Exposed inside the container, never published
    Number(u16),
    /// `PORT`, `:PORT`, `HOSTPORT:PORT` or `HOSTIP:HOSTPORT:PORT`
    Spec(String),
}

impl From<u16> for PortToken {
    fn from(port: u16) -> Self {
        PortToken::Number(port)
    }
}

impl From<&str> for PortToken {
    fn from(spec: &str) -> Self {
        PortToken::Spec(spec.to_string())
    }
}

impl From<String> for PortToken {
    fn from(spec: String) -> Self {
        PortToken::Spec(spec)
    }
}

/// Host side of a published port
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortBinding {
    #[serde(rename = "HostPort")]
    pub host_port: String,
    #[serde(rename = "HostIp", default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
}

/// Exposed and published ports derived from a list of declarations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMap {
    /// `PORT/tcp` keys
    pub exposed: BTreeSet<String>,
    /// `PORT/tcp` to host bindings, sorted and free of duplicates
    pub published: BTreeMap<String, Vec<PortBinding>>,
}

impl PortMap {
    /// Translate declarations. Every host binding of a container port is
    /// kept, so the result does not depend on declaration order.
    pub fn parse(tokens: &[PortToken]) -> Result<Self> {
        let mut map = PortMap::default();

        for token in tokens {
            match token {
                PortToken::Number(port) => {
                    map.exposed.insert(port_key(*port));
                }
                PortToken::Spec(spec) if !spec.contains(':') => {
                    map.exposed.insert(port_key(parse_port(spec, spec)?));
                }
                PortToken::Spec(spec) => {
                    let (key, binding) = parse_binding(spec)?;
                    map.exposed.insert(key.clone());
                    let bindings = map.published.entry(key).or_default();
                    if let Err(at) = bindings.binary_search(&binding) {
                        bindings.insert(at, binding);
                    }
                }
            }
        }

        Ok(map)
    }

    /// Container port numbers, in ascending order
    pub fn container_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .exposed
            .iter()
            .filter_map(|key| key.split('/').next())
            .filter_map(|port| port.parse().ok())
            .collect();
        ports.sort_unstable();
        ports
    }

    pub fn is_empty(&self) -> bool {
        self.exposed.is_empty()
    }
}

fn parse_binding(spec: &str) -> Result<(String, PortBinding)> {
    let segments: Vec<&str> = spec.split(':').collect();

    let (host_ip, host_port, container_port) = match segments.as_slice() {
        [ip, host, container] if ip.contains('.') => (Some(*ip), *host, *container),
        [host, container] => (None, *host, *container),
        _ => {
            return Err(Error::InvalidSpec(format!(
                "port '{}' must look like PORT, :PORT, HOSTPORT:PORT or HOSTIP:HOSTPORT:PORT",
                spec
            )))
        }
    };

    let container_port = parse_port(container_port, spec)?;
    let key = port_key(container_port);

    // ':PORT' publishes the same port on the host and never carries an IP
    let binding = if host_port.is_empty() {
        PortBinding {
            host_port: container_port.to_string(),
            host_ip: None,
        }
    } else {
        PortBinding {
            host_port: parse_port(host_port, spec)?.to_string(),
            host_ip: host_ip.map(str::to_string),
        }
    };

    Ok((key, binding))
}

fn parse_port(segment: &str, spec: &str) -> Result<u16> {
    segment
        .parse()
        .map_err(|_| Error::InvalidSpec(format!("invalid port number '{}' in '{}'", segment, spec)))
}

fn port_key(port: u16) -> String {
    format!("{}/{}", port, PROTOCOL)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(raw: &[&str]) -> Vec<PortToken> {
        raw.iter().map(|s| PortToken::from(*s)).collect()
    }

    #[test]
    fn test_mixed_declarations() {
        let map = PortMap::parse(&tokens(&["8080", ":80", "9000:90", "127.0.0.1:9001:91"])).unwrap();

        let expected: BTreeSet<String> = ["8080/tcp", "80/tcp", "90/tcp", "91/tcp"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(map.exposed, expected);

        assert!(!map.published.contains_key("8080/tcp"));
        assert_eq!(
            map.published["80/tcp"],
            vec![PortBinding { host_port: "80".into(), host_ip: None }]
        );
        assert_eq!(
            map.published["90/tcp"],
            vec![PortBinding { host_port: "9000".into(), host_ip: None }]
        );
        assert_eq!(
            map.published["91/tcp"],
            vec![PortBinding { host_port: "9001".into(), host_ip: Some("127.0.0.1".into()) }]
        );
    }

    #[test]
    fn test_bare_number_is_never_published() {
        let map = PortMap::parse(&[PortToken::Number(5432)]).unwrap();
        assert!(map.exposed.contains("5432/tcp"));
        assert!(map.published.is_empty());
    }

    #[test]
    fn test_host_ip_with_empty_host_port() {
        let map = PortMap::parse(&tokens(&["10.0.0.1::443"])).unwrap();
        assert_eq!(
            map.published["443/tcp"],
            vec![PortBinding { host_port: "443".into(), host_ip: None }]
        );
    }

    #[test]
    fn test_order_independent() {
        let forward = PortMap::parse(&tokens(&["8080", "9000:90", "0.0.0.0:81:80"])).unwrap();
        let backward = PortMap::parse(&tokens(&["0.0.0.0:81:80", "9000:90", "8080"])).unwrap();
        assert_eq!(forward, backward);
        assert_eq!(forward, PortMap::parse(&tokens(&["8080", "9000:90", "0.0.0.0:81:80"])).unwrap());
    }

    #[test]
    fn test_one_container_port_on_two_host_ports() {
        let forward = PortMap::parse(&tokens(&["9000:90", "9001:90"])).unwrap();
        let backward = PortMap::parse(&tokens(&["9001:90", "9000:90"])).unwrap();
        assert_eq!(forward, backward);
        assert_eq!(
            forward.published["90/tcp"],
            vec![
                PortBinding { host_port: "9000".into(), host_ip: None },
                PortBinding { host_port: "9001".into(), host_ip: None },
            ]
        );

        let repeated = PortMap::parse(&tokens(&["9000:90", "9000:90"])).unwrap();
        assert_eq!(repeated.published["90/tcp"].len(), 1);
    }

    #[test]
    fn test_invalid_declarations() {
        assert!(PortMap::parse(&tokens(&["http"])).is_err());
        assert!(PortMap::parse(&tokens(&["80:"])).is_err());
        assert!(PortMap::parse(&tokens(&["1:2:3"])).is_err());
        assert!(PortMap::parse(&tokens(&["abc:80"])).is_err());
    }

    #[test]
    fn test_container_ports() {
        let map = PortMap::parse(&tokens(&["9000:90", "8080", ":22"])).unwrap();
        assert_eq!(map.container_ports(), vec![22, 90, 8080]);
    }

    #[test]
    fn test_binding_serializes_engine_keys() {
        let binding = PortBinding { host_port: "9001".into(), host_ip: Some("127.0.0.1".into()) };
        let json = serde_json::to_value(&binding).unwrap();
        assert_eq!(json["HostPort"], "9001");
        assert_eq!(json["HostIp"], "127.0.0.1");

        let bare = PortBinding { host_port: "80".into(), host_ip: None };
        assert!(serde_json::to_value(&bare).unwrap().get("HostIp").is_none());
    }

    #[test]
    fn test_tokens_deserialize_untagged() {
        let parsed: Vec<PortToken> = serde_json::from_str(r#"[8080, "9000:90"]"#).unwrap();
        assert_eq!(parsed, vec![PortToken::Number(8080), PortToken::Spec("9000:90".into())]);
    }
}
