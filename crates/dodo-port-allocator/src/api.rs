//! Request and response bodies of the allocator HTTP API
//!
//! These types are shared with the installer, which talks to the allocator
//! of every network an app exposes ports on.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Transport protocol of a forwarded port
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

impl Protocol {
    /// Both protocols, in the order they are written to the ingress release
    pub const ALL: [Protocol; 2] = [Protocol::Tcp, Protocol::Udp];

    /// Lowercase name as used in the ingress values
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    /// Case-insensitive; `TCP` and `tcp` are the same protocol
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(Error::invalid(format!("unexpected protocol {}", other))),
        }
    }
}

/// `POST /api/allocate`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateRequest {
    /// `tcp` or `udp`, any case
    pub protocol: String,
    /// Port to open on the ingress; picked by the allocator when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<u16>,
    /// In-cluster service the port forwards to
    pub target_service: String,
    /// Port on the target service
    pub target_port: u16,
    /// Secret returned by an earlier reserve call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl AllocateRequest {
    /// `service:port` written into the ingress release
    pub fn destination(&self) -> String {
        format!("{}:{}", self.target_service, self.target_port)
    }
}

/// `POST /api/reserve`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    /// Protocol the port will be used for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Specific port to reserve
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<u16>,
}

/// `POST /api/remove`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveRequest {
    /// `tcp` or `udp`, any case
    pub protocol: String,
    /// Mapped ingress port
    pub source_port: u16,
    /// Secret handed out when the port was allocated
    #[serde(default)]
    pub secret: String,
}

/// Answer to allocate and reserve
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortResponse {
    /// Ingress port
    pub port: u16,
    /// Proof of ownership required to remove the mapping
    pub secret: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_parsing_ignores_case() {
        assert_eq!("TCP".parse::<Protocol>().expect("tcp"), Protocol::Tcp);
        assert_eq!("udp".parse::<Protocol>().expect("udp"), Protocol::Udp);
        assert!(matches!(
            "sctp".parse::<Protocol>(),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn allocate_request_reads_camel_case() {
        let req: AllocateRequest = serde_json::from_str(
            r#"{"protocol":"TCP","sourcePort":2222,"targetService":"gerrit","targetPort":29418}"#,
        )
        .expect("parse");
        assert_eq!(req.source_port, Some(2222));
        assert_eq!(req.secret, None);
        assert_eq!(req.destination(), "gerrit:29418");
    }
}
