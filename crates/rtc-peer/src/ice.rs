//! ICE candidates
//!
//! [`IceCandidate`] is the interchange value exchanged over the signaling
//! channel; [`CandidateDescriptor`] is the parsed `candidate` attribute.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Candidate as carried over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// `candidate:...` attribute text
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,

    /// Index of the m-line the candidate belongs to
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: i32,
}

/// Candidate that passed validation, ready for the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedIceCandidate {
    pub sdp_mid: String,
    pub sdp_mline_index: u16,
    pub descriptor: CandidateDescriptor,
}

/// Transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceProtocol {
    Udp,
    Tcp,
}

/// Candidate type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceCandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
}

/// TCP candidate type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTcpCandidateType {
    Active,
    Passive,
    So,
}

/// Parsed `candidate:` attribute (RFC 8839 section 5.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateDescriptor {
    pub foundation: String,
    pub component: u16,
    pub protocol: IceProtocol,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub candidate_type: IceCandidateType,
    pub related_address: Option<String>,
    pub related_port: Option<u16>,
    pub tcp_type: Option<IceTcpCandidateType>,
    /// Trailing extension pairs such as `generation 0` or `ufrag abcd`
    pub extensions: Vec<(String, String)>,
}

impl IceCandidate {
    pub fn new(candidate: &str, sdp_mid: &str, sdp_mline_index: i32) -> Self {
        Self {
            candidate: candidate.to_string(),
            sdp_mid: sdp_mid.to_string(),
            sdp_mline_index,
        }
    }

    /// Validate the candidate and parse its attribute.
    ///
    /// # Errors
    ///
    /// [`Error::CandidateParse`] when the m-line index is negative or out of
    /// range, or the candidate text is empty or malformed.
    pub fn parse(&self) -> Result<ParsedIceCandidate> {
        let sdp_mline_index = u16::try_from(self.sdp_mline_index).map_err(|_| {
            Error::CandidateParse(format!(
                "sdpMLineIndex {} is out of range",
                self.sdp_mline_index
            ))
        })?;
        if self.candidate.trim().is_empty() {
            return Err(Error::CandidateParse("candidate text is empty".to_string()));
        }
        let descriptor = self.candidate.parse::<CandidateDescriptor>()?;

        Ok(ParsedIceCandidate {
            sdp_mid: self.sdp_mid.clone(),
            sdp_mline_index,
            descriptor,
        })
    }

    /// `{"candidate":"...","sdpMid":"...","sdpMLineIndex":0}`
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl ParsedIceCandidate {
    /// Back to the interchange form
    pub fn to_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: self.descriptor.to_string(),
            sdp_mid: self.sdp_mid.clone(),
            sdp_mline_index: i32::from(self.sdp_mline_index),
        }
    }
}

impl CandidateDescriptor {
    /// Host UDP candidate with `generation 0`
    pub fn host(foundation: &str, component: u16, address: &str, port: u16, priority: u32) -> Self {
        Self {
            foundation: foundation.to_string(),
            component,
            protocol: IceProtocol::Udp,
            priority,
            address: address.to_string(),
            port,
            candidate_type: IceCandidateType::Host,
            related_address: None,
            related_port: None,
            tcp_type: None,
            extensions: vec![("generation".to_string(), "0".to_string())],
        }
    }

    /// Value of extension `key`
    pub fn extension(&self, key: &str) -> Option<&str> {
        self.extensions
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl FromStr for CandidateDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let text = s.trim();
        let text = text.strip_prefix("a=").unwrap_or(text);
        let text = text.strip_prefix("candidate:").ok_or_else(|| {
            Error::CandidateParse(format!("missing 'candidate:' prefix in {s:?}"))
        })?;

        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(Error::CandidateParse(format!(
                "expected at least 8 fields, found {}",
                fields.len()
            )));
        }

        let foundation = fields[0];
        if foundation.is_empty() || foundation.len() > 32 {
            return Err(Error::CandidateParse(format!(
                "invalid foundation {foundation:?}"
            )));
        }
        let component = parse_field::<u16>("component", fields[1])?;
        if !(1..=256).contains(&component) {
            return Err(Error::CandidateParse("component must be 1-256".to_string()));
        }
        let protocol = match fields[2].to_ascii_lowercase().as_str() {
            "udp" => IceProtocol::Udp,
            "tcp" => IceProtocol::Tcp,
            other => {
                return Err(Error::CandidateParse(format!(
                    "unsupported transport {other:?}"
                )))
            }
        };
        let priority = parse_field::<u32>("priority", fields[3])?;
        let address = fields[4].to_string();
        let port = parse_field::<u16>("port", fields[5])?;

        if fields[6] != "typ" {
            return Err(Error::CandidateParse(format!(
                "expected 'typ', found {:?}",
                fields[6]
            )));
        }
        let candidate_type = match fields[7] {
            "host" => IceCandidateType::Host,
            "srflx" => IceCandidateType::Srflx,
            "prflx" => IceCandidateType::Prflx,
            "relay" => IceCandidateType::Relay,
            other => {
                return Err(Error::CandidateParse(format!(
                    "unknown candidate type {other:?}"
                )))
            }
        };

        let rest = &fields[8..];
        if rest.len() % 2 != 0 {
            return Err(Error::CandidateParse(
                "extension attributes must come in name/value pairs".to_string(),
            ));
        }

        let mut descriptor = CandidateDescriptor {
            foundation: foundation.to_string(),
            component,
            protocol,
            priority,
            address,
            port,
            candidate_type,
            related_address: None,
            related_port: None,
            tcp_type: None,
            extensions: Vec::new(),
        };

        for pair in rest.chunks(2) {
            let (key, value) = (pair[0], pair[1]);
            match key {
                "raddr" => descriptor.related_address = Some(value.to_string()),
                "rport" => descriptor.related_port = Some(parse_field::<u16>("rport", value)?),
                "tcptype" => {
                    descriptor.tcp_type = Some(match value {
                        "active" => IceTcpCandidateType::Active,
                        "passive" => IceTcpCandidateType::Passive,
                        "so" => IceTcpCandidateType::So,
                        other => {
                            return Err(Error::CandidateParse(format!(
                                "unknown tcptype {other:?}"
                            )))
                        }
                    })
                }
                _ => descriptor
                    .extensions
                    .push((key.to_string(), value.to_string())),
            }
        }

        if descriptor.tcp_type.is_some() && descriptor.protocol != IceProtocol::Tcp {
            return Err(Error::CandidateParse(
                "tcptype on a non-TCP candidate".to_string(),
            ));
        }

        Ok(descriptor)
    }
}

fn parse_field<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| Error::CandidateParse(format!("invalid {name} {value:?}")))
}

impl fmt::Display for CandidateDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.address,
            self.port,
            self.candidate_type
        )?;
        if let Some(addr) = &self.related_address {
            write!(f, " raddr {addr}")?;
        }
        if let Some(port) = self.related_port {
            write!(f, " rport {port}")?;
        }
        if let Some(tcp_type) = self.tcp_type {
            write!(f, " tcptype {tcp_type}")?;
        }
        for (key, value) in &self.extensions {
            write!(f, " {key} {value}")?;
        }
        Ok(())
    }
}

impl fmt::Display for IceProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IceProtocol::Udp => "udp",
            IceProtocol::Tcp => "tcp",
        })
    }
}

impl fmt::Display for IceCandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IceCandidateType::Host => "host",
            IceCandidateType::Srflx => "srflx",
            IceCandidateType::Prflx => "prflx",
            IceCandidateType::Relay => "relay",
        })
    }
}

impl fmt::Display for IceTcpCandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IceTcpCandidateType::Active => "active",
            IceTcpCandidateType::Passive => "passive",
            IceTcpCandidateType::So => "so",
        })
    }
}
