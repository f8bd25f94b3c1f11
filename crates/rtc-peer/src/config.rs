//! Configuration types for peer connections

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Peer-connection configuration installed at creation and replaced only
/// through [`PeerConnection::set_configuration`](crate::PeerConnection::set_configuration).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Configuration {
    /// STUN/TURN servers, in priority order
    pub ice_servers: Vec<IceServer>,

    /// Which candidates the engine may use (default: All)
    pub ice_transport_policy: IceTransportPolicy,

    /// Media bundling policy (default: Balanced)
    pub bundle_policy: BundlePolicy,

    /// RTCP multiplexing policy (default: Require)
    pub rtcp_mux_policy: RtcpMuxPolicy,

    /// Expected identity of the remote peer
    pub peer_identity: Option<String>,

    /// Candidates to pre-gather before an offer is created (default: 0)
    pub ice_candidate_pool_size: u8,
}

/// A single STUN or TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (stun:, stuns:, turn: or turns:)
    pub urls: Vec<String>,

    /// Username for TURN authentication
    #[serde(default)]
    pub username: String,

    /// Credential for TURN authentication
    #[serde(default)]
    pub credential: String,
}

/// ICE candidate filtering policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    /// Gather no candidates
    None,
    /// Only relay candidates
    Relay,
    /// Everything except host candidates
    NoHost,
    /// All candidate types
    #[default]
    All,
}

/// Bundle policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundlePolicy {
    #[default]
    Balanced,
    MaxBundle,
    MaxCompat,
}

/// RTCP multiplexing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtcpMuxPolicy {
    Negotiate,
    #[default]
    Require,
}

/// Constraints forwarded to the engine at creation and on every offer/answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    /// Use DTLS-SRTP keying (default: true)
    pub enable_dtls_srtp: bool,

    /// Offer to receive audio even without a local audio track (default: false)
    pub offer_to_receive_audio: bool,

    /// Offer to receive video even without a local video track (default: false)
    pub offer_to_receive_video: bool,

    /// Generate fresh ICE credentials on the next offer (default: false)
    pub ice_restart: bool,
}

/// Timing knobs for the negotiation coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationOptions {
    /// CreateOffer/CreateAnswer timeout in milliseconds (default: 3000)
    pub sdp_timeout_ms: u64,

    /// Cap on SetLocal/SetRemoteDescription in milliseconds (default: 30000, None = wait forever)
    pub set_description_timeout_ms: Option<u64>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            ice_transport_policy: IceTransportPolicy::All,
            bundle_policy: BundlePolicy::Balanced,
            rtcp_mux_policy: RtcpMuxPolicy::Require,
            peer_identity: None,
            ice_candidate_pool_size: 0,
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            enable_dtls_srtp: true,
            offer_to_receive_audio: false,
            offer_to_receive_video: false,
            ice_restart: false,
        }
    }
}

impl Default for NegotiationOptions {
    fn default() -> Self {
        Self {
            sdp_timeout_ms: 3000,
            set_description_timeout_ms: Some(30_000),
        }
    }
}

impl NegotiationOptions {
    /// Timeout applied to CreateOffer/CreateAnswer
    pub fn sdp_timeout(&self) -> Duration {
        Duration::from_millis(self.sdp_timeout_ms)
    }

    /// Cap applied to SetLocal/SetRemoteDescription, if any
    pub fn set_description_timeout(&self) -> Option<Duration> {
        self.set_description_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_sdp_timeout(mut self, timeout: Duration) -> Self {
        self.sdp_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_set_description_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.set_description_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.sdp_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "sdp_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.set_description_timeout_ms == Some(0) {
            return Err(Error::InvalidConfig(
                "set_description_timeout_ms must be greater than 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}

impl IceServer {
    /// Create a server entry from one URL or a comma-separated URL list.
    ///
    /// # Example
    ///
    /// ```
    /// use rtc_peer::config::IceServer;
    ///
    /// let server = IceServer::parse("stun:stun1.example.com, stun:stun2.example.com").unwrap();
    /// assert_eq!(server.urls.len(), 2);
    /// assert!(IceServer::parse("badurl").is_err());
    /// ```
    pub fn parse(urls: &str) -> Result<Self> {
        let urls: Vec<String> = urls
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .collect();

        let server = Self {
            urls,
            username: String::new(),
            credential: String::new(),
        };
        server.validate_urls()?;
        Ok(server)
    }

    /// Attach TURN credentials
    pub fn with_credentials(mut self, username: &str, credential: &str) -> Self {
        self.username = username.to_string();
        self.credential = credential.to_string();
        self
    }

    /// Validate URLs and credentials
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `urls` is empty
    /// - a URL has no stun:/stuns:/turn:/turns: scheme, no host, or a bad port
    /// - a TURN URL is present without username and credential
    pub fn validate(&self) -> Result<()> {
        self.validate_urls()?;

        let needs_credentials = self
            .urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"));
        if needs_credentials && (self.username.is_empty() || self.credential.is_empty()) {
            return Err(Error::InvalidConfig(format!(
                "TURN server {} requires username and credential",
                self.urls.join(",")
            )));
        }

        Ok(())
    }

    fn validate_urls(&self) -> Result<()> {
        if self.urls.is_empty() {
            return Err(Error::InvalidConfig(
                "ICE server requires at least one URL".to_string(),
            ));
        }
        for url in &self.urls {
            validate_ice_url(url)?;
        }
        Ok(())
    }

    /// True when any URL points at a TURN server
    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

fn validate_ice_url(url: &str) -> Result<()> {
    let (scheme, rest) = url
        .split_once(':')
        .ok_or_else(|| Error::InvalidConfig(format!("ICE server URL {url:?} has no scheme")))?;

    if !matches!(scheme, "stun" | "stuns" | "turn" | "turns") {
        return Err(Error::InvalidConfig(format!(
            "ICE server URL {url:?} has unsupported scheme {scheme:?}"
        )));
    }

    // Query (?transport=udp) is only meaningful for TURN
    let authority = match rest.split_once('?') {
        Some((authority, query)) => {
            if !scheme.starts_with("turn") {
                return Err(Error::InvalidConfig(format!(
                    "ICE server URL {url:?} has a query but is not a TURN URL"
                )));
            }
            if !matches!(query, "transport=udp" | "transport=tcp") {
                return Err(Error::InvalidConfig(format!(
                    "ICE server URL {url:?} has unsupported query {query:?}"
                )));
            }
            authority
        }
        None => rest,
    };

    if authority.is_empty() || authority.contains('/') || authority.contains(char::is_whitespace) {
        return Err(Error::InvalidConfig(format!(
            "ICE server URL {url:?} has an invalid host"
        )));
    }

    let port = if let Some(bracketed) = authority.strip_prefix('[') {
        let (_, after) = bracketed.split_once(']').ok_or_else(|| {
            Error::InvalidConfig(format!("ICE server URL {url:?} has an unterminated IPv6 host"))
        })?;
        after.strip_prefix(':')
    } else {
        match authority.split_once(':') {
            Some((host, port)) if !host.is_empty() => Some(port),
            Some(_) => {
                return Err(Error::InvalidConfig(format!(
                    "ICE server URL {url:?} has an empty host"
                )))
            }
            None => None,
        }
    };

    if let Some(port) = port {
        match port.parse::<u16>() {
            Ok(p) if p > 0 => {}
            _ => {
                return Err(Error::InvalidConfig(format!(
                    "ICE server URL {url:?} has an invalid port {port:?}"
                )))
            }
        }
    }

    Ok(())
}

impl Configuration {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - any ICE server entry is invalid (see [`IceServer::validate`])
    /// - `peer_identity` is set but empty
    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            server.validate()?;
        }

        if matches!(self.peer_identity.as_deref(), Some(id) if id.trim().is_empty()) {
            return Err(Error::InvalidConfig(
                "peer_identity must not be empty when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Configuration with a single public STUN server
    ///
    /// # Example
    ///
    /// ```
    /// use rtc_peer::config::Configuration;
    ///
    /// let config = Configuration::with_stun("stun:stun.l.google.com:19302");
    /// assert_eq!(config.ice_servers.len(), 1);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn with_stun(url: &str) -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec![url.to_string()],
                username: String::new(),
                credential: String::new(),
            }],
            ..Self::default()
        }
    }

    /// Append an ICE server
    pub fn with_ice_server(mut self, server: IceServer) -> Self {
        self.ice_servers.push(server);
        self
    }

    pub fn with_ice_transport_policy(mut self, policy: IceTransportPolicy) -> Self {
        self.ice_transport_policy = policy;
        self
    }

    pub fn with_bundle_policy(mut self, policy: BundlePolicy) -> Self {
        self.bundle_policy = policy;
        self
    }

    pub fn with_rtcp_mux_policy(mut self, policy: RtcpMuxPolicy) -> Self {
        self.rtcp_mux_policy = policy;
        self
    }

    pub fn with_peer_identity(mut self, identity: &str) -> Self {
        self.peer_identity = Some(identity.to_string());
        self
    }

    pub fn with_ice_candidate_pool_size(mut self, size: u8) -> Self {
        self.ice_candidate_pool_size = size;
        self
    }

    /// True when at least one TURN server is configured
    pub fn has_turn_server(&self) -> bool {
        self.ice_servers.iter().any(IceServer::is_turn)
    }

    /// Load a configuration from JSON and validate it
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
