//! Peer transport seam
//!
//! [`PeerTransport`] is the slice of a WebRTC peer connection the
//! negotiation logic drives. Events flow back over the channel handed to
//! [`TransportFactory::create`]. Descriptions and candidates use the same
//! JSON shape browsers produce, so they can be relayed to browser peers
//! unchanged.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Label of the single data channel every connection carries
pub const DATA_CHANNEL_LABEL: &str = "data";

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to create transport: {0}")]
    Create(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Invalid ICE candidate: {0}")]
    Candidate(String),

    #[error("Data channel is not open")]
    ChannelNotOpen,

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Transport is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Offer or answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }
}

/// Trickled ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Offer/answer state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Aggregate connectivity of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// STUN or TURN server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Everything a transport needs to gather candidates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceConfiguration {
    pub ice_servers: Vec<IceServer>,
}

impl IceConfiguration {
    /// One STUN server plus TURN over TCP, UDP and TLS
    ///
    /// Both `?transport=` variants are listed so TCP relay candidates are
    /// gathered too; some privacy modes only allow those.
    pub fn new(
        stun_host: &str,
        stun_port: u16,
        turn_host: &str,
        turn_port: u16,
        username: Option<String>,
        credential: Option<String>,
    ) -> Self {
        Self {
            ice_servers: vec![
                IceServer {
                    urls: vec![format!("stun:{}:{}", stun_host, stun_port)],
                    username: None,
                    credential: None,
                },
                IceServer {
                    urls: vec![
                        format!("turn:{}:{}?transport=tcp", turn_host, turn_port),
                        format!("turn:{}:{}?transport=udp", turn_host, turn_port),
                        format!("turns:{}:{}", turn_host, turn_port),
                    ],
                    username,
                    credential,
                },
            ],
        }
    }
}

/// Something that happened on a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A (re)negotiation should start
    NegotiationNeeded,
    /// Local candidate to trickle to the remote
    IceCandidate(IceCandidate),
    StateChanged(TransportState),
    ChannelOpen,
    ChannelMessage(String),
    ChannelClosed,
}

/// The negotiable side of a peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    /// Create the data channel (caller side)
    async fn create_data_channel(&self) -> Result<(), TransportError>;

    /// Create and apply an offer or answer depending on signaling state,
    /// returning what was applied
    async fn set_local_description(&self) -> Result<SessionDescription, TransportError>;

    /// Apply a remote description
    ///
    /// An offer arriving while a local offer is pending rolls the local one
    /// back first.
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Mark the next offer as an ICE restart and request negotiation
    async fn restart_ice(&self) -> Result<(), TransportError>;

    /// Swap STUN/TURN servers without renegotiating
    async fn set_configuration(&self, config: IceConfiguration) -> Result<(), TransportError>;

    /// Send text on the open data channel
    async fn send(&self, text: String) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Builds transports
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        config: IceConfiguration,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}
