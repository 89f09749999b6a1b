//! Peer-to-peer networking
//!
//! Signaling goes through a WebSocket relay, peers talk over WebRTC data
//! channels.

mod lifecycle;
mod negotiation;
mod peer;
mod relay;
mod signaling;
mod timer;
mod transport;
mod turn;
mod webrtc;

pub use lifecycle::{ConnectionPhase, Lifecycle, LifecycleEffect};
pub use negotiation::{DescriptionAction, NegotiationPhase, Negotiator, Politeness};
pub use peer::{PeerConnection, PeerError, PeerEvent, PeerOptions, PeerRole};
pub use relay::{RelayConnector, RelayFrame, RelaySocket, WebSocketConnector};
pub use signaling::{
    classify_close, CloseAction, SignalingConnection, SignalingError, SignalingFailure,
    SignalingKind, SignalingMessage, SignalingOptions, SignalingStatus, CLOSE_ABNORMAL,
    CLOSE_ID_TAKEN, CLOSE_INVALID_ID, CLOSE_MISSING_ID, CLOSE_NORMAL, CLOSE_NO_STATUS,
};
pub use timer::ScheduledTask;
pub use transport::{
    IceCandidate, IceConfiguration, IceServer, PeerTransport, SdpType, SessionDescription,
    SignalingState, TransportError, TransportEvent, TransportFactory, TransportState,
    DATA_CHANNEL_LABEL,
};
pub use turn::{refresh_delay, CredentialProvider, RestCredentialProvider, TurnCredentials};
pub use webrtc::{WebRtcTransport, WebRtcTransportFactory};
