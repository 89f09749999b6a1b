//! Collaborators shared by every peer of a session

use std::sync::Arc;

use crate::config::{BackendConfig, Timing};
use crate::metadata::MetadataCache;
use crate::network::{
    CredentialProvider, PeerOptions, RelayConnector, RestCredentialProvider, SignalingOptions,
    TransportFactory, WebRtcTransportFactory, WebSocketConnector,
};

/// Backend configuration plus the relay, transport and metadata seams
///
/// Handed to [`ListeningPeer`](super::ListeningPeer) constructors instead of
/// reaching for globals.
#[derive(Clone)]
pub struct PeerContext {
    pub config: BackendConfig,
    pub timing: Timing,
    pub relay: Arc<dyn RelayConnector>,
    pub transports: Arc<dyn TransportFactory>,
    pub metadata: Arc<dyn MetadataCache>,
    /// Set from `config.turn_credentials_url` unless replaced
    pub credentials: Option<Arc<dyn CredentialProvider>>,
}

impl PeerContext {
    pub fn new(
        config: BackendConfig,
        relay: Arc<dyn RelayConnector>,
        transports: Arc<dyn TransportFactory>,
        metadata: Arc<dyn MetadataCache>,
    ) -> Self {
        let credentials = config.turn_credentials_url.as_ref().map(|url| {
            Arc::new(RestCredentialProvider::new(url.clone())) as Arc<dyn CredentialProvider>
        });
        Self {
            config,
            timing: Timing::default(),
            relay,
            transports,
            metadata,
            credentials,
        }
    }

    /// WebSocket relay and WebRTC transports
    pub fn webrtc(config: BackendConfig, metadata: Arc<dyn MetadataCache>) -> Self {
        Self::new(
            config,
            Arc::new(WebSocketConnector),
            Arc::new(WebRtcTransportFactory),
            metadata,
        )
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_credentials(mut self, credentials: Option<Arc<dyn CredentialProvider>>) -> Self {
        self.credentials = credentials;
        self
    }

    pub(crate) fn signaling_options(&self, peer_id: &str) -> SignalingOptions {
        SignalingOptions::from_config(peer_id, &self.config, &self.timing)
    }

    pub(crate) fn peer_options(&self, remote_id: &str) -> PeerOptions {
        PeerOptions::from_config(
            remote_id,
            &self.config,
            self.timing,
            self.credentials.clone(),
        )
    }
}
