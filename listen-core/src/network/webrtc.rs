//! [`PeerTransport`] backed by the `webrtc` crate

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use super::transport::{
    IceCandidate, IceConfiguration, PeerTransport, SdpType, SessionDescription, SignalingState,
    TransportError, TransportEvent, TransportFactory, TransportState, DATA_CHANNEL_LABEL,
};

fn rtc_configuration(config: &IceConfiguration) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn transport_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
        _ => TransportState::New,
    }
}

fn description_from_rtc(desc: &RTCSessionDescription) -> SessionDescription {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => SdpType::Offer,
    };
    SessionDescription {
        sdp_type,
        sdp: desc.sdp.clone(),
    }
}

fn description_to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let result = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => return Ok(rollback()),
    };
    result.map_err(|e| TransportError::Negotiation(e.to_string()))
}

fn rollback() -> RTCSessionDescription {
    let mut desc = RTCSessionDescription::default();
    desc.sdp_type = RTCSdpType::Rollback;
    desc
}

fn negotiation_error(e: webrtc::Error) -> TransportError {
    TransportError::Negotiation(e.to_string())
}

/// Forward open/message/close of the data channel as transport events
fn wire_channel(channel: &Arc<RTCDataChannel>, events: mpsc::UnboundedSender<TransportEvent>) {
    let label = channel.label().to_string();

    let open_events = events.clone();
    let open_label = label.clone();
    channel.on_open(Box::new(move || {
        let events = open_events.clone();
        let label = open_label.clone();
        Box::pin(async move {
            debug!("Data channel '{}' open", label);
            let _ = events.send(TransportEvent::ChannelOpen);
        })
    }));

    let message_events = events.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = events.send(TransportEvent::ChannelMessage(text));
                }
                Err(_) => warn!("Dropping non-UTF-8 data channel message"),
            }
        })
    }));

    channel.on_close(Box::new(move || {
        let events = events.clone();
        let label = label.clone();
        Box::pin(async move {
            debug!("Data channel '{}' closed", label);
            let _ = events.send(TransportEvent::ChannelClosed);
        })
    }));
}

/// A WebRTC peer connection with one data channel
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    /// Next offer restarts ICE
    ice_restart: AtomicBool,
}

impl WebRtcTransport {
    fn setup_handlers(&self) {
        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(TransportEvent::IceCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_m_line_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                    }
                })
            }));

        let events = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    let _ = events.send(TransportEvent::StateChanged(transport_state(state)));
                })
            }));

        let events = self.events.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(TransportEvent::NegotiationNeeded);
            })
        }));

        // Callee side: the remote opens the channel
        let events = self.events.clone();
        let slot = self.channel.clone();
        self.pc
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let events = events.clone();
                let slot = slot.clone();
                Box::pin(async move {
                    if channel.label() != DATA_CHANNEL_LABEL {
                        debug!("Ignoring unexpected data channel '{}'", channel.label());
                        return;
                    }
                    info!("Received data channel '{}'", channel.label());
                    wire_channel(&channel, events);
                    *slot.lock() = Some(channel);
                })
            }));
    }

    fn channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.channel.lock().clone()
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.pc.signaling_state())
    }

    async fn create_data_channel(&self) -> Result<(), TransportError> {
        let channel = self
            .pc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .map_err(|e| TransportError::Create(e.to_string()))?;
        wire_channel(&channel, self.events.clone());
        *self.channel.lock() = Some(channel);
        Ok(())
    }

    async fn set_local_description(&self) -> Result<SessionDescription, TransportError> {
        let description = match self.pc.signaling_state() {
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
                self.pc.create_answer(None).await
            }
            _ => {
                let options = self
                    .ice_restart
                    .swap(false, Ordering::SeqCst)
                    .then(|| RTCOfferOptions {
                        ice_restart: true,
                        ..Default::default()
                    });
                self.pc.create_offer(options).await
            }
        }
        .map_err(negotiation_error)?;

        self.pc
            .set_local_description(description)
            .await
            .map_err(negotiation_error)?;

        let applied = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Negotiation("No local description".to_string()))?;
        Ok(description_from_rtc(&applied))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        if description.is_offer() && self.pc.signaling_state() == RTCSignalingState::HaveLocalOffer
        {
            debug!("Rolling back local offer");
            self.pc
                .set_local_description(rollback())
                .await
                .map_err(negotiation_error)?;
        }
        let description = description_to_rtc(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    async fn restart_ice(&self) -> Result<(), TransportError> {
        self.ice_restart.store(true, Ordering::SeqCst);
        self.events
            .send(TransportEvent::NegotiationNeeded)
            .map_err(|_| TransportError::Closed)
    }

    async fn set_configuration(&self, config: IceConfiguration) -> Result<(), TransportError> {
        self.pc
            .set_configuration(rtc_configuration(&config))
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }

    async fn send(&self, text: String) -> Result<(), TransportError> {
        let channel = self.channel().ok_or(TransportError::ChannelNotOpen)?;
        channel
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(channel) = self.channel() {
            let _ = channel.close().await;
        }
        self.pc
            .close()
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }
}

/// Creates [`WebRtcTransport`]s
#[derive(Debug, Clone, Default)]
pub struct WebRtcTransportFactory;

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        config: IceConfiguration,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| TransportError::Create(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| TransportError::Create(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = api
            .new_peer_connection(rtc_configuration(&config))
            .await
            .map_err(|e| TransportError::Create(e.to_string()))?;

        let transport = WebRtcTransport {
            pc: Arc::new(pc),
            channel: Arc::new(Mutex::new(None)),
            events,
            ice_restart: AtomicBool::new(false),
        };
        transport.setup_handlers();
        Ok(Box::new(transport))
    }
}
