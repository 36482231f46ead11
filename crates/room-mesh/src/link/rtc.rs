//! [`PeerLink`] over a webrtc-rs peer connection.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use super::{
    DataLink, LinkError, LinkEvent, LinkEvents, LinkFactory, LinkState, NegotiationPhase, PeerLink,
};
use crate::peer::PeerId;
use crate::signal::{IceCandidate, SdpKind, SessionDescription};

const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";

/// ICE and channel settings for RTC links.
#[derive(Clone, Debug)]
pub struct RtcConfig {
    pub ice_servers: Vec<RTCIceServer>,
    /// Retransmit cap for unreliable channels. `None` keeps the channel reliable.
    pub max_retransmits: Option<u16>,
    pub ice_disconnected_timeout: Duration,
    pub ice_failed_timeout: Duration,
    pub ice_keepalive_interval: Duration,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: vec![DEFAULT_STUN.to_string()],
                ..Default::default()
            }],
            max_retransmits: None,
            ice_disconnected_timeout: Duration::from_secs(5),
            ice_failed_timeout: Duration::from_secs(25),
            ice_keepalive_interval: Duration::from_secs(2),
        }
    }
}

impl RtcConfig {
    /// Default configuration, without STUN when `MESH_LOCALHOST_ONLY` is set.
    pub fn from_env() -> Self {
        if std::env::var("MESH_LOCALHOST_ONLY").is_ok() {
            Self::localhost()
        } else {
            Self::default()
        }
    }

    /// Host candidates only.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Default::default()
        }
    }

    pub fn with_ice_servers(mut self, urls: impl IntoIterator<Item = String>) -> Self {
        self.ice_servers = urls
            .into_iter()
            .map(|url| RTCIceServer {
                urls: vec![url],
                ..Default::default()
            })
            .collect();
        self
    }
}

fn to_setup_error(err: webrtc::Error) -> LinkError {
    LinkError::Setup(err.to_string())
}

fn to_negotiation_error(err: webrtc::Error) -> LinkError {
    LinkError::Negotiation(err.to_string())
}

pub struct RtcLinkFactory {
    api: API,
    config: RtcConfig,
}

impl RtcLinkFactory {
    pub fn new(config: RtcConfig) -> Self {
        let mut setting_engine = SettingEngine::default();
        setting_engine.set_ice_timeouts(
            Some(config.ice_disconnected_timeout),
            Some(config.ice_failed_timeout),
            Some(config.ice_keepalive_interval),
        );
        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .build();
        Self { api, config }
    }
}

#[async_trait]
impl LinkFactory for RtcLinkFactory {
    async fn connect(
        &self,
        remote: &PeerId,
        events: LinkEvents,
    ) -> Result<Arc<dyn PeerLink>, LinkError> {
        let configuration = RTCConfiguration {
            ice_servers: self.config.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(configuration)
                .await
                .map_err(to_setup_error)?,
        );
        tracing::debug!(
            target: "mesh::link",
            peer = %remote,
            generation = events.generation(),
            "peer connection created"
        );

        let candidate_events = events.clone();
        let candidate_pc = Arc::downgrade(&pc);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            let pc = candidate_pc.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let username_fragment = match init.username_fragment {
                            Some(ufrag) => Some(ufrag),
                            None => local_ufrag(&pc).await,
                        };
                        events.emit(LinkEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment,
                        }));
                    }
                    Err(err) => tracing::warn!(
                        target: "mesh::link",
                        peer = %events.peer(),
                        error = %err,
                        "failed to serialize local candidate"
                    ),
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                tracing::trace!(
                    target: "mesh::link",
                    peer = %events.peer(),
                    state = ?state,
                    "peer connection state changed"
                );
                if let Some(state) = map_connection_state(state) {
                    events.emit(LinkEvent::StateChanged(state));
                }
            })
        }));

        let channel_events = events.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let events = channel_events.clone();
            Box::pin(async move {
                tracing::debug!(
                    target: "mesh::link",
                    peer = %events.peer(),
                    label = channel.label(),
                    "remote data channel announced"
                );
                // The driver must hold the channel before any open event arrives.
                events.emit(LinkEvent::DataChannel(Arc::new(RtcChannel {
                    inner: channel.clone(),
                })));
                wire_channel(&channel, &events);
            })
        }));

        Ok(Arc::new(RtcLink {
            pc,
            events,
            max_retransmits: self.config.max_retransmits,
        }))
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::New => Some(LinkState::New),
        RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// Gathered candidates carry no fragment; take it from the local description.
async fn local_ufrag(pc: &Weak<RTCPeerConnection>) -> Option<String> {
    let pc = pc.upgrade()?;
    let description = SessionDescription::offer(pc.local_description().await?.sdp);
    description.ice_ufrag().map(str::to_owned)
}

fn wire_channel(channel: &Arc<RTCDataChannel>, events: &LinkEvents) {
    let open_events = events.clone();
    channel.on_open(Box::new(move || {
        Box::pin(async move {
            open_events.emit(LinkEvent::ChannelOpen);
        })
    }));

    let close_events = events.clone();
    channel.on_close(Box::new(move || {
        let events = close_events.clone();
        Box::pin(async move {
            events.emit(LinkEvent::ChannelClosed);
        })
    }));

    let message_events = events.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            events.emit(LinkEvent::ChannelMessage(msg.data));
        })
    }));
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, LinkError> {
    let converted = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    converted.map_err(to_negotiation_error)
}

fn from_rtc_description(
    description: RTCSessionDescription,
) -> Result<SessionDescription, LinkError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(LinkError::Negotiation(format!(
            "unexpected local description type {other}"
        ))),
    }
}

pub struct RtcLink {
    pc: Arc<RTCPeerConnection>,
    events: LinkEvents,
    max_retransmits: Option<u16>,
}

#[async_trait]
impl PeerLink for RtcLink {
    fn state(&self) -> LinkState {
        map_connection_state(self.pc.connection_state()).unwrap_or(LinkState::New)
    }

    fn phase(&self) -> NegotiationPhase {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                NegotiationPhase::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                NegotiationPhase::HaveRemoteOffer
            }
            RTCSignalingState::Closed => NegotiationPhase::Closed,
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => NegotiationPhase::Stable,
        }
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<Arc<dyn DataLink>, LinkError> {
        let init = RTCDataChannelInit {
            ordered: Some(ordered),
            max_retransmits: self.max_retransmits,
            ..Default::default()
        };
        let channel = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_setup_error)?;
        wire_channel(&channel, &self.events);
        Ok(Arc::new(RtcChannel { inner: channel }))
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, LinkError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .map_err(to_negotiation_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(to_negotiation_error)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_negotiation_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(to_negotiation_error)?;
        from_rtc_description(answer)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LinkError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_negotiation_error)
    }

    async fn rollback(&self) -> Result<(), LinkError> {
        let phase = self.phase();
        if phase == NegotiationPhase::Stable || phase == NegotiationPhase::Closed {
            return Err(LinkError::InvalidPhase(phase));
        }
        // The parsed SDP field is private, so a rollback description can only be
        // built through its serde form.
        let rollback: RTCSessionDescription =
            serde_json::from_value(serde_json::json!({ "type": "rollback", "sdp": "" }))
                .map_err(|err| LinkError::Negotiation(err.to_string()))?;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(to_negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_negotiation_error)
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::debug!(
                target: "mesh::link",
                peer = %self.events.peer(),
                error = %err,
                "peer connection close reported an error"
            );
        }
    }
}

pub struct RtcChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataLink for RtcChannel {
    fn label(&self) -> &str {
        self.inner.label()
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, data: Bytes) -> Result<(), LinkError> {
        if !self.is_open() {
            return Err(LinkError::ChannelNotOpen);
        }
        self.inner
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|err| LinkError::Negotiation(err.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.inner.close().await {
            tracing::debug!(target: "mesh::link", error = %err, "data channel close failed");
        }
    }
}
