//! webrtc-rs peer backend.
//!
//! One `RTCPeerConnection` with a single ordered, reliable data channel.
//! The offerer creates the channel; the answerer adopts the one announced by
//! the remote side. Descriptions are returned only after ICE gathering has
//! completed (or timed out), so no trickle candidates need to be exchanged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tower_core::Role;
use tower_types::{SdpType, SessionDescription};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use super::{BackendEvent, BackendEvents, ChannelError, PeerBackend, PeerConnectionState, PeerFactory};

const DATA_CHANNEL_LABEL: &str = "data";

fn setup_err(e: impl std::fmt::Display) -> ChannelError {
    ChannelError::Setup(e.to_string())
}

fn negotiation_err(e: impl std::fmt::Display) -> ChannelError {
    ChannelError::NegotiationFailed(e.to_string())
}

/// Creates webrtc-rs peer connections.
pub struct WebRtcFactory {
    api: API,
    ice_servers: Vec<String>,
    ice_timeout: Duration,
    low_water_mark: usize,
}

impl WebRtcFactory {
    /// Build the webrtc API with default codecs and interceptors.
    pub fn new(
        ice_servers: Vec<String>,
        ice_timeout: Duration,
        low_water_mark: usize,
    ) -> Result<Self, ChannelError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(setup_err)?;
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(setup_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers,
            ice_timeout,
            low_water_mark,
        })
    }
}

#[async_trait]
impl PeerFactory for WebRtcFactory {
    async fn create(
        &self,
        role: Role,
        events: BackendEvents,
    ) -> Result<Arc<dyn PeerBackend>, ChannelError> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(setup_err)?);

        {
            let events = events.clone();
            pc.on_peer_connection_state_change(Box::new(move |s| {
                let events = events.clone();
                Box::pin(async move {
                    let state = match s {
                        RTCPeerConnectionState::New => PeerConnectionState::New,
                        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
                        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
                        _ => return,
                    };
                    let _ = events.send(BackendEvent::StateChanged(state));
                })
            }));
        }

        let backend = Arc::new(WebRtcPeer {
            pc: pc.clone(),
            channel: Arc::new(Mutex::new(None)),
            ice_timeout: self.ice_timeout,
        });

        match role {
            Role::Offerer => {
                let dc = pc
                    .create_data_channel(DATA_CHANNEL_LABEL, None)
                    .await
                    .map_err(setup_err)?;
                attach_channel(&dc, &events, self.low_water_mark).await;
                *backend.channel.lock().await = Some(dc);
            }
            Role::Answerer => {
                let slot = backend.channel.clone();
                let low_water_mark = self.low_water_mark;
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let slot = slot.clone();
                    let events = events.clone();
                    Box::pin(async move {
                        if dc.label() != DATA_CHANNEL_LABEL {
                            debug!("ignoring data channel {}", dc.label());
                            return;
                        }
                        attach_channel(&dc, &events, low_water_mark).await;
                        *slot.lock().await = Some(dc);
                    })
                }));
            }
        }

        Ok(backend)
    }
}

async fn attach_channel(dc: &Arc<RTCDataChannel>, events: &BackendEvents, low_water_mark: usize) {
    {
        let events = events.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                let _ = events.send(BackendEvent::ChannelOpen);
            })
        }));
    }
    {
        let events = events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(BackendEvent::Message(msg.data.to_vec()));
            })
        }));
    }
    {
        let events = events.clone();
        dc.on_close(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(BackendEvent::StateChanged(PeerConnectionState::Closed));
            })
        }));
    }

    dc.set_buffered_amount_low_threshold(low_water_mark).await;
    let events = events.clone();
    dc.on_buffered_amount_low(Box::new(move || {
        let events = events.clone();
        Box::pin(async move {
            let _ = events.send(BackendEvent::BufferedAmountLow);
        })
    }))
    .await;
}

/// A webrtc-rs peer connection.
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    ice_timeout: Duration,
}

impl WebRtcPeer {
    async fn gathered_description(&self) -> Result<SessionDescription, ChannelError> {
        if self.pc.ice_gathering_state() != RTCIceGatheringState::Complete {
            let (tx, rx) = oneshot::channel::<()>();
            let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
            self.pc.on_ice_gathering_state_change(Box::new(move |state| {
                let tx = tx.clone();
                Box::pin(async move {
                    if state == RTCIceGathererState::Complete {
                        if let Ok(mut guard) = tx.lock() {
                            if let Some(tx) = guard.take() {
                                let _ = tx.send(());
                            }
                        }
                    }
                })
            }));

            if self.pc.ice_gathering_state() != RTCIceGatheringState::Complete
                && timeout(self.ice_timeout, rx).await.is_err()
            {
                warn!("ICE gathering timed out, using candidates gathered so far");
            }
        }

        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| negotiation_err("no local description"))?;
        Ok(from_rtc(&desc))
    }
}

fn from_rtc(desc: &RTCSessionDescription) -> SessionDescription {
    let kind = match desc.sdp_type {
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => SdpType::Offer,
    };
    SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    }
}

fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription, ChannelError> {
    match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp.clone()).map_err(negotiation_err),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp.clone()).map_err(negotiation_err),
        SdpType::Pranswer => {
            RTCSessionDescription::pranswer(desc.sdp.clone()).map_err(negotiation_err)
        }
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            Ok(rollback)
        }
    }
}

#[async_trait]
impl PeerBackend for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, ChannelError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation_err)?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(negotiation_err)?;
        self.gathered_description().await
    }

    async fn set_remote(&self, desc: &SessionDescription) -> Result<(), ChannelError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(negotiation_err)
    }

    async fn create_answer(&self) -> Result<SessionDescription, ChannelError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation_err)?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(negotiation_err)?;
        self.gathered_description().await
    }

    async fn rollback(&self) -> Result<(), ChannelError> {
        let rollback = to_rtc(&SessionDescription {
            kind: SdpType::Rollback,
            sdp: String::new(),
        })?;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(negotiation_err)
    }

    async fn is_stable(&self) -> bool {
        self.pc.signaling_state() == RTCSignalingState::Stable
    }

    async fn send(&self, data: &[u8]) -> Result<(), ChannelError> {
        let dc = self
            .channel
            .lock()
            .await
            .clone()
            .ok_or(ChannelError::ChannelNotOpen)?;
        dc.send(&Bytes::copy_from_slice(data))
            .await
            .map(|_| ())
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        let dc = self.channel.lock().await.clone();
        match dc {
            Some(dc) => dc.buffered_amount().await,
            None => 0,
        }
    }

    async fn close(&self) {
        if let Some(dc) = self.channel.lock().await.take() {
            if let Err(e) = dc.close().await {
                debug!("data channel close failed: {}", e);
            }
        }
        if let Err(e) = self.pc.close().await {
            debug!("peer connection close failed: {}", e);
        }
    }
}
