use super::ice::{from_rtc_description, rtc_ice_servers, to_rtc_description};
use super::media::LocalMedia;
use super::negotiator::{PeerTransport, TransportProvider};
use super::types::{ConnectionState, IceServerConfig, TransportEvent};
use crate::error::{Error, Result};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::signaling::protocol::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

/// Builds real `RTCPeerConnection`s
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcTransportProvider;

#[async_trait]
impl TransportProvider for RtcTransportProvider {
    async fn connect(
        &self,
        ice_servers: &[IceServerConfig],
        media: Arc<dyn LocalMedia>,
        events: UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>> {
        let pc = new_peer(ice_servers, events).await?;

        for track in media.tracks() {
            let sender = pc.add_track(track).await?;
            // drain RTCP so interceptors keep working
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }

        Ok(Box::new(RtcTransport { pc }))
    }
}

/// Creates a peer connection wired to `events`
async fn new_peer(
    ice_servers: &[IceServerConfig],
    events: UnboundedSender<TransportEvent>,
) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(api.new_peer_connection(rtc_config(ice_servers)).await?);

    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => match c.to_json() {
                Ok(init) => {
                    let candidate = IceCandidate::from(init);
                    dump_candidate("LOCAL", &candidate);
                    let _ = tx.send(TransportEvent::LocalCandidate(candidate));
                }
                Err(e) => warn!("Failed to serialize local candidate: {e}"),
            },
            None => debug!("ICE candidate gathering completed (null candidate received)"),
        }
        Box::pin(async {})
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!("ICE gathering state changed to: {:?}", state);
        Box::pin(async {})
    }));

    // weak so the callback does not keep the connection alive
    let pc_stats = Arc::downgrade(&pc);
    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        info!("Peer connection state changed to: {:?}", st);
        let state = match st {
            RTCPeerConnectionState::New => Some(ConnectionState::New),
            RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
            RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
            RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
            RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
            RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
            RTCPeerConnectionState::Unspecified => None,
        };

        if let Some(state) = state {
            if matches!(state, ConnectionState::Disconnected | ConnectionState::Failed) {
                if let Some(pc) = pc_stats.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    });
                }
            }
            let _ = tx.send(TransportEvent::StateChanged(state));
        }
        Box::pin(async {})
    }));

    let tx = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
            let event = TransportEvent::RemoteTrack {
                id: track.id(),
                kind: track.kind().to_string(),
            };
            info!("Remote track arrived: {:?}", event);
            let _ = tx.send(event);
            Box::pin(async {})
        },
    ));

    Ok(pc)
}

fn rtc_config(ice_servers: &[IceServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: rtc_ice_servers(ice_servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
}

impl RtcTransport {
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    async fn local_description(&self) -> Result<SessionDescription> {
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or(Error::Negotiation("local description missing".into()))?;
        from_rtc_description(&desc)
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        self.local_description().await
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.local_description().await
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| Error::Negotiation(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        Ok(self.pc.add_ice_candidate(candidate.into()).await?)
    }

    async fn close(&self) -> Result<()> {
        Ok(self.pc.close().await?)
    }
}
