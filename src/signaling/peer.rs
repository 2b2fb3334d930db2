//! Peer-Verhandlung über WebRTC
//!
//! Das Backend liefert ein SDP Offer; wir erzeugen die lokale Answer und
//! melden den Anruf erst als angenommen, wenn die Peer Connection
//! tatsächlich `Connected` erreicht.

use super::backend::{BackendEvent, EstablishmentError, Established, EventSink, SessionHandle};
use super::messages::IceServer;
use crate::call_engine::{
    AudioConstraints, BackendKind, MediaPlatform, ResourceCleanupGuard, SessionObject,
    TargetNumber, CHANNELS, SAMPLE_RATE,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

fn negotiation<E: std::fmt::Display>(e: E) -> EstablishmentError {
    EstablishmentError::Negotiation(e.to_string())
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        username: String::new(),
        credential: String::new(),
    }]
}

impl From<IceServer> for RTCIceServer {
    fn from(server: IceServer) -> Self {
        RTCIceServer {
            urls: server.urls,
            username: server.username,
            credential: server.credential,
            ..Default::default()
        }
    }
}

/// Media Engine mit Default-Codecs und Interceptors (RTCP, NACK etc.)
pub(crate) fn build_api() -> Result<API, webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

// ============================================================================
// PEER SESSION
// ============================================================================

/// Peer Connection als Ressource des Cleanup Guards
struct PeerSession(Arc<RTCPeerConnection>);

#[async_trait]
impl SessionObject for PeerSession {
    fn describe(&self) -> String {
        "peer connection".to_string()
    }

    async fn close(&self) {
        if let Err(e) = self.0.close().await {
            tracing::warn!("Closing peer connection failed: {}", e);
        }
    }
}

/// Eingaben der Peer Connection, die den Fortschritt bestimmen
#[derive(Debug)]
enum PeerSignal {
    State(RTCPeerConnectionState),
    RemoteTrack,
}

/// Verbindungsfortschritt, gemeinsam für State- und Track-Handler
#[derive(Debug, Default)]
struct PeerProgress {
    connected: bool,
    remote_track: bool,
    remote_surfaced: bool,
    ended: bool,
}

impl PeerProgress {
    /// Übernimmt ein Signal und liefert die daraus folgenden Events
    ///
    /// Remote-Audio wird erst nach `Connected` gemeldet, jedes Event höchstens einmal.
    fn advance(&mut self, signal: PeerSignal) -> Vec<BackendEvent> {
        let mut events = Vec::new();
        match signal {
            PeerSignal::State(RTCPeerConnectionState::Connected)
                if !self.connected && !self.ended =>
            {
                self.connected = true;
                events.push(BackendEvent::Accepted);
            }
            PeerSignal::State(
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed,
            ) if !self.ended => {
                self.ended = true;
                events.push(BackendEvent::Disconnected);
            }
            PeerSignal::State(RTCPeerConnectionState::Failed) if !self.ended => {
                self.ended = true;
                events.push(BackendEvent::Errored("peer connection failed".to_string()));
            }
            PeerSignal::RemoteTrack => self.remote_track = true,
            PeerSignal::State(_) => {}
        }

        if self.connected && self.remote_track && !self.remote_surfaced && !self.ended {
            self.remote_surfaced = true;
            events.push(BackendEvent::RemoteMediaAvailable);
        }
        events
    }
}

// ============================================================================
// BACKEND
// ============================================================================

pub struct PeerNegotiationBackend {
    media: Arc<dyn MediaPlatform>,
    remote_offer: String,
    ice_servers: Vec<RTCIceServer>,
}

impl PeerNegotiationBackend {
    pub fn new(media: Arc<dyn MediaPlatform>, remote_offer: String, ice_servers: Vec<IceServer>) -> Self {
        Self {
            media,
            remote_offer,
            ice_servers: ice_servers.into_iter().map(RTCIceServer::from).collect(),
        }
    }

    pub async fn establish(
        &self,
        target: &TargetNumber,
        guard: &ResourceCleanupGuard,
    ) -> Result<Established, EstablishmentError> {
        // Lokales Audio zuerst, ohne Mikrofon keine Verhandlung
        let stream = self.media.acquire_audio(AudioConstraints::default()).await?;
        let stream_id = stream.id().to_string();
        guard.adopt_stream(stream)?;

        let api = build_api().map_err(negotiation)?;
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(negotiation)?);
        guard.adopt_session(Arc::new(PeerSession(Arc::clone(&pc)))).await?;

        let (sink, events) = EventSink::channel();
        setup_peer_connection_handlers(&pc, sink.clone());

        // Audio Track hinzufügen
        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: SAMPLE_RATE,
                channels: CHANNELS,
                ..Default::default()
            },
            "audio".to_string(),
            stream_id,
        ));
        pc.add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(negotiation)?;

        // Remote Offer → lokale Answer
        let offer = RTCSessionDescription::offer(self.remote_offer.clone()).map_err(negotiation)?;
        pc.set_remote_description(offer).await.map_err(negotiation)?;

        let answer = pc.create_answer(None).await.map_err(negotiation)?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(negotiation)?;

        // Kein Endpoint für die Answer: sie bleibt am Handle
        tracing::info!("Peer negotiation for {} started", target);
        tracing::debug!("Local answer:\n{}", answer.sdp);

        Ok(Established {
            handle: SessionHandle::new(BackendKind::PeerNegotiation, &sink)
                .with_local_description(answer.sdp),
            events,
        })
    }
}

/// Registriert Event Handler für die Peer Connection
fn setup_peer_connection_handlers(pc: &RTCPeerConnection, sink: EventSink) {
    let progress = Arc::new(Mutex::new(PeerProgress::default()));

    // Connection State Handler
    let state_progress = Arc::clone(&progress);
    let state_sink = sink.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);

        let events = state_progress.lock().advance(PeerSignal::State(s));
        for event in events {
            state_sink.emit(event);
        }

        Box::pin(async {})
    }));

    // Track Handler
    pc.on_track(Box::new(move |track, _, _| {
        tracing::info!("Received track: {:?}", track.codec().capability.mime_type);

        let events = progress.lock().advance(PeerSignal::RemoteTrack);
        for event in events {
            sink.emit(event);
        }

        Box::pin(async {})
    }));
}

// ============================================================================
// TESTS
// ============================================================================
