//! Signaling Module - Call-Backend und Signaling-Backends
//!
//! Dieses Modul verwaltet die Kommunikation nach außen:
//! - HTTP-Aufrufe `initiate`/`terminate` beim Call-Backend
//! - Auswahl des Signaling-Backends anhand der Antwort
//! - Peer-Verhandlung (WebRTC) und Managed Voice Provider (WebSocket)

mod api;
mod backend;
mod messages;
mod peer;
mod provider;

pub use api::{ApiError, CallApi, Credential, HttpCallApi};
pub use backend::{
    BackendContext, BackendEvent, Established, EstablishmentError, EventSink, RawMediaBackend,
    SessionHandle, SignalingBackend,
};
pub use messages::*;
pub use peer::{default_ice_servers, PeerNegotiationBackend};
pub use provider::{
    DeviceOptions, ManagedProviderBackend, ProviderConnector, ProviderDevice, ProviderError,
    ProviderEvent, WsProviderConnector, WsProviderDevice,
};
