//! Resource Cleanup Guard
//!
//! Besitzt die Ressourcen eines Anrufs (lokaler Stream, Peer-/Provider-Session)
//! und gibt sie genau einmal frei: zuerst die Tracks, dann die Session-Objekte.

use super::audio::LocalMediaStream;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CleanupError {
    #[error("Resource set already holds a local media stream")]
    StreamOccupied,

    #[error("Resource set already holds a session object")]
    SessionOccupied,
}

// ============================================================================
// SESSION OBJECT
// ============================================================================

/// Peer-Connection oder Provider-Session, die geschlossen werden muss
#[async_trait]
pub trait SessionObject: Send + Sync {
    fn describe(&self) -> String;

    /// Schließt bzw. zerstört das Objekt
    async fn close(&self);
}

// ============================================================================
// RESOURCE SET
// ============================================================================

#[derive(Default)]
struct ResourceSet {
    stream: Option<LocalMediaStream>,
    session: Option<Arc<dyn SessionObject>>,
}

impl ResourceSet {
    fn is_empty(&self) -> bool {
        self.stream.is_none() && self.session.is_none()
    }
}

// ============================================================================
// CLEANUP GUARD
// ============================================================================

/// Einziger Finalizer für die Ressourcen einer Session
pub struct ResourceCleanupGuard {
    owner: String,
    set: Mutex<ResourceSet>,
    released: AtomicBool,
    releases: AtomicUsize,
}

impl ResourceCleanupGuard {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            set: Mutex::new(ResourceSet::default()),
            released: AtomicBool::new(false),
            releases: AtomicUsize::new(0),
        }
    }

    /// Übernimmt einen lokalen Stream
    ///
    /// Nach `release_all` angekommene Streams werden sofort gestoppt.
    pub fn adopt_stream(&self, mut stream: LocalMediaStream) -> Result<(), CleanupError> {
        let mut set = self.set.lock();
        if self.is_released() {
            drop(set);
            tracing::warn!("[{}] Stream {} arrived after release, stopping", self.owner, stream.id());
            stream.stop();
            return Ok(());
        }
        if set.stream.is_some() {
            drop(set);
            stream.stop();
            return Err(CleanupError::StreamOccupied);
        }
        tracing::debug!("[{}] Holding local stream {}", self.owner, stream.id());
        set.stream = Some(stream);
        Ok(())
    }

    /// Übernimmt ein Session-Objekt
    ///
    /// Nach `release_all` angekommene Objekte werden sofort geschlossen.
    pub async fn adopt_session(&self, session: Arc<dyn SessionObject>) -> Result<(), CleanupError> {
        let rejected = {
            let mut set = self.set.lock();
            if self.is_released() {
                tracing::warn!("[{}] {} arrived after release, closing", self.owner, session.describe());
                Some(None)
            } else if set.session.is_some() {
                Some(Some(CleanupError::SessionOccupied))
            } else {
                tracing::debug!("[{}] Holding {}", self.owner, session.describe());
                set.session = Some(Arc::clone(&session));
                None
            }
        };

        match rejected {
            None => Ok(()),
            Some(err) => {
                session.close().await;
                err.map_or(Ok(()), Err)
            }
        }
    }

    /// Gibt alle Ressourcen frei (idempotent)
    pub async fn release_all(&self) {
        let (stream, session) = {
            let mut set = self.set.lock();
            if self.released.swap(true, Ordering::SeqCst) {
                return;
            }
            (set.stream.take(), set.session.take())
        };
        self.releases.fetch_add(1, Ordering::SeqCst);

        // Tracks vor den Session-Objekten, sonst sieht die Gegenseite eine
        // aktive Verbindung ohne lokalen Audiopfad
        if let Some(mut stream) = stream {
            stream.stop();
        }
        if let Some(session) = session {
            tracing::debug!("[{}] Closing {}", self.owner, session.describe());
            session.close().await;
        }

        tracing::info!("[{}] Resources released", self.owner);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.set.lock().is_empty()
    }

    /// Wie oft die Freigabe tatsächlich gelaufen ist (0 oder 1)
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn holds_stream(&self) -> bool {
        self.set.lock().stream.is_some()
    }

    pub fn holds_session(&self) -> bool {
        self.set.lock().session.is_some()
    }
}

impl std::fmt::Debug for ResourceCleanupGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = self.set.lock();
        f.debug_struct("ResourceCleanupGuard")
            .field("owner", &self.owner)
            .field("stream", &set.stream)
            .field("session", &set.session.as_ref().map(|s| s.describe()))
            .field("released", &self.is_released())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::testing::{fake_stream, FakeSession, Journal};

    #[tokio::test]
    async fn test_release_order_tracks_before_session() {
        let journal = Journal::default();
        let guard = ResourceCleanupGuard::new("call-1");

        guard.adopt_stream(fake_stream(&journal)).unwrap();
        guard
            .adopt_session(FakeSession::new("peer", &journal))
            .await
            .unwrap();

        guard.release_all().await;

        assert_eq!(journal.entries(), vec!["track stopped", "peer closed"]);
        assert!(guard.is_empty());
        assert_eq!(guard.release_count(), 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let journal = Journal::default();
        let guard = ResourceCleanupGuard::new("call-2");
        guard.adopt_stream(fake_stream(&journal)).unwrap();

        guard.release_all().await;
        guard.release_all().await;

        assert_eq!(journal.entries(), vec!["track stopped"]);
        assert_eq!(guard.release_count(), 1);
    }

    #[tokio::test]
    async fn test_release_on_empty_set_is_noop() {
        let guard = ResourceCleanupGuard::new("call-3");
        guard.release_all().await;
        guard.release_all().await;
        assert!(guard.is_empty());
        assert!(guard.is_released());
    }

    #[tokio::test]
    async fn test_late_resources_released_immediately() {
        let journal = Journal::default();
        let guard = ResourceCleanupGuard::new("call-4");
        guard.release_all().await;

        guard.adopt_stream(fake_stream(&journal)).unwrap();
        guard
            .adopt_session(FakeSession::new("device", &journal))
            .await
            .unwrap();

        assert_eq!(journal.entries(), vec!["track stopped", "device closed"]);
        assert!(guard.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stream_racing_release_is_never_kept() {
        for _ in 0..200 {
            let journal = Journal::default();
            let guard = Arc::new(ResourceCleanupGuard::new("race"));

            let adopter = {
                let guard = Arc::clone(&guard);
                let journal = journal.clone();
                tokio::spawn(async move { guard.adopt_stream(fake_stream(&journal)) })
            };
            guard.release_all().await;
            adopter.await.unwrap().unwrap();

            assert!(guard.is_empty());
            assert_eq!(journal.entries(), vec!["track stopped"]);
        }
    }

    #[tokio::test]
    async fn test_second_stream_rejected() {
        let journal = Journal::default();
        let guard = ResourceCleanupGuard::new("call-5");
        guard.adopt_stream(fake_stream(&journal)).unwrap();

        let err = guard.adopt_stream(fake_stream(&journal)).unwrap_err();
        assert_eq!(err, CleanupError::StreamOccupied);
        // Der abgelehnte Stream wurde gestoppt, der erste bleibt
        assert_eq!(journal.entries(), vec!["track stopped"]);
        assert!(guard.holds_stream());
    }
}
