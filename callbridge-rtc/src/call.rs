//! Call and group containers
//!
//! A call is the set of sessions that exchange media; a group is the
//! tenant-level set of calls. Both are passive: they own no tasks and are
//! only mutated through the server's message pump and session lifecycle.

use crate::session::{Session, TrackAction};
use crate::types::{CallId, GroupId, SessionId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

pub(crate) struct Call {
    pub(crate) id: CallId,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    screen_session: RwLock<Option<Arc<Session>>>,
}

impl Call {
    pub(crate) fn new(id: CallId) -> Arc<Self> {
        Arc::new(Self {
            id,
            sessions: RwLock::new(HashMap::new()),
            screen_session: RwLock::new(None),
        })
    }

    /// Returns false when a session with the same id is already present.
    pub(crate) fn add_session(&self, session: Arc<Session>) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(session.session_id()) {
            return false;
        }
        sessions.insert(session.session_id().clone(), session);
        true
    }

    pub(crate) fn remove_session(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.write().remove(session_id)
    }

    pub(crate) fn get_session(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(session_id).cloned()
    }

    pub(crate) fn sessions_snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub(crate) fn screen_session(&self) -> Option<Arc<Session>> {
        self.screen_session.read().clone()
    }

    /// Elects the screen presenter. First writer wins: the attempt is
    /// rejected while any session holds the slot.
    pub(crate) fn set_screen_session(&self, session: &Arc<Session>) -> bool {
        let mut slot = self.screen_session.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(Arc::clone(session));
        true
    }

    /// Tears down the screen share if `session` is the presenter: clears
    /// the slot, asks every receiver to drop its screen tracks and resets
    /// the presenter's screen state.
    pub(crate) fn clear_screen_state(&self, session: &Arc<Session>) {
        {
            let mut slot = self.screen_session.write();
            match slot.as_ref() {
                Some(current) if current.session_id() == session.session_id() => {
                    *slot = None;
                }
                _ => return,
            }
        }

        debug!(call_id = %self.id, session_id = %session.session_id(), "clearing screen state");

        let screen_audio = session.out_screen_audio_track();

        for receiver in self.sessions_snapshot() {
            if receiver.session_id() == session.session_id() {
                continue;
            }
            if receiver.enqueue_track_action(TrackAction::RemoveScreen).is_err() {
                error!(
                    session_id = %receiver.session_id(),
                    "failed to enqueue track action: channel is full"
                );
            }
            if let Some(audio) = &screen_audio {
                if receiver
                    .enqueue_track_action(TrackAction::Remove {
                        track: Arc::clone(audio) as Arc<dyn TrackLocal + Send + Sync>,
                    })
                    .is_err()
                {
                    error!(
                        session_id = %receiver.session_id(),
                        "failed to enqueue track action: channel is full"
                    );
                }
            }
        }

        session.clear_screen_local_state();
    }

    /// Hands a newly published screen layer to every subscriber whose
    /// estimated level it matches. Subscribers whose preferred level is not
    /// published fall back to the default layer.
    pub(crate) fn fan_out_screen_layer(&self, presenter: &Arc<Session>, rid: &str) {
        for subscriber in self.sessions_snapshot() {
            if subscriber.session_id() == presenter.session_id() {
                continue;
            }
            if subscriber.has_screen_sender() {
                continue;
            }

            let expected = subscriber.expected_simulcast_level();
            let matches = rid == expected
                || (rid == crate::simulcast::SIMULCAST_LEVEL_DEFAULT
                    && presenter.out_screen_track(expected).is_none());
            if !matches {
                continue;
            }

            let Some(track) = presenter.out_screen_track(rid) else { continue };
            if subscriber
                .enqueue_track_action(TrackAction::Add {
                    track: track as Arc<dyn TrackLocal + Send + Sync>,
                    rid: Some(rid.to_string()),
                })
                .is_err()
            {
                error!(
                    session_id = %subscriber.session_id(),
                    "failed to enqueue track action: channel is full"
                );
            }
        }
    }

    /// Attaches the presenter's screen audio to every subscriber.
    pub(crate) fn fan_out_screen_audio(
        &self,
        presenter: &Arc<Session>,
        track: &Arc<TrackLocalStaticRTP>,
    ) {
        for subscriber in self.sessions_snapshot() {
            if subscriber.session_id() == presenter.session_id() {
                continue;
            }
            if subscriber
                .enqueue_track_action(TrackAction::Add {
                    track: Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>,
                    rid: None,
                })
                .is_err()
            {
                error!(
                    session_id = %subscriber.session_id(),
                    "failed to enqueue track action: channel is full"
                );
            }
        }
    }

    /// Subscribes a joining session to the media already flowing in the
    /// call: every published voice track, and the active screen share.
    pub(crate) fn wire_new_session(&self, session: &Arc<Session>) {
        for other in self.sessions_snapshot() {
            if other.session_id() == session.session_id() {
                continue;
            }
            if !other.voice_published() {
                continue;
            }
            if session
                .enqueue_track_action(TrackAction::Add {
                    track: other.out_voice_track() as Arc<dyn TrackLocal + Send + Sync>,
                    rid: None,
                })
                .is_err()
            {
                error!(
                    session_id = %session.session_id(),
                    "failed to enqueue track action: channel is full"
                );
            }
        }

        let Some(presenter) = self.screen_session() else { return };
        if presenter.session_id() == session.session_id() {
            return;
        }

        let expected = session.expected_simulcast_level();
        if let Some((rid, track)) = presenter.screen_track_for_level(expected) {
            if session
                .enqueue_track_action(TrackAction::Add {
                    track: track as Arc<dyn TrackLocal + Send + Sync>,
                    rid: Some(rid),
                })
                .is_err()
            {
                error!(
                    session_id = %session.session_id(),
                    "failed to enqueue track action: channel is full"
                );
            }
        }

        if let Some(audio) = presenter.out_screen_audio_track() {
            if session
                .enqueue_track_action(TrackAction::Add {
                    track: audio as Arc<dyn TrackLocal + Send + Sync>,
                    rid: None,
                })
                .is_err()
            {
                error!(
                    session_id = %session.session_id(),
                    "failed to enqueue track action: channel is full"
                );
            }
        }
    }
}

pub(crate) struct Group {
    pub(crate) id: GroupId,
    calls: RwLock<HashMap<CallId, Arc<Call>>>,
}

impl Group {
    pub(crate) fn new(id: GroupId) -> Arc<Self> {
        Arc::new(Self {
            id,
            calls: RwLock::new(HashMap::new()),
        })
    }

    pub(crate) fn get_call(&self, call_id: &CallId) -> Option<Arc<Call>> {
        self.calls.read().get(call_id).cloned()
    }

    pub(crate) fn get_or_create_call(&self, call_id: &CallId) -> Arc<Call> {
        if let Some(call) = self.get_call(call_id) {
            return call;
        }
        let mut calls = self.calls.write();
        calls
            .entry(call_id.clone())
            .or_insert_with(|| Call::new(call_id.clone()))
            .clone()
    }

    pub(crate) fn remove_call(&self, call_id: &CallId) {
        self.calls.write().remove(call_id);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.calls.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_util::new_test_session;

    #[tokio::test]
    async fn test_session_membership() {
        let call = Call::new("c1".into());
        let a = new_test_session("a", Arc::downgrade(&call)).await.session;
        let b = new_test_session("b", Arc::downgrade(&call)).await.session;

        assert!(call.add_session(Arc::clone(&a)));
        assert!(call.add_session(Arc::clone(&b)));
        // Duplicate session ids are rejected.
        assert!(!call.add_session(Arc::clone(&a)));

        assert!(call.get_session(a.session_id()).is_some());
        assert_eq!(call.sessions_snapshot().len(), 2);

        call.remove_session(a.session_id());
        call.remove_session(b.session_id());
        assert!(call.is_empty());
    }

    #[tokio::test]
    async fn test_screen_election_first_writer_wins() {
        let call = Call::new("c1".into());
        let a = new_test_session("a", Arc::downgrade(&call)).await.session;
        let b = new_test_session("b", Arc::downgrade(&call)).await.session;
        call.add_session(Arc::clone(&a));
        call.add_session(Arc::clone(&b));

        assert!(call.set_screen_session(&a));
        // The slot is taken; the contender is rejected and nothing changes.
        assert!(!call.set_screen_session(&b));
        assert_eq!(
            call.screen_session().unwrap().session_id(),
            a.session_id()
        );
    }

    #[tokio::test]
    async fn test_clear_screen_state_only_for_presenter() {
        let call = Call::new("c1".into());
        let a = new_test_session("a", Arc::downgrade(&call)).await.session;
        let b = new_test_session("b", Arc::downgrade(&call)).await.session;
        call.add_session(Arc::clone(&a));
        call.add_session(Arc::clone(&b));

        assert!(call.set_screen_session(&a));
        a.set_screen_stream_id("streamX".to_string());

        // A non-presenter cannot clear the share.
        call.clear_screen_state(&b);
        assert!(call.screen_session().is_some());

        call.clear_screen_state(&a);
        assert!(call.screen_session().is_none());
        assert_eq!(a.screen_stream_id(), "");

        // Once cleared a new presenter can be elected.
        assert!(call.set_screen_session(&b));
    }

    #[tokio::test]
    async fn test_group_call_lifecycle() {
        let group = Group::new("g1".into());
        assert!(group.is_empty());

        let call = group.get_or_create_call(&"c1".into());
        assert!(!group.is_empty());

        let again = group.get_or_create_call(&"c1".into());
        assert!(Arc::ptr_eq(&call, &again));

        group.remove_call(&"c1".into());
        assert!(group.is_empty());
    }
}
