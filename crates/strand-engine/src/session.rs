use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, instrument};

use strand_core::errors::SessionError;
use strand_core::event::Event;
use strand_core::ids::SessionId;
use strand_core::session::{Session, SessionService, TEMP_STATE_PREFIX};

type SessionKey = (String, String, SessionId);

/// Process-local session store.
#[derive(Default)]
pub struct InMemorySessionService {
    sessions: RwLock<HashMap<SessionKey, Session>>,
}

impl InMemorySessionService {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(app_name: &str, user_id: &str, session_id: &SessionId) -> SessionKey {
        (app_name.to_string(), user_id.to_string(), session_id.clone())
    }
}

#[async_trait]
impl SessionService for InMemorySessionService {
    #[instrument(skip(self), fields(app = %app_name, user = %user_id))]
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: Option<SessionId>,
    ) -> Result<Session, SessionError> {
        let mut session = Session::new(app_name, user_id);
        if let Some(id) = session_id {
            session.id = id;
        }
        let key = Self::key(app_name, user_id, &session.id);

        let mut sessions = self.sessions.write();
        if sessions.contains_key(&key) {
            return Err(SessionError::AlreadyExists(session.id.to_string()));
        }
        sessions.insert(key, session.clone());
        debug!(session_id = %session.id, "session created");
        Ok(session)
    }

    async fn get_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &SessionId,
    ) -> Result<Session, SessionError> {
        self.sessions
            .read()
            .get(&Self::key(app_name, user_id, session_id))
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Partial events are streaming fragments and are not stored. State
    /// deltas are applied except for `temp:` keys.
    async fn append_event(&self, session: &Session, event: &Event) -> Result<(), SessionError> {
        if event.partial {
            return Ok(());
        }
        let key = Self::key(&session.app_name, &session.user_id, &session.id);
        let mut sessions = self.sessions.write();
        let stored = sessions
            .get_mut(&key)
            .ok_or_else(|| SessionError::NotFound(session.id.to_string()))?;

        if let Some(actions) = &event.actions {
            for (k, v) in &actions.state_delta {
                if !k.starts_with(TEMP_STATE_PREFIX) {
                    stored.state.insert(k.clone(), v.clone());
                }
            }
        }
        stored.events.push(event.clone());
        stored.last_update_time = Utc::now();
        Ok(())
    }
}
