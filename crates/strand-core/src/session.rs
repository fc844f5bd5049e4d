use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SessionError;
use crate::event::Event;
use crate::ids::SessionId;

/// State keys with this prefix live only for the current invocation.
pub const TEMP_STATE_PREFIX: &str = "temp:";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub app_name: String,
    pub user_id: String,
    #[serde(default)]
    pub state: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub events: Vec<Event>,
    pub last_update_time: DateTime<Utc>,
}

impl Session {
    pub fn new(app_name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: SessionId::new(),
            app_name: app_name.into(),
            user_id: user_id.into(),
            state: HashMap::new(),
            events: Vec::new(),
            last_update_time: Utc::now(),
        }
    }
}

/// Session persistence collaborator. Only the runner calls it; agents emit
/// events and never persist them.
#[async_trait]
pub trait SessionService: Send + Sync {
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: Option<SessionId>,
    ) -> Result<Session, SessionError>;

    async fn get_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &SessionId,
    ) -> Result<Session, SessionError>;

    async fn append_event(&self, session: &Session, event: &Event) -> Result<(), SessionError>;
}
