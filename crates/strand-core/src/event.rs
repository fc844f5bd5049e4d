use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::{Content, Part};
use crate::ids::{EventId, InvocationId};

/// Author recorded on events that carry the caller's own input.
pub const USER_AUTHOR: &str = "user";

/// One step of an invocation. Immutable once yielded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub invocation_id: InvocationId,
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub partial: bool,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub long_running_tool_ids: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<EventActions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ModelResponse>,
}

/// Side effects requested by an event.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EventActions {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub state_delta: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub artifact_delta: HashMap<String, i64>,
    #[serde(default)]
    pub skip_summarization: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_to_agent: Option<String>,
    /// Stops the enclosing loop agent after the current event.
    #[serde(default)]
    pub escalate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compaction: Option<EventCompaction>,
}

/// Marks that a range of history was replaced by a single summary.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EventCompaction {
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub compacted_content: Content,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ModelResponse {
    pub fn with_content(content: Content) -> Self {
        Self {
            content: Some(content),
            ..Default::default()
        }
    }
}

impl Event {
    pub fn new(invocation_id: InvocationId, author: impl Into<String>) -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            invocation_id,
            author: author.into(),
            branch: None,
            partial: false,
            long_running_tool_ids: BTreeSet::new(),
            actions: Some(EventActions::default()),
            response: None,
        }
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.response = Some(ModelResponse::with_content(content));
        self
    }

    pub fn with_branch(mut self, branch: Option<String>) -> Self {
        self.branch = branch;
        self
    }

    pub fn content(&self) -> Option<&Content> {
        self.response.as_ref().and_then(|r| r.content.as_ref())
    }

    pub fn actions_mut(&mut self) -> &mut EventActions {
        self.actions.get_or_insert_with(EventActions::default)
    }

    pub fn escalates(&self) -> bool {
        self.actions.as_ref().is_some_and(|a| a.escalate)
    }

    /// Whether this event hands control back to the caller instead of
    /// continuing the turn.
    pub fn is_final_response(&self) -> bool {
        let Some(actions) = &self.actions else {
            return true;
        };
        if actions.skip_summarization || !self.long_running_tool_ids.is_empty() {
            return true;
        }
        let Some(response) = &self.response else {
            return false;
        };
        let (has_calls, has_responses) = match &response.content {
            Some(c) => (!c.function_calls().is_empty(), !c.function_responses().is_empty()),
            None => (false, false),
        };
        !has_calls && !has_responses && !self.partial && !self.has_trailing_code_execution_result()
    }

    pub fn has_trailing_code_execution_result(&self) -> bool {
        self.content()
            .and_then(|c| c.parts.last())
            .is_some_and(|p| matches!(p, Part::CodeExecutionResult { .. }))
    }
}
