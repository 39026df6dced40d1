//! Seams to the host application: presence, UI rendering, navigation, local
//! notifications, push, and the mute list. The engine decides *whether* and
//! *what* to show; the host owns presentation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rendezvous_core::types::EventKind;
use serde::{Deserialize, Serialize};

use crate::error::{HostError, MuteLookupError};

/// "Is the app in the foreground right now?"
pub trait PresenceOracle: Send + Sync {
    fn is_foreground(&self) -> bool;
}

impl<F> PresenceOracle for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_foreground(&self) -> bool {
        self()
    }
}

pub trait ConversationNavigator: Send + Sync {
    fn navigate_to_conversation(&self, participant_id: &str);
}

impl<F> ConversationNavigator for F
where
    F: Fn(&str) + Send + Sync,
{
    fn navigate_to_conversation(&self, participant_id: &str) {
        self(participant_id)
    }
}

/// Full-screen "it's a match" presentation, if the host has one.
pub trait MatchModal: Send + Sync {
    fn show_match(&self, display_name: &str, participant_id: &str) -> Result<(), HostError>;
}

impl<F> MatchModal for F
where
    F: Fn(&str, &str) -> Result<(), HostError> + Send + Sync,
{
    fn show_match(&self, display_name: &str, participant_id: &str) -> Result<(), HostError> {
        self(display_name, participant_id)
    }
}

/// In-app toast/banner/alert renderer.
pub trait Renderer: Send + Sync {
    fn render(&self, request: RenderRequest) -> Result<(), HostError>;
}

/// OS-level local notification, used by the fallback scheduler.
pub trait LocalNotifier: Send + Sync {
    fn deliver(&self, notification: &LocalNotification) -> Result<(), HostError>;
}

/// Out-of-process push sender. The router never waits on it.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, session_id: &str, message: PushMessage) -> Result<(), HostError>;
}

/// "Has the current user muted this sender?"
#[async_trait]
pub trait MuteFilter: Send + Sync {
    async fn is_muted(&self, sender_session_id: &str) -> Result<bool, MuteLookupError>;
}

/// Mute filter for hosts without a mute feature.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMutes;

#[async_trait]
impl MuteFilter for NoMutes {
    async fn is_muted(&self, _sender_session_id: &str) -> Result<bool, MuteLookupError> {
        Ok(false)
    }
}

/// UI callbacks handed to the router at `init`.
#[derive(Clone)]
pub struct HostBindings {
    pub presence: Arc<dyn PresenceOracle>,
    pub navigator: Arc<dyn ConversationNavigator>,
    pub renderer: Arc<dyn Renderer>,
    pub match_modal: Option<Arc<dyn MatchModal>>,
}

/// Press handler attached to a render request.
#[derive(Clone)]
pub struct PressAction(Arc<dyn Fn() + Send + Sync>);

impl PressAction {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Open the conversation with `participant_id` through `navigator`.
    pub fn open_conversation(
        navigator: Arc<dyn ConversationNavigator>,
        participant_id: impl Into<String>,
    ) -> Self {
        let participant_id = participant_id.into();
        Self::new(move || navigator.navigate_to_conversation(&participant_id))
    }

    pub fn invoke(&self) {
        (self.0)()
    }
}

impl fmt::Debug for PressAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PressAction(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStyle {
    /// "It's a match" alert shown to the initiator.
    MatchAlert,
    /// Transient banner for incoming matches and messages.
    Toast,
}

#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub style: RenderStyle,
    pub title: String,
    pub body: String,
    /// Session id of the conversation `on_press` opens.
    pub participant_id: String,
    pub on_press: PressAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalNotification {
    pub fallback_id: String,
    pub event_id: String,
    pub kind: EventKind,
    pub title: String,
    pub body: String,
    pub participant_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub payload: serde_json::Value,
}
