//! Per-connection session state machine.
//!
//! A session starts unauthenticated and must present a credential before its
//! authentication deadline. Messages are JSON objects with a string `type`;
//! the only client message at this revision is `Authenticate`. Server frames
//! are `Authenticated`, `Error{message}`, and the reserved `Notice`.
//!
//! The machine is transport-free: the WebSocket task feeds it events and
//! carries out the [`Action`]s it returns, so the protocol rules are
//! testable without a socket.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use alfred_core::{RoleSet, Store, roles};

/// Server-to-client protocol frames.
pub mod frames {
    use super::{Value, json};

    /// Acknowledges a successful authentication.
    #[must_use]
    pub fn authenticated() -> Value {
        json!({"type": "Authenticated"})
    }

    /// Reports a protocol or credential problem.
    #[must_use]
    pub fn error(message: &str) -> Value {
        json!({"type": "Error", "message": message})
    }
}

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Opened, waiting for a credential.
    AwaitingAuth,
    /// Credential accepted; normal dispatch.
    Authenticated,
    /// A close has been requested; no further dispatch.
    Closing,
}

/// What the transport must do after feeding the session an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send a frame to the client.
    Send(Value),
    /// Close the socket without a status code (the peer observes 1005).
    Close,
    /// Begin outbound validation of a Twitch OAuth token.
    ValidateTwitch(String),
}

/// One client's authentication and dispatch state.
pub struct Session {
    peer: String,
    phase: Phase,
    identifiers: BTreeSet<String>,
    held: RoleSet,
    store: Arc<Store>,
    validation_pending: bool,
}

impl Session {
    /// Creates a session in [`Phase::AwaitingAuth`].
    pub fn new(peer: impl Into<String>, store: Arc<Store>) -> Self {
        Self {
            peer: peer.into(),
            phase: Phase::AwaitingAuth,
            identifiers: BTreeSet::new(),
            held: RoleSet::new(),
            store,
            validation_pending: false,
        }
    }

    /// Peer identity string, used as the diagnostics prefix.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Current lifecycle phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether a credential has been accepted.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self.phase, Phase::Authenticated)
    }

    /// Roles granted by the identifiers this session holds.
    #[must_use]
    pub const fn held_roles(&self) -> &RoleSet {
        &self.held
    }

    /// Dispatches one inbound text frame.
    ///
    /// Malformed frames (not a JSON object, or no string `type`) produce an
    /// `Error` and close the session; unknown types produce an `Error` but
    /// leave it open.
    pub fn on_text(&mut self, text: &str) -> Vec<Action> {
        debug!(peer = %self.peer, "received: {text}");
        let message: Value = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(_) => return self.malformed(text),
        };
        let Some(kind) = message.get("type").and_then(Value::as_str) else {
            return self.malformed(text);
        };
        match kind {
            "Authenticate" => self.on_authenticate(&message),
            unknown => vec![Action::Send(frames::error(&format!(
                "Unknown message type: {unknown}"
            )))],
        }
    }

    /// Reacts to the outcome of an outbound Twitch validation.
    pub fn on_twitch_validation(&mut self, outcome: Result<String, String>) -> Vec<Action> {
        self.validation_pending = false;
        match outcome {
            Ok(user_id) => self.complete_authentication(format!("twitch:{user_id}")),
            Err(reason) => self.refuse(&reason),
        }
    }

    /// Fires when the authentication deadline passes. A no-op once
    /// authenticated.
    pub fn on_auth_deadline(&mut self) -> Vec<Action> {
        if self.is_authenticated() {
            return Vec::new();
        }
        self.refuse("Authentication timeout")
    }

    fn on_authenticate(&mut self, message: &Value) -> Vec<Action> {
        if self.is_authenticated() {
            return self.refuse("reauthentication is not allowed");
        }
        if let Some(key) = message.get("key").and_then(Value::as_str) {
            return self.complete_authentication(format!("key:{key}"));
        }
        if let Some(token) = message.get("twitch").and_then(Value::as_str) {
            if self.validation_pending {
                return self.refuse("authentication is already in progress");
            }
            self.validation_pending = true;
            return vec![Action::ValidateTwitch(token.to_owned())];
        }
        self.refuse("Authenticate requires a \"key\" or \"twitch\" credential")
    }

    fn complete_authentication(&mut self, identifier: String) -> Vec<Action> {
        if !self.add_identifier(identifier) {
            return self.refuse("unrecognized credential");
        }
        self.phase = Phase::Authenticated;
        info!(peer = %self.peer, roles = ?self.held, "authenticated");
        vec![Action::Send(frames::authenticated())]
    }

    /// Adds `identifier` and every role listed for it under the document's
    /// top-level `Roles` object. Duplicate adds are no-ops. Returns `false`
    /// when the identifier is unknown.
    fn add_identifier(&mut self, identifier: String) -> bool {
        if self.identifiers.contains(&identifier) {
            return true;
        }
        let listed = self
            .store
            .get(&["Roles", identifier.as_str()], &roles::admin());
        let Some(listed) = listed.as_array() else {
            return false;
        };
        self.held.extend(
            listed
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned),
        );
        self.identifiers.insert(identifier);
        true
    }

    fn malformed(&mut self, text: &str) -> Vec<Action> {
        warn!(peer = %self.peer, "malformed message received: {text}");
        self.phase = Phase::Closing;
        vec![
            Action::Send(frames::error("malformed message received")),
            Action::Close,
        ]
    }

    fn refuse(&mut self, message: &str) -> Vec<Action> {
        warn!(peer = %self.peer, "{message}");
        self.phase = Phase::Closing;
        vec![Action::Send(frames::error(message)), Action::Close]
    }
}
