//! WebSocket API: upgrade handling and session lifecycle.
//!
//! Upgrades on `/ws` spawn one task per connection that owns the session
//! state machine. The task multiplexes inbound frames, the authentication
//! deadline, outbound-transaction completions, and shutdown requests, and
//! carries out whatever [`Action`]s the session returns.
//!
//! Closing follows the linger protocol: the socket is closed (without a
//! status code, so the peer observes 1005), the session's slot is nulled,
//! and the record itself is erased `WebSocketCloseLinger` seconds later so
//! late callbacks still find the slot. Deferred erases capture the listener
//! generation and no-op after a demobilize.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::any,
};
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use alfred_core::{Configuration, Scheduler, Store, SystemClock};

use crate::api;
use crate::session::{Action, Session};
use crate::transactions::ClientTransactions;
use crate::twitch;

/// Tunables the listener reads from `Configuration`.
#[derive(Debug, Clone)]
pub struct WsSettings {
    /// Largest accepted frame, in bytes.
    pub max_frame_size: usize,
    /// Seconds an unauthenticated session may live.
    pub authentication_timeout: f64,
    /// Seconds a closed session's record lingers before erasure.
    pub close_linger: f64,
    /// OAuth validation endpoint; tests point this at a local server.
    pub validate_url: String,
}

impl WsSettings {
    /// Extracts the WebSocket tunables from the service configuration.
    #[must_use]
    pub fn from_configuration(configuration: &Configuration) -> Self {
        Self {
            max_frame_size: configuration.web_socket_max_frame_size,
            authentication_timeout: configuration.web_socket_authentication_timeout,
            close_linger: configuration.web_socket_close_linger,
            validate_url: twitch::VALIDATE_URL.to_owned(),
        }
    }
}

/// A connected (or lingering) session record. `control` is taken when the
/// socket closes; the record itself survives until the linger erase.
struct ClientSlot {
    peer: String,
    control: Option<mpsc::Sender<()>>,
}

struct ListenerShared {
    store: Weak<Store>,
    transactions: Arc<ClientTransactions>,
    settings: WsSettings,
    scheduler: Scheduler,
    generation: AtomicU64,
    next_client: AtomicU64,
    clients: Mutex<HashMap<u64, ClientSlot>>,
}

/// The WebSocket listener: owns the client registry and the close-linger
/// scheduler.
pub struct WsListener {
    shared: Arc<ListenerShared>,
}

#[derive(Clone)]
struct WsState {
    shared: Arc<ListenerShared>,
}

impl WsListener {
    /// Creates the listener. The store is held weakly so upgrades arriving
    /// during shutdown answer `503`.
    #[must_use]
    pub fn new(
        store: Weak<Store>,
        transactions: Arc<ClientTransactions>,
        settings: WsSettings,
    ) -> Self {
        let scheduler = Scheduler::new();
        scheduler.set_clock(Some(Arc::new(SystemClock)));
        Self {
            shared: Arc::new(ListenerShared {
                store,
                transactions,
                settings,
                scheduler,
                generation: AtomicU64::new(1),
                next_client: AtomicU64::new(1),
                clients: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Builds the `/ws` route with its state applied.
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", any(websocket_handler))
            .with_state(WsState {
                shared: Arc::clone(&self.shared),
            })
    }

    /// Session records currently registered, lingering ones included.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.shared.clients.lock().len()
    }

    /// Sweeps every client and invalidates deferred erases from this
    /// incarnation.
    pub fn demobilize(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let swept: Vec<_> = {
            let mut clients = self.shared.clients.lock();
            clients.drain().collect()
        };
        for (_, slot) in swept {
            debug!(peer = %slot.peer, "sweeping session");
            // Dropping the slot drops its control sender; the session task
            // observes the closed channel and shuts down.
        }
    }
}

async fn websocket_handler(
    State(state): State<WsState>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // A bad handshake answers 426 even during shutdown; only a well-formed
    // upgrade consults store liveness.
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            debug!(error = %rejection, "websocket negotiation failed");
            return (
                StatusCode::UPGRADE_REQUIRED,
                [(header::UPGRADE, "websocket")],
            )
                .into_response();
        }
    };
    let Some(store) = state.shared.store.upgrade() else {
        return api::service_unavailable();
    };
    let shared = Arc::clone(&state.shared);
    let max_frame_size = shared.settings.max_frame_size;
    upgrade
        .max_frame_size(max_frame_size)
        .max_message_size(max_frame_size)
        .on_upgrade(move |socket| handle_socket(socket, shared, store))
        .into_response()
}

async fn handle_socket(socket: WebSocket, shared: Arc<ListenerShared>, store: Arc<Store>) {
    let id = shared.next_client.fetch_add(1, Ordering::SeqCst);
    let peer = format!("ws-{id}");
    let (control_tx, mut control_rx) = mpsc::channel::<()>(1);
    shared.clients.lock().insert(
        id,
        ClientSlot {
            peer: peer.clone(),
            control: Some(control_tx),
        },
    );
    info!(peer = %peer, "opened");

    let (mut sender, mut receiver) = socket.split();
    let mut session = Session::new(peer.clone(), store);
    let (validation_tx, mut validation_rx) = mpsc::channel::<twitch::Outcome>(1);
    let auth_deadline =
        tokio::time::sleep(Duration::from_secs_f64(shared.settings.authentication_timeout));
    tokio::pin!(auth_deadline);

    loop {
        let actions = tokio::select! {
            () = &mut auth_deadline, if !session.is_authenticated() => {
                session.on_auth_deadline()
            }
            outcome = validation_rx.recv() => {
                match outcome {
                    Some(outcome) => session.on_twitch_validation(outcome),
                    None => continue,
                }
            }
            _ = control_rx.recv() => {
                debug!(peer = %peer, "close requested");
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => session.on_text(text.as_str()),
                    Some(Ok(Message::Close(_))) => {
                        debug!(peer = %peer, "closed by peer");
                        break;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sender.send(Message::Pong(payload)).await;
                        continue;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(socket_error)) => {
                        warn!(peer = %peer, error = %socket_error, "socket error");
                        break;
                    }
                    None => break,
                }
            }
        };
        if carry_out(&mut sender, &shared, &validation_tx, actions)
            .await
            .is_err()
        {
            break;
        }
    }

    info!(peer = %peer, "closed");
    ListenerShared::drop_client(&shared, id);
}

/// Carries out the session's actions. `Err` means the socket is done.
async fn carry_out(
    sender: &mut SplitSink<WebSocket, Message>,
    shared: &Arc<ListenerShared>,
    validation_tx: &mpsc::Sender<twitch::Outcome>,
    actions: Vec<Action>,
) -> Result<(), ()> {
    for action in actions {
        match action {
            Action::Send(frame) => {
                if sender
                    .send(Message::Text(frame.to_string().into()))
                    .await
                    .is_err()
                {
                    return Err(());
                }
            }
            Action::Close => {
                // No status code in the close frame: the peer observes 1005.
                let _ = sender.send(Message::Close(None)).await;
                return Err(());
            }
            Action::ValidateTwitch(token) => {
                twitch::begin_validation(
                    &shared.transactions,
                    &shared.settings.validate_url,
                    &token,
                    validation_tx.clone(),
                );
            }
        }
    }
    Ok(())
}

impl ListenerShared {
    /// Nulls the client's control handle and schedules the record erase at
    /// `now + close_linger`, stamped with the current generation.
    fn drop_client(shared: &Arc<Self>, id: u64) {
        let mut clients = shared.clients.lock();
        let Some(slot) = clients.get_mut(&id) else {
            return;
        };
        slot.control = None;
        let Some(now) = shared.scheduler.now() else {
            clients.remove(&id);
            return;
        };
        let generation = shared.generation.load(Ordering::SeqCst);
        let weak = Arc::downgrade(shared);
        shared
            .scheduler
            .schedule(now + shared.settings.close_linger, move || {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if shared.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                if shared.clients.lock().remove(&id).is_some() {
                    debug!("dropping session record {id}");
                }
            });
    }
}
