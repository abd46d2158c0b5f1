//! Conversation session manager
//!
//! Owns the realtime connection, message ledger and analysis job for the
//! currently selected conversation. Selecting a conversation (even the same
//! one again) closes the old connection, clears the ledger, bumps the
//! generation counter, fetches history and opens a fresh connection. Every
//! asynchronous result is tagged with the generation that issued it and is
//! discarded if the generation has since moved on.

use crate::analysis::{AnalysisState, AnalysisUpdate, AnalysisWorkflow};
use crate::api::ChatBackend;
use crate::config::Config;
use crate::credential::{Credential, CredentialSource};
use crate::error::{Error, Result};
use crate::events::{EventSink, SessionEvent, SessionEventKind, SessionUpdate, TransportEvent};
use crate::ledger::MessageLedger;
use crate::messages::{encode_frame, parse_frame, ConversationKey, Message};
use crate::transport::{Connection, Transport};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// No conversation selected
    Idle,
    /// Waiting on history and/or the channel's open event
    Loading {
        peer: ConversationKey,
        history_loaded: bool,
        channel_open: bool,
    },
    Active {
        peer: ConversationKey,
    },
    /// Channel failed or closed; nothing happens until the next selection
    Inert {
        peer: ConversationKey,
        reason: String,
    },
    /// No credential; the caller should send the user to sign in
    Unauthenticated,
}

/// Reconnect behaviour after an unexpected channel loss
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// 0 disables reconnect
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::ZERO,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.reconnect_attempts,
            base_delay: config.reconnect_base_delay(),
        }
    }

    /// Exponential backoff: base, 2*base, 4*base, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Session manager for one signed-in user
pub struct ConversationSession {
    backend: Arc<dyn ChatBackend>,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    local_user: String,
    reconnect: ReconnectPolicy,
    state: SessionState,
    generation: u64,
    credential: Option<Credential>,
    connection: Option<Box<dyn Connection>>,
    reconnect_attempts: u32,
    /// Set while a reopen is pending or handshaking
    reconnecting: bool,
    ledger: MessageLedger,
    analysis: AnalysisWorkflow,
    pending: VecDeque<SessionUpdate>,
    tx: mpsc::UnboundedSender<SessionEvent>,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl ConversationSession {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
        local_user: &str,
        config: &Config,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let analysis = AnalysisWorkflow::new(
            Arc::clone(&backend),
            config.analysis_poll_interval(),
            config.analysis_max_polls,
        );

        Self {
            backend,
            transport,
            credentials,
            local_user: local_user.to_string(),
            reconnect: ReconnectPolicy::from_config(config),
            state: SessionState::Idle,
            generation: 0,
            credential: None,
            connection: None,
            reconnect_attempts: 0,
            reconnecting: false,
            ledger: MessageLedger::new(),
            analysis,
            pending: VecDeque::new(),
            tx,
            rx,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    /// The selected conversation, if any
    pub fn conversation(&self) -> Option<&ConversationKey> {
        match &self.state {
            SessionState::Loading { peer, .. }
            | SessionState::Active { peer }
            | SessionState::Inert { peer, .. } => Some(peer),
            SessionState::Idle | SessionState::Unauthenticated => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Active { .. })
    }

    pub fn messages(&self) -> &[Message] {
        self.ledger.messages()
    }

    pub fn ledger(&self) -> &MessageLedger {
        &self.ledger
    }

    pub fn analysis(&self) -> &AnalysisState {
        self.analysis.state()
    }

    /// Switch to `peer`.
    ///
    /// Closes the previous channel, clears the ledger, then (credential
    /// permitting) fetches history and opens a new channel. Cancels analysis
    /// when the peer changes.
    pub fn select(&mut self, peer: &str) -> Result<()> {
        let key = ConversationKey::parse(peer)?;

        if self.conversation() != Some(&key) {
            self.analysis.cancel();
        }
        self.teardown();

        let Some(credential) = self.credentials.resolve() else {
            warn!("No credential available, not opening chat with {}", key);
            self.analysis.cancel();
            self.state = SessionState::Unauthenticated;
            return Err(Error::AuthMissing);
        };

        self.spawn_history(&key, &credential);

        match self.transport.open(&key, &credential, self.sink()) {
            Ok(connection) => self.connection = Some(connection),
            Err(e) => {
                error!("Could not open chat channel to {}: {}", key, e);
                self.state = SessionState::Inert {
                    peer: key,
                    reason: e.to_string(),
                };
                return Err(e);
            }
        }

        info!("Selected conversation with {} (generation {})", key, self.generation);
        self.credential = Some(credential);
        self.reconnect_attempts = 0;
        self.state = SessionState::Loading {
            peer: key,
            history_loaded: false,
            channel_open: false,
        };
        Ok(())
    }

    /// Leave the current conversation
    pub fn deselect(&mut self) {
        if let Some(peer) = self.conversation() {
            info!("Leaving conversation with {}", peer);
        }
        self.analysis.cancel();
        self.teardown();
        self.state = SessionState::Idle;
    }

    /// Send `content` to the active conversation.
    ///
    /// Issues the durable write and pushes the frame on the live channel
    /// independently, and echoes the message into the ledger right away.
    pub fn send(&mut self, content: &str) -> Result<Message> {
        if content.trim().is_empty() {
            return Err(Error::Validation("message is empty".to_string()));
        }

        let SessionState::Active { peer } = &self.state else {
            return Err(Error::NoActiveConversation);
        };
        let peer = peer.clone();
        let credential = self.credential.clone().ok_or(Error::AuthMissing)?;

        let message = Message::outgoing(&self.local_user, peer.as_str(), content);
        let frame = encode_frame(&message)?;

        let backend = Arc::clone(&self.backend);
        let sink = self.sink();
        let body = content.to_string();
        tokio::spawn(async move {
            let result = backend.send_durable(&credential, peer.as_str(), &body).await;
            sink.report(SessionEventKind::Delivery(result));
        });

        if let Some(connection) = self.connection.as_mut() {
            connection.send(frame);
        }
        self.ledger.append(message.clone());

        Ok(message)
    }

    /// Start bot analysis of the selected conversation's peer
    pub fn start_analysis(&mut self) -> Result<()> {
        let peer = self.conversation().ok_or(Error::NoActiveConversation)?.to_string();
        let credential = self.credential.clone().ok_or(Error::AuthMissing)?;
        self.analysis.start(&peer, credential)
    }

    pub fn cancel_analysis(&mut self) {
        self.analysis.cancel();
    }

    /// Wait for the next thing the display should know about
    pub async fn next_update(&mut self) -> SessionUpdate {
        enum Next {
            Event(Option<SessionEvent>),
            Analysis(AnalysisUpdate),
        }

        loop {
            if let Some(update) = self.pending.pop_front() {
                return update;
            }

            let next = tokio::select! {
                event = self.rx.recv() => Next::Event(event),
                update = self.analysis.next_update() => Next::Analysis(update),
            };

            match next {
                Next::Event(Some(event)) => self.apply(event),
                Next::Event(None) => return std::future::pending().await,
                Next::Analysis(update) => return SessionUpdate::Analysis(update),
            }
        }
    }

    fn apply(&mut self, event: SessionEvent) {
        if event.generation != self.generation {
            debug!(
                "Discarding stale {} from generation {} (now {})",
                event_label(&event.kind),
                event.generation,
                self.generation
            );
            return;
        }

        match event.kind {
            SessionEventKind::History(result) => self.on_history(result),
            SessionEventKind::Transport(event) => self.on_transport(event),
            SessionEventKind::Delivery(result) => self.on_delivery(result),
            SessionEventKind::Reconnect => self.on_reconnect(),
        }
    }

    fn on_history(&mut self, result: Result<Vec<Message>>) {
        let Some(peer) = self.conversation().map(|k| k.to_string()) else {
            return;
        };

        // Frames that beat the history fetch go after it and are announced
        // only if the history does not already hold them
        let early = self.ledger.take();

        match result {
            Ok(history) => {
                self.ledger.load_history(history);
                info!("Loaded {} messages with {}", self.ledger.len(), peer);
                self.pending.push_back(SessionUpdate::HistoryLoaded {
                    peer,
                    count: self.ledger.len(),
                });
            }
            Err(e) => {
                warn!("Could not load history with {}: {}", peer, e);
                self.pending.push_back(SessionUpdate::HistoryUnavailable {
                    peer,
                    reason: e.to_string(),
                });
            }
        }

        for message in early {
            if self.ledger.append(message.clone()) {
                self.pending.push_back(SessionUpdate::MessageReceived(message));
            }
        }

        if let SessionState::Loading { history_loaded, .. } = &mut self.state {
            *history_loaded = true;
        }
        self.promote();
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                if let SessionState::Loading { channel_open, .. } = &mut self.state {
                    *channel_open = true;
                    self.promote();
                }
            }
            TransportEvent::Message(raw) => {
                let before_history = match &self.state {
                    SessionState::Loading { history_loaded, .. } => !history_loaded,
                    SessionState::Active { .. } => false,
                    _ => return,
                };
                match parse_frame(&raw) {
                    Ok(message) => {
                        if self.ledger.append(message.clone()) {
                            if before_history {
                                debug!(
                                    "Holding frame from {} until history loads",
                                    message.sender_id
                                );
                            } else {
                                self.pending.push_back(SessionUpdate::MessageReceived(message));
                            }
                        } else {
                            debug!("Duplicate frame from {} ignored", message.sender_id);
                        }
                    }
                    Err(e) => {
                        warn!("Dropping malformed chat frame: {}", e);
                        self.pending.push_back(SessionUpdate::FrameDropped {
                            reason: e.to_string(),
                        });
                    }
                }
            }
            TransportEvent::Error(reason) => {
                error!("Chat channel error: {}", reason);
                self.on_channel_lost(reason.clone(), |peer| SessionUpdate::ConnectionError {
                    peer,
                    reason,
                });
            }
            TransportEvent::Close(reason) => {
                info!("Chat channel closed: {:?}", reason);
                let text = reason.clone().unwrap_or_else(|| "closed".to_string());
                self.on_channel_lost(text, |peer| SessionUpdate::ConnectionClosed { peer, reason });
            }
        }
    }

    fn on_delivery(&mut self, result: Result<Message>) {
        match result {
            Ok(ack) => debug!("Message to {} stored", ack.receiver_id),
            Err(e) => {
                let peer = self.conversation().map(|k| k.to_string()).unwrap_or_default();
                warn!("Durable write to {} failed: {}", peer, e);
                self.pending.push_back(SessionUpdate::DeliveryFailed {
                    peer,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn on_channel_lost(&mut self, reason: String, update: impl FnOnce(String) -> SessionUpdate) {
        // A first handshake that fails is final; a failed reopen retries
        let (peer, may_retry) = match &self.state {
            SessionState::Active { peer } => (peer.clone(), true),
            SessionState::Loading { peer, .. } => (peer.clone(), self.reconnecting),
            _ => return,
        };

        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
        self.pending.push_back(update(peer.to_string()));

        if may_retry && self.reconnect_attempts < self.reconnect.max_attempts {
            self.reconnecting = true;
            self.reconnect_attempts += 1;
            let attempt = self.reconnect_attempts;
            let delay = self.reconnect.delay_for(attempt);

            // Late events from the dead channel must not reach the new one
            self.generation += 1;
            let sink = self.sink();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                sink.report(SessionEventKind::Reconnect);
            });

            info!("Reconnecting to {} in {:?} (attempt {})", peer, delay, attempt);
            self.pending.push_back(SessionUpdate::Reconnecting {
                peer: peer.to_string(),
                attempt,
                delay,
            });
            self.state = SessionState::Loading {
                peer,
                history_loaded: true,
                channel_open: false,
            };
        } else {
            self.reconnecting = false;
            self.state = SessionState::Inert { peer, reason };
        }
    }

    fn on_reconnect(&mut self) {
        let SessionState::Loading { peer, .. } = &self.state else {
            return;
        };
        let peer = peer.clone();
        let Some(credential) = self.credential.clone() else {
            return;
        };

        match self.transport.open(&peer, &credential, self.sink()) {
            Ok(connection) => self.connection = Some(connection),
            Err(e) => {
                error!("Reconnect to {} failed: {}", peer, e);
                let reason = e.to_string();
                self.on_channel_lost(reason.clone(), |peer| SessionUpdate::ConnectionError {
                    peer,
                    reason,
                });
            }
        }
    }

    fn promote(&mut self) {
        if let SessionState::Loading {
            peer,
            history_loaded: true,
            channel_open: true,
        } = &self.state
        {
            let peer = peer.clone();
            info!("Conversation with {} is live", peer);
            self.reconnecting = false;
            self.pending.push_back(SessionUpdate::Connected {
                peer: peer.to_string(),
            });
            self.state = SessionState::Active { peer };
        }
    }

    /// Close the channel and clear everything tied to the current generation
    fn teardown(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            debug!("Closing channel to {}", connection.peer());
            connection.close();
        }
        self.ledger.reset();
        self.pending.clear();
        self.credential = None;
        self.reconnecting = false;
        self.generation += 1;
    }

    fn spawn_history(&self, peer: &ConversationKey, credential: &Credential) {
        let backend = Arc::clone(&self.backend);
        let sink = self.sink();
        let peer = peer.to_string();
        let credential = credential.clone();
        tokio::spawn(async move {
            let result = backend.fetch_history(&credential, &peer).await;
            sink.report(SessionEventKind::History(result));
        });
    }

    fn sink(&self) -> EventSink {
        EventSink::new(self.generation, self.tx.clone())
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
    }
}

fn event_label(kind: &SessionEventKind) -> &'static str {
    match kind {
        SessionEventKind::Transport(_) => "transport event",
        SessionEventKind::History(_) => "history response",
        SessionEventKind::Delivery(_) => "delivery ack",
        SessionEventKind::Reconnect => "reconnect timer",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delays() {
        let policy = ReconnectPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        // Huge attempt numbers saturate instead of overflowing
        assert!(policy.delay_for(u32::MAX) >= Duration::from_secs(1));
    }

    #[test]
    fn test_default_policy_is_disabled() {
        assert_eq!(ReconnectPolicy::default().max_attempts, 0);
        let temp = std::env::temp_dir();
        assert_eq!(
            ReconnectPolicy::from_config(&Config::for_test(&temp)),
            ReconnectPolicy {
                max_attempts: 0,
                base_delay: Duration::from_millis(500),
            }
        );
    }

    #[test]
    fn test_event_labels() {
        assert_eq!(event_label(&SessionEventKind::Reconnect), "reconnect timer");
        assert_eq!(
            event_label(&SessionEventKind::Transport(TransportEvent::Open)),
            "transport event"
        );
    }
}
