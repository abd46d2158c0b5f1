//! Events flowing into the session and updates flowing out to the display

use crate::analysis::AnalysisUpdate;
use crate::error::Result;
use crate::messages::Message;
use std::time::Duration;
use tokio::sync::mpsc;

/// Lifecycle and data events reported by a transport connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(String),
    Close(Option<String>),
}

/// Completion of some piece of session work
#[derive(Debug)]
pub enum SessionEventKind {
    Transport(TransportEvent),
    History(Result<Vec<Message>>),
    Delivery(Result<Message>),
    Reconnect,
}

/// A report tagged with the session generation that issued it
#[derive(Debug)]
pub struct SessionEvent {
    pub generation: u64,
    pub kind: SessionEventKind,
}

/// Where a transport connection (or a spawned call) reports back to
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the session is gone
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.report(SessionEventKind::Transport(event))
    }

    pub fn report(&self, kind: SessionEventKind) -> bool {
        self.tx
            .send(SessionEvent {
                generation: self.generation,
                kind,
            })
            .is_ok()
    }
}

/// What the display layer gets told about
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Connected { peer: String },
    HistoryLoaded { peer: String, count: usize },
    HistoryUnavailable { peer: String, reason: String },
    MessageReceived(Message),
    FrameDropped { reason: String },
    DeliveryFailed { peer: String, reason: String },
    ConnectionError { peer: String, reason: String },
    ConnectionClosed { peer: String, reason: Option<String> },
    Reconnecting { peer: String, attempt: u32, delay: Duration },
    Analysis(AnalysisUpdate),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_tags_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(7, tx);

        assert!(sink.emit(TransportEvent::Open));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.generation, 7);
        assert!(matches!(event.kind, SessionEventKind::Transport(TransportEvent::Open)));
    }

    #[test]
    fn test_sink_reports_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(1, tx);
        drop(rx);
        assert!(!sink.emit(TransportEvent::Message("{}".to_string())));
    }
}
