//! Audio pipeline seam.
//!
//! A pipeline plays one URI at a time and reports what happens on a message
//! bus.  All calls are non-blocking: state changes are requested, and the
//! outcome arrives later as a [`BusMessage`] on the watched [`BusSink`].
//!
//! The production backend is mpv ([`crate::mpv`]); tests use
//! [`fake::FakeFactory`].

use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Null,
    Ready,
    Paused,
    Playing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChangeResult {
    Success,
    /// Change accepted, completes in the background.
    Async,
    /// Live source: no preroll, playing will follow.
    NoPreroll,
    Failure,
}

/// Answer to a state query: `(result, current, pending)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateQuery {
    pub result: StateChangeResult,
    pub current: PipelineState,
    pub pending: Option<PipelineState>,
}

impl StateQuery {
    /// Playing or paused, or on its way to one of them.
    pub fn is_healthy(&self) -> bool {
        let ok = |s: PipelineState| matches!(s, PipelineState::Playing | PipelineState::Paused);
        self.result != StateChangeResult::Failure
            && (ok(self.current) || self.pending.map(ok).unwrap_or(false))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    Error(String),
    EndOfStream,
    StateChanged(PipelineState),
    /// Fill level of the network buffer, 0..=100.
    Buffering(u8),
}

/// A bus message tagged with the supervisor session that was watching.
#[derive(Debug, Clone, PartialEq)]
pub struct BusEnvelope {
    pub session: u64,
    pub message: BusMessage,
}

/// Where a pipeline posts its bus messages.
#[derive(Debug, Clone)]
pub struct BusSink {
    session: u64,
    tx: mpsc::UnboundedSender<BusEnvelope>,
}

impl BusSink {
    pub fn new(session: u64, tx: mpsc::UnboundedSender<BusEnvelope>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Returns false once the receiving loop is gone.
    pub fn post(&self, message: BusMessage) -> bool {
        let sent = self
            .tx
            .send(BusEnvelope {
                session: self.session,
                message,
            })
            .is_ok();
        if !sent {
            debug!("bus: receiver dropped (session {})", self.session);
        }
        sent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("mpv binary not found")]
    NoBinary,
    #[error("station {0:?} has no stream url")]
    NoUrls(String),
    #[error("failed to spawn player: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("player is gone")]
    Closed,
}

pub trait Pipeline {
    fn set_uri(&mut self, uri: &str) -> Result<(), PipelineError>;
    fn set_state(&mut self, state: PipelineState) -> Result<StateChangeResult, PipelineError>;
    fn query_state(&self) -> StateQuery;
    /// Start delivering bus messages to `sink`.  One watch per pipeline.
    fn watch(&mut self, sink: BusSink) -> Result<WatchId, PipelineError>;
    fn unwatch(&mut self, id: WatchId);
}

pub trait PipelineFactory {
    type Pipeline: Pipeline;

    /// Construct a pipeline.  `name` only labels logs.
    fn create(&mut self, name: &str) -> Result<Self::Pipeline, PipelineError>;
}
