use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use turnstile_kernel_protocol::{
    EventEnvelope, EventMsg, HistoryItem, StreamEvent, ToolDeclaration,
};

use crate::conversation::{Change, Conversation};
use crate::reducer::{PendingCall, ReducerError, TranscriptReducer};

pub type EventStream = BoxStream<'static, Result<EventEnvelope, TransportError>>;

/// Everything the event source needs to open one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRequest {
    pub history: Vec<HistoryItem>,
    pub tools: Vec<ToolDeclaration>,
    pub reasoning_enabled: bool,
}

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn open_turn(&self, request: &TurnRequest) -> Result<EventStream, TransportError>;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open event stream: {0}")]
    Open(String),
    #[error("event source returned non-success status: {status}; body: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("failed to read event stream: {0}")]
    Read(String),
    #[error("malformed `{event}` payload: {source}")]
    Envelope {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("response failed: {message}")]
    StreamFailed { message: String },
    #[error("no event received within {0:?}")]
    IdleTimeout(Duration),
    #[error("event stream closed before completion")]
    ClosedEarly,
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ReducerError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnOptions {
    pub idle_timeout: Option<Duration>,
    pub strict_protocol: bool,
}

#[derive(Debug, Default)]
pub struct TurnOutcome {
    pub pending: Vec<PendingCall>,
    pub events_applied: u64,
    pub violations: Vec<ReducerError>,
}

/// A turn that ended without its end marker. Calls the reducer had already
/// queued are sealed into history and handed back so they still get answered.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct TurnFailure {
    pub error: TurnError,
    pub pending: Vec<PendingCall>,
}

/// Runs one turn: every envelope is decoded and applied in arrival order
/// until the end marker. Events applied before a failure stay applied.
pub async fn run_turn(
    source: &dyn EventSource,
    request: &TurnRequest,
    conversation: &mut Conversation,
    options: TurnOptions,
    progress_tx: Option<&UnboundedSender<EventMsg>>,
) -> Result<TurnOutcome, TurnFailure> {
    let mut stream = source.open_turn(request).await.map_err(|error| TurnFailure {
        error: error.into(),
        pending: Vec::new(),
    })?;
    let mut reducer = TranscriptReducer::new();
    let mut outcome = TurnOutcome::default();

    let streamed = drain_stream(
        &mut stream,
        &mut reducer,
        conversation,
        options,
        &mut outcome,
        progress_tx,
    )
    .await;

    let (pending, changes) = reducer.finish(conversation);
    publish(conversation, changes, progress_tx);
    if let Err(error) = streamed {
        return Err(TurnFailure { error, pending });
    }
    outcome.pending = pending;
    debug!(
        events_applied = outcome.events_applied,
        pending_tool_calls = outcome.pending.len(),
        "turn stream completed"
    );
    Ok(outcome)
}

async fn drain_stream(
    stream: &mut EventStream,
    reducer: &mut TranscriptReducer,
    conversation: &mut Conversation,
    options: TurnOptions,
    outcome: &mut TurnOutcome,
    progress_tx: Option<&UnboundedSender<EventMsg>>,
) -> Result<(), TurnError> {
    loop {
        let next = match options.idle_timeout {
            Some(idle) => tokio::time::timeout(idle, stream.next())
                .await
                .map_err(|_| TransportError::IdleTimeout(idle))?,
            None => stream.next().await,
        };
        let envelope = match next {
            Some(envelope) => envelope?,
            None => return Err(TransportError::ClosedEarly.into()),
        };

        let tag = envelope.event.clone();
        let event = StreamEvent::decode(envelope)
            .map_err(|source| TransportError::Envelope { event: tag, source })?;
        if event.is_end_of_stream() {
            return Ok(());
        }
        match &event {
            StreamEvent::Failed(failure) => {
                return Err(TransportError::StreamFailed {
                    message: failure.message.clone(),
                }
                .into());
            }
            StreamEvent::Unknown(tag) => {
                debug!(event = %tag, "ignoring unrecognized stream event");
                continue;
            }
            _ => {}
        }

        match reducer.apply(conversation, &event) {
            Ok(changes) => {
                outcome.events_applied += 1;
                publish(conversation, changes, progress_tx);
            }
            Err(violation) => {
                warn!(event = event.tag(), error = %violation, "stream protocol violation");
                if options.strict_protocol {
                    return Err(violation.into());
                }
                outcome.violations.push(violation);
            }
        }
    }
}

pub(crate) fn publish(
    conversation: &Conversation,
    changes: Vec<Change>,
    progress_tx: Option<&UnboundedSender<EventMsg>>,
) {
    let Some(tx) = progress_tx else {
        return;
    };
    for change in changes {
        if let Some(event) = change.to_event(conversation) {
            let _ = tx.send(event);
        }
    }
}
