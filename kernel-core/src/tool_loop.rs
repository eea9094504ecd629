use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};
use turnstile_kernel_protocol::{
    ConversationItem, EventMsg, FunctionCallOutputItem, HistoryItem, OutputStatus, ToolCallEvent,
    ToolDeclaration, ToolErrorEvent, ToolResultEvent, TurnCompletedEvent,
};

use crate::conversation::Conversation;
use crate::dispatch::{ToolDispatcher, ToolError};
use crate::driver::{
    publish, run_turn, EventSource, TurnError, TurnFailure, TurnOptions, TurnRequest,
};
use crate::reducer::PendingCall;

pub const DEFAULT_MAX_ROUNDS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    pub max_rounds: usize,
    pub stream_idle_timeout: Option<Duration>,
    pub strict_protocol: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            stream_idle_timeout: None,
            strict_protocol: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopRequest {
    pub tools: Vec<ToolDeclaration>,
    pub reasoning_enabled: bool,
    /// Overrides `LoopConfig::max_rounds` for this request.
    pub max_rounds: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopOutcome {
    pub rounds: u64,
    pub last_agent_message: Option<String>,
    pub protocol_violations: u64,
}

#[derive(Debug, Error)]
pub enum LoopError {
    #[error(transparent)]
    Turn(#[from] TurnError),
    #[error(transparent)]
    Dispatch(ToolError),
    #[error("tool loop exceeded {max_rounds} rounds")]
    RoundsExceeded { max_rounds: usize },
}

/// Drives turns until one finishes without a function call to answer.
#[derive(Clone)]
pub struct ToolLoop {
    source: Arc<dyn EventSource>,
    dispatcher: Arc<dyn ToolDispatcher>,
    config: LoopConfig,
}

impl ToolLoop {
    pub fn new(
        source: Arc<dyn EventSource>,
        dispatcher: Arc<dyn ToolDispatcher>,
        config: LoopConfig,
    ) -> Self {
        Self {
            source,
            dispatcher,
            config,
        }
    }

    pub async fn run(
        &self,
        conversation: &mut Conversation,
        request: &LoopRequest,
        progress_tx: Option<&UnboundedSender<EventMsg>>,
    ) -> Result<LoopOutcome, LoopError> {
        let max_rounds = request.max_rounds.unwrap_or(self.config.max_rounds).max(1);
        let options = TurnOptions {
            idle_timeout: self.config.stream_idle_timeout,
            strict_protocol: self.config.strict_protocol,
        };
        let mut protocol_violations = 0_u64;

        for round in 1..=max_rounds {
            let turn_request = TurnRequest {
                history: conversation.history().to_vec(),
                tools: request.tools.clone(),
                reasoning_enabled: request.reasoning_enabled,
            };
            info!(
                round,
                history_items = turn_request.history.len(),
                "starting model turn"
            );
            let outcome = match run_turn(
                self.source.as_ref(),
                &turn_request,
                conversation,
                options,
                progress_tx,
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(TurnFailure { error, pending }) => {
                    // Calls finalized before the failure are already in history.
                    if let Err(dispatch_error) =
                        self.answer_calls(conversation, pending, progress_tx).await
                    {
                        warn!(error = %dispatch_error, "could not answer calls of a failed turn");
                    }
                    return Err(error.into());
                }
            };

            protocol_violations += outcome.violations.len() as u64;
            emit_progress_event(
                progress_tx,
                EventMsg::TurnCompleted(TurnCompletedEvent {
                    round: round as u64,
                    events_applied: outcome.events_applied,
                    pending_tool_calls: outcome.pending.len() as u64,
                    protocol_violations: outcome.violations.len() as u64,
                }),
            );

            if outcome.pending.is_empty() {
                return Ok(LoopOutcome {
                    rounds: round as u64,
                    last_agent_message: conversation.last_agent_message(),
                    protocol_violations,
                });
            }
            self.answer_calls(conversation, outcome.pending, progress_tx)
                .await?;
        }

        warn!(max_rounds, "tool loop stopped at round limit");
        Err(LoopError::RoundsExceeded { max_rounds })
    }

    /// Answers queued calls in order. When the dispatcher goes away, every
    /// call still waiting gets an `incomplete` output so history stays paired.
    async fn answer_calls(
        &self,
        conversation: &mut Conversation,
        pending: Vec<PendingCall>,
        progress_tx: Option<&UnboundedSender<EventMsg>>,
    ) -> Result<(), LoopError> {
        let mut calls = pending.into_iter();
        while let Some(call) = calls.next() {
            let Err(unavailable) = self.answer_call(conversation, call.clone(), progress_tx).await
            else {
                continue;
            };
            let reason = unavailable.to_string();
            for waiting in std::iter::once(call).chain(calls) {
                match waiting {
                    PendingCall::Dispatch { index } => {
                        abandon_call(conversation, index, &reason, progress_tx);
                    }
                    rejected @ PendingCall::Rejected { .. } => {
                        let _ = self.answer_call(conversation, rejected, progress_tx).await;
                    }
                }
            }
            return Err(LoopError::Dispatch(unavailable));
        }
        Ok(())
    }

    /// Runs (or refuses) one queued call and appends its output to history.
    /// Only an unreachable dispatcher is returned as an error; nothing is
    /// recorded for the call in that case.
    async fn answer_call(
        &self,
        conversation: &mut Conversation,
        call: PendingCall,
        progress_tx: Option<&UnboundedSender<EventMsg>>,
    ) -> Result<(), ToolError> {
        let index = call.index();
        let Some(ConversationItem::ToolCall(item)) = conversation.item(index) else {
            return Ok(());
        };
        let call_id = item.call_id.clone().unwrap_or_else(|| item.id.clone());
        let tool_name = item.name.clone().unwrap_or_default();
        let arguments = item.parsed_arguments.clone();
        let recorded_output = item.output.clone();

        let (output, status) = match call {
            PendingCall::Rejected { error, .. } => {
                emit_progress_event(
                    progress_tx,
                    EventMsg::ToolError(ToolErrorEvent {
                        call_id: call_id.clone(),
                        tool_name: tool_name.clone(),
                        error: error.clone(),
                        duration_ms: 0,
                    }),
                );
                let output =
                    recorded_output.unwrap_or_else(|| json!({ "error": error }).to_string());
                (output, OutputStatus::Incomplete)
            }
            PendingCall::Dispatch { .. } => {
                emit_progress_event(
                    progress_tx,
                    EventMsg::ToolCall(ToolCallEvent {
                        call_id: call_id.clone(),
                        tool_name: tool_name.clone(),
                        input: arguments.clone(),
                    }),
                );
                let started_at = Instant::now();
                let result = self.dispatcher.dispatch(&tool_name, &arguments).await;
                let duration_ms = started_at.elapsed().as_millis() as u64;
                match result {
                    Ok(result) => {
                        emit_progress_event(
                            progress_tx,
                            EventMsg::ToolResult(ToolResultEvent {
                                call_id: call_id.clone(),
                                tool_name: tool_name.clone(),
                                output: result.clone(),
                                duration_ms,
                            }),
                        );
                        (result.to_string(), OutputStatus::Completed)
                    }
                    Err(error) => {
                        emit_progress_event(
                            progress_tx,
                            EventMsg::ToolError(ToolErrorEvent {
                                call_id: call_id.clone(),
                                tool_name: tool_name.clone(),
                                error: error.to_string(),
                                duration_ms,
                            }),
                        );
                        match error {
                            ToolError::Execution { message, .. } => {
                                warn!(tool = %tool_name, %message, "tool execution failed");
                                (
                                    json!({ "error": message }).to_string(),
                                    OutputStatus::Completed,
                                )
                            }
                            unavailable @ ToolError::Unavailable { .. } => return Err(unavailable),
                        }
                    }
                }
            }
        };

        record_output(conversation, index, call_id, output, status, progress_tx);
        Ok(())
    }
}

/// Closes a call that will never run with an `incomplete` error output.
fn abandon_call(
    conversation: &mut Conversation,
    index: usize,
    reason: &str,
    progress_tx: Option<&UnboundedSender<EventMsg>>,
) {
    let Some(ConversationItem::ToolCall(item)) = conversation.item(index) else {
        return;
    };
    let call_id = item.call_id.clone().unwrap_or_else(|| item.id.clone());
    let output = json!({ "error": reason }).to_string();
    record_output(
        conversation,
        index,
        call_id,
        output,
        OutputStatus::Incomplete,
        progress_tx,
    );
}

fn record_output(
    conversation: &mut Conversation,
    index: usize,
    call_id: String,
    output: String,
    status: OutputStatus,
    progress_tx: Option<&UnboundedSender<EventMsg>>,
) {
    let mut changes = Vec::with_capacity(2);
    if let Some(ConversationItem::ToolCall(item)) = conversation.item_mut(index) {
        if item.output.as_deref() != Some(output.as_str()) {
            item.output = Some(output.clone());
            changes.push(conversation.touch_item(index));
        }
    }
    changes.push(
        conversation.append_history(HistoryItem::FunctionCallOutput(FunctionCallOutputItem {
            call_id,
            output,
            status,
        })),
    );
    publish(conversation, changes, progress_tx);
}

fn emit_progress_event(progress_tx: Option<&UnboundedSender<EventMsg>>, event: EventMsg) {
    if let Some(tx) = progress_tx {
        let _ = tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::tests::{
        assistant_text_turn, function_call_turn, interrupted_call_turn, ScriptedSource,
    };
    use crate::driver::TransportError;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use turnstile_kernel_protocol::ToolCallStatus;

    struct RecordingDispatcher {
        calls: Mutex<Vec<(String, Value)>>,
        result: Result<Value, ToolError>,
    }

    impl RecordingDispatcher {
        fn returning(result: Result<Value, ToolError>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                result,
            })
        }

        fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl ToolDispatcher for RecordingDispatcher {
        async fn dispatch(&self, tool_name: &str, arguments: &Value) -> Result<Value, ToolError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((tool_name.to_string(), arguments.clone()));
            self.result.clone()
        }
    }

    fn conversation_with_user(text: &str) -> Conversation {
        let mut conversation = Conversation::new();
        conversation.push_user_text(text);
        conversation
    }

    fn last_output(conversation: &Conversation) -> Option<&FunctionCallOutputItem> {
        conversation.history().iter().rev().find_map(|item| match item {
            HistoryItem::FunctionCallOutput(output) => Some(output),
            _ => None,
        })
    }

    #[tokio::test]
    async fn weather_call_dispatches_once_then_continues_with_its_output() {
        let source = Arc::new(ScriptedSource::new(vec![
            function_call_turn("1", "get_weather", &["{\"ci", "ty\":\"Seoul\"}"]),
            assistant_text_turn("msg_1", "It is sunny in Seoul."),
        ]));
        let dispatcher = RecordingDispatcher::returning(Ok(json!({"forecast": "sunny"})));
        let tool_loop = ToolLoop::new(source.clone(), dispatcher.clone(), LoopConfig::default());
        let mut conversation = conversation_with_user("weather in Seoul?");

        let outcome = tool_loop
            .run(&mut conversation, &LoopRequest::default(), None)
            .await
            .expect("tool loop");

        assert_eq!(outcome.rounds, 2);
        assert_eq!(
            outcome.last_agent_message.as_deref(),
            Some("It is sunny in Seoul.")
        );
        assert_eq!(
            dispatcher.calls(),
            vec![("get_weather".to_string(), json!({"city": "Seoul"}))]
        );

        let requests = source.requests.lock().expect("requests lock").clone();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].history.len(), 1);
        // call + its output
        assert_eq!(requests[1].history.len(), 3);
        assert!(matches!(
            requests[1].history.last(),
            Some(HistoryItem::FunctionCallOutput(output))
                if output.call_id == "call_1"
                    && output.output == "{\"forecast\":\"sunny\"}"
                    && output.status == OutputStatus::Completed
        ));
        assert!(matches!(
            conversation.item(1),
            Some(ConversationItem::ToolCall(call))
                if call.status == ToolCallStatus::Completed
                    && call.output.as_deref() == Some("{\"forecast\":\"sunny\"}")
        ));
        assert_eq!(conversation.history().len(), 4);
    }

    #[tokio::test]
    async fn tool_execution_error_is_recorded_as_output() {
        let source = Arc::new(ScriptedSource::new(vec![
            function_call_turn("1", "get_weather", &["{}"]),
            assistant_text_turn("msg_1", "Sorry, no weather."),
        ]));
        let dispatcher = RecordingDispatcher::returning(Err(ToolError::Execution {
            tool_name: "get_weather".to_string(),
            message: "upstream 503".to_string(),
        }));
        let tool_loop = ToolLoop::new(source, dispatcher, LoopConfig::default());
        let mut conversation = conversation_with_user("weather?");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let outcome = tool_loop
            .run(&mut conversation, &LoopRequest::default(), Some(&tx))
            .await
            .expect("tool loop continues");
        assert_eq!(outcome.rounds, 2);

        let output = last_output(&conversation).expect("function call output");
        assert_eq!(output.output, "{\"error\":\"upstream 503\"}");
        assert_eq!(output.status, OutputStatus::Completed);

        drop(tx);
        let mut saw_tool_error = false;
        while let Some(msg) = rx.recv().await {
            if let EventMsg::ToolError(event) = msg {
                assert_eq!(event.call_id, "call_1");
                saw_tool_error = true;
            }
        }
        assert!(saw_tool_error);
    }

    #[tokio::test]
    async fn unreachable_dispatcher_stops_the_loop() {
        let source = Arc::new(ScriptedSource::new(vec![function_call_turn(
            "1",
            "get_weather",
            &["{}"],
        )]));
        let dispatcher = RecordingDispatcher::returning(Err(ToolError::Unavailable {
            message: "connection refused".to_string(),
        }));
        let tool_loop = ToolLoop::new(source.clone(), dispatcher, LoopConfig::default());
        let mut conversation = conversation_with_user("weather?");

        let error = tool_loop
            .run(&mut conversation, &LoopRequest::default(), None)
            .await
            .expect_err("dispatcher unavailable");
        assert!(matches!(
            error,
            LoopError::Dispatch(ToolError::Unavailable { .. })
        ));
        assert_eq!(source.request_count(), 1);
        let output = last_output(&conversation).expect("abandoned call output");
        assert_eq!(output.call_id, "call_1");
        assert_eq!(output.status, OutputStatus::Incomplete);
        assert!(output.output.contains("connection refused"));
    }

    #[tokio::test]
    async fn call_finished_before_a_broken_stream_is_answered_for_the_next_run() {
        let source = Arc::new(ScriptedSource::from_results(vec![
            interrupted_call_turn("1", "get_weather", "{\"city\":\"Seoul\"}"),
            assistant_text_turn("msg_1", "It is sunny in Seoul.")
                .into_iter()
                .map(Ok)
                .collect(),
        ]));
        let dispatcher = RecordingDispatcher::returning(Ok(json!({"forecast": "sunny"})));
        let tool_loop = ToolLoop::new(source.clone(), dispatcher.clone(), LoopConfig::default());
        let mut conversation = conversation_with_user("weather in Seoul?");

        let error = tool_loop
            .run(&mut conversation, &LoopRequest::default(), None)
            .await
            .expect_err("broken stream");
        assert!(matches!(
            error,
            LoopError::Turn(TurnError::Transport(TransportError::Read(_)))
        ));
        assert_eq!(dispatcher.calls().len(), 1);

        let outcome = tool_loop
            .run(&mut conversation, &LoopRequest::default(), None)
            .await
            .expect("second run");
        assert_eq!(
            outcome.last_agent_message.as_deref(),
            Some("It is sunny in Seoul.")
        );
        assert_eq!(dispatcher.calls().len(), 1);

        let requests = source.requests.lock().expect("requests lock").clone();
        assert_eq!(requests.len(), 2);
        assert!(matches!(
            &requests[1].history[..],
            [
                HistoryItem::Message(_),
                HistoryItem::ToolCall(call),
                HistoryItem::FunctionCallOutput(output),
            ] if call.call_id.as_deref() == Some("call_1")
                && output.call_id == "call_1"
                && output.output == "{\"forecast\":\"sunny\"}"
        ));
    }

    #[tokio::test]
    async fn rejected_arguments_are_answered_without_dispatch() {
        let source = Arc::new(ScriptedSource::new(vec![
            function_call_turn("1", "get_weather", &["{\"city\":"]),
            assistant_text_turn("msg_1", "Let me retry."),
        ]));
        let dispatcher = RecordingDispatcher::returning(Ok(json!(null)));
        let tool_loop = ToolLoop::new(source, dispatcher.clone(), LoopConfig::default());
        let mut conversation = conversation_with_user("weather?");

        tool_loop
            .run(&mut conversation, &LoopRequest::default(), None)
            .await
            .expect("tool loop");

        assert!(dispatcher.calls().is_empty());
        let output = last_output(&conversation).expect("failure output");
        assert_eq!(output.status, OutputStatus::Incomplete);
        assert!(output.output.contains("invalid function arguments"));
        assert!(matches!(
            conversation.item(1),
            Some(ConversationItem::ToolCall(call)) if call.status == ToolCallStatus::Failed
        ));
    }

    #[tokio::test]
    async fn round_limit_is_enforced() {
        let source = Arc::new(ScriptedSource::new(vec![
            function_call_turn("1", "loop", &["{}"]),
            function_call_turn("2", "loop", &["{}"]),
            function_call_turn("3", "loop", &["{}"]),
        ]));
        let dispatcher = RecordingDispatcher::returning(Ok(json!("again")));
        let tool_loop = ToolLoop::new(
            source.clone(),
            dispatcher.clone(),
            LoopConfig {
                max_rounds: 5,
                ..LoopConfig::default()
            },
        );
        let mut conversation = conversation_with_user("go");

        let error = tool_loop
            .run(
                &mut conversation,
                &LoopRequest {
                    max_rounds: Some(2),
                    ..LoopRequest::default()
                },
                None,
            )
            .await
            .expect_err("round limit");
        assert!(matches!(error, LoopError::RoundsExceeded { max_rounds: 2 }));
        assert_eq!(source.request_count(), 2);
        assert_eq!(dispatcher.calls().len(), 2);
    }

    #[tokio::test]
    async fn transport_errors_propagate_out_of_the_loop() {
        let source = Arc::new(ScriptedSource::with_results(vec![Err(
            TransportError::HttpStatus {
                status: 429,
                body: "slow down".to_string(),
            },
        )]));
        let dispatcher = RecordingDispatcher::returning(Ok(json!(null)));
        let tool_loop = ToolLoop::new(source, dispatcher, LoopConfig::default());

        let error = tool_loop
            .run(&mut conversation_with_user("hi"), &LoopRequest::default(), None)
            .await
            .expect_err("transport error");
        assert!(matches!(
            error,
            LoopError::Turn(TurnError::Transport(TransportError::HttpStatus {
                status: 429,
                ..
            }))
        ));
    }
}
