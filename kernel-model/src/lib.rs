use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{future, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};
use turnstile_kernel_config::LocalModelConfig;
use turnstile_kernel_core::{
    EventSource, EventStream, ToolDispatcher, ToolError, TransportError, TurnRequest,
};

mod protocol;

use protocol::request::build_responses_request_payload;
use protocol::response::decode_sse_frame;
use protocol::transport::{post_tool_execution, send_responses_http};

const MAX_AUTHENTICATION_RETRIES: u8 = 2;
const AUTHENTICATION_RETRY_BACKOFF_MS: u64 = 200;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("responses api returned non-success status: {status}; body: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("invalid responses payload: {0}")]
    ParsePayload(#[from] serde_json::Error),
    #[error("responses stream frame carries no event type: {data}")]
    MissingEventType { data: String },
}

impl From<ModelError> for TransportError {
    fn from(error: ModelError) -> Self {
        match error {
            ModelError::HttpStatus { status, body } => TransportError::HttpStatus { status, body },
            ModelError::Request(error) => TransportError::Open(error.to_string()),
            other => TransportError::Read(other.to_string()),
        }
    }
}

/// Event source backed by a streaming responses endpoint.
#[derive(Clone)]
pub struct ResponsesEventSource {
    config: LocalModelConfig,
    client: reqwest::Client,
}

impl ResponsesEventSource {
    pub fn new(config: LocalModelConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn open_response(&self, payload: &Value) -> Result<reqwest::Response, ModelError> {
        let mut authentication_retry_count: u8 = 0;

        loop {
            match send_responses_http(
                &self.client,
                &self.config.base_url,
                &self.config.api_key,
                payload,
            )
            .await
            {
                Ok(response) => return Ok(response),
                Err(ModelError::HttpStatus { status, body })
                    if authentication_retry_count < MAX_AUTHENTICATION_RETRIES
                        && should_retry_authentication_failure(status, body.as_str()) =>
                {
                    authentication_retry_count += 1;
                    warn!(
                        status,
                        attempt = authentication_retry_count,
                        "responses api reported a transient authentication failure; retrying"
                    );
                    sleep(Duration::from_millis(
                        AUTHENTICATION_RETRY_BACKOFF_MS * u64::from(authentication_retry_count),
                    ))
                    .await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[async_trait]
impl EventSource for ResponsesEventSource {
    async fn open_turn(&self, request: &TurnRequest) -> Result<EventStream, TransportError> {
        let payload = build_responses_request_payload(&self.config, request);
        debug!(
            model = %self.config.model,
            history_items = request.history.len(),
            tools = request.tools.len(),
            "opening responses stream"
        );
        let response = self.open_response(&payload).await?;

        let stream = response
            .bytes_stream()
            .eventsource()
            .filter_map(|frame| {
                future::ready(match frame {
                    Ok(event) => decode_sse_frame(&event.event, &event.data)
                        .map_err(TransportError::from)
                        .transpose(),
                    Err(error) => Some(Err(TransportError::Read(error.to_string()))),
                })
            });
        Ok(stream.boxed())
    }
}

/// Dispatcher that executes tools through the local tool daemon.
#[derive(Clone)]
pub struct HttpToolDispatcher {
    daemon_url: String,
    agent_id: String,
    client: reqwest::Client,
}

impl HttpToolDispatcher {
    pub fn new(daemon_url: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            daemon_url: daemon_url.into(),
            agent_id: agent_id.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &LocalModelConfig) -> Self {
        Self::new(config.tool_daemon_url.clone(), config.tool_agent_id.clone())
    }
}

#[async_trait]
impl ToolDispatcher for HttpToolDispatcher {
    async fn dispatch(&self, tool_name: &str, arguments: &Value) -> Result<Value, ToolError> {
        let request_payload = json!({
            "agentId": self.agent_id,
            "toolName": tool_name,
            "input": arguments,
        });

        let (status, body) = post_tool_execution(&self.client, &self.daemon_url, &request_payload)
            .await
            .map_err(|error| ToolError::Unavailable {
                message: error.to_string(),
            })?;
        let payload = serde_json::from_slice::<Value>(&body).ok();

        if !status.is_success() {
            let message = payload
                .as_ref()
                .and_then(|payload| payload.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| String::from_utf8_lossy(&body).to_string());
            return Err(ToolError::Execution {
                tool_name: tool_name.to_string(),
                message,
            });
        }

        let payload = payload.ok_or_else(|| ToolError::Execution {
            tool_name: tool_name.to_string(),
            message: "tool daemon returned a non-json body".to_string(),
        })?;

        if let Some(error_message) = payload.get("error").and_then(Value::as_str) {
            return Err(ToolError::Execution {
                tool_name: tool_name.to_string(),
                message: error_message.to_string(),
            });
        }

        Ok(payload.get("result").cloned().unwrap_or(Value::Null))
    }
}

fn should_retry_authentication_failure(status: u16, body: &str) -> bool {
    if status != 500 && status != 401 && status != 403 {
        return false;
    }
    let normalized = body.to_ascii_lowercase();
    normalized.contains("authentication failed")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::StreamExt;
    use mockito::{Matcher, Server};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;
    use turnstile_kernel_config::LocalModelConfig;
    use turnstile_kernel_core::{
        run_turn, Conversation, EventSource, LoopConfig, LoopRequest, ToolDispatcher, ToolError,
        ToolLoop, TransportError, TurnOptions, TurnRequest,
    };
    use turnstile_kernel_protocol::{
        EventMsg, HistoryItem, MessageItem, ToolDeclaration, ToolSpec, END_OF_STREAM,
    };

    use super::{should_retry_authentication_failure, HttpToolDispatcher, ResponsesEventSource};

    fn test_config(server_url: String) -> LocalModelConfig {
        LocalModelConfig {
            base_url: server_url.clone(),
            env_key: "TEST_KEY".to_string(),
            api_key: "test-key".to_string(),
            model: "gpt-test".to_string(),
            tool_daemon_url: server_url,
            tool_agent_id: "turnstile".to_string(),
            developer_prompt: None,
            max_output_tokens: 8000,
            reasoning_effort: "low".to_string(),
            reasoning_summary: "auto".to_string(),
        }
    }

    fn hello_request() -> TurnRequest {
        TurnRequest {
            history: vec![HistoryItem::Message(MessageItem::user_text("hello"))],
            tools: Vec::new(),
            reasoning_enabled: false,
        }
    }

    fn weather_tool() -> ToolDeclaration {
        ToolDeclaration::Function(ToolSpec {
            name: "get_weather".to_string(),
            description: Some("Look up current weather".to_string()),
            input_schema: Some(json!({
                "type": "object",
                "properties": { "location": { "type": "string" } },
                "required": ["location"],
            })),
        })
    }

    fn drain_progress_events(progress_rx: &mut UnboundedReceiver<EventMsg>) -> Vec<EventMsg> {
        let mut events = Vec::new();
        while let Ok(event) = progress_rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn authentication_failures_are_only_retried_for_matching_statuses() {
        assert!(should_retry_authentication_failure(
            500,
            r#"{"error":{"message":"Authentication Failed"}}"#
        ));
        assert!(should_retry_authentication_failure(401, "authentication failed"));
        assert!(!should_retry_authentication_failure(400, "authentication failed"));
        assert!(!should_retry_authentication_failure(500, "internal error"));
    }

    #[tokio::test]
    async fn open_turn_streams_envelopes_in_arrival_order() {
        let mut server = Server::new_async().await;

        let response_mock = server
            .mock("POST", "/v1/responses")
            .match_header("authorization", "Bearer test-key")
            .match_header("accept", "text/event-stream")
            .match_body(Matcher::Regex(r#""stream":true"#.to_string()))
            .match_body(Matcher::Regex(r#""model":"gpt-test""#.to_string()))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(concat!(
                "event: response.output_text.delta\n",
                "data: {\"type\":\"response.output_text.delta\",\"item_id\":\"msg_1\",\"delta\":\"Hel\"}\n\n",
                "data: {\"event\":\"response.output_text.delta\",\"data\":{\"item_id\":\"msg_1\",\"delta\":\"lo\"}}\n\n",
                "event: response.completed\n",
                "data: {\"response\":{\"id\":\"resp_1\"}}\n\n",
                "data: [DONE]\n\n"
            ))
            .expect(1)
            .create_async()
            .await;

        let source = ResponsesEventSource::new(test_config(server.url()));
        let envelopes = source
            .open_turn(&hello_request())
            .await
            .expect("open turn")
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .expect("envelopes");

        let tags = envelopes
            .iter()
            .map(|envelope| envelope.event.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            tags,
            vec![
                "response.output_text.delta",
                "response.output_text.delta",
                "response.completed",
                END_OF_STREAM,
            ]
        );
        assert_eq!(envelopes[1].data, json!({"item_id": "msg_1", "delta": "lo"}));

        response_mock.assert_async().await;
    }

    #[tokio::test]
    async fn run_turn_assembles_streamed_message() {
        let mut server = Server::new_async().await;

        let response_mock = server
            .mock("POST", "/v1/responses")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(concat!(
                "data: {\"type\":\"response.output_item.added\",\"output_index\":0,\"item\":{\"type\":\"message\",\"id\":\"msg_1\",\"role\":\"assistant\",\"content\":[]}}\n\n",
                "data: {\"type\":\"response.output_text.delta\",\"item_id\":\"msg_1\",\"content_index\":0,\"delta\":\"Hello\"}\n\n",
                "data: {\"type\":\"response.output_text.delta\",\"item_id\":\"msg_1\",\"content_index\":0,\"delta\":\" world\"}\n\n",
                "data: {\"type\":\"response.output_item.done\",\"output_index\":0,\"item\":{\"type\":\"message\",\"id\":\"msg_1\",\"role\":\"assistant\",\"content\":[{\"type\":\"output_text\",\"text\":\"Hello world\",\"annotations\":[]}]}}\n\n",
                "data: {\"type\":\"response.completed\",\"response\":{\"id\":\"resp_1\"}}\n\n"
            ))
            .expect(1)
            .create_async()
            .await;

        let source = ResponsesEventSource::new(test_config(server.url()));
        let mut conversation = Conversation::new();
        let _ = conversation.push_user_text("hello");
        let request = TurnRequest {
            history: conversation.history().to_vec(),
            tools: Vec::new(),
            reasoning_enabled: false,
        };

        let outcome = run_turn(
            &source,
            &request,
            &mut conversation,
            TurnOptions::default(),
            None,
        )
        .await
        .expect("run turn");

        assert!(outcome.pending.is_empty());
        assert_eq!(
            conversation.last_agent_message().as_deref(),
            Some("Hello world")
        );
        assert_eq!(conversation.history().len(), 2);

        response_mock.assert_async().await;
    }

    #[tokio::test]
    async fn retries_on_transient_authentication_failure() {
        let mut server = Server::new_async().await;

        let first_response_mock = server
            .mock("POST", "/v1/responses")
            .match_header("authorization", "Bearer test-key")
            .with_status(500)
            .with_header("content-type", "application/json")
            .with_body(json!({ "error": { "message": "Authentication failed" } }).to_string())
            .expect(1)
            .create_async()
            .await;

        let second_response_mock = server
            .mock("POST", "/v1/responses")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body("data: [DONE]\n\n")
            .expect(1)
            .create_async()
            .await;

        let source = ResponsesEventSource::new(test_config(server.url()));
        let envelopes = source
            .open_turn(&hello_request())
            .await
            .expect("open turn should retry on transient auth failure")
            .collect::<Vec<_>>()
            .await;
        assert_eq!(envelopes.len(), 1);

        first_response_mock.assert_async().await;
        second_response_mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_reported_without_retry() {
        let mut server = Server::new_async().await;

        let response_mock = server
            .mock("POST", "/v1/responses")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(json!({ "error": { "message": "bad input" } }).to_string())
            .expect(1)
            .create_async()
            .await;

        let source = ResponsesEventSource::new(test_config(server.url()));
        let result = source.open_turn(&hello_request()).await;
        match result {
            Err(TransportError::HttpStatus { status, body }) => {
                assert_eq!(status, 400);
                assert!(body.contains("bad input"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected http status error"),
        }

        response_mock.assert_async().await;
    }

    #[tokio::test]
    async fn http_dispatcher_posts_to_tool_daemon() {
        let mut server = Server::new_async().await;

        let tool_execute_mock = server
            .mock("POST", "/api/v1/tools/execute")
            .match_body(Matcher::Regex(r#""toolName":"get_weather""#.to_string()))
            .match_body(Matcher::Regex(r#""agentId":"turnstile""#.to_string()))
            .match_body(Matcher::Regex(r#""location":"Seoul""#.to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "success": true, "result": { "temp_c": 21 } }).to_string())
            .expect(1)
            .create_async()
            .await;

        let dispatcher = HttpToolDispatcher::from_config(&test_config(server.url()));
        let output = dispatcher
            .dispatch("get_weather", &json!({ "location": "Seoul" }))
            .await
            .expect("tool result");
        assert_eq!(output, json!({ "temp_c": 21 }));

        tool_execute_mock.assert_async().await;
    }

    #[tokio::test]
    async fn http_dispatcher_maps_daemon_failures_to_execution_errors() {
        let mut server = Server::new_async().await;

        let failing_mock = server
            .mock("POST", "/api/v1/tools/execute")
            .match_body(Matcher::Regex(r#""toolName":"shell""#.to_string()))
            .with_status(500)
            .with_header("content-type", "application/json")
            .with_body(json!({ "error": "permission denied" }).to_string())
            .expect(1)
            .create_async()
            .await;

        let soft_error_mock = server
            .mock("POST", "/api/v1/tools/execute")
            .match_body(Matcher::Regex(r#""toolName":"lookup""#.to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "success": false, "error": "not found" }).to_string())
            .expect(1)
            .create_async()
            .await;

        let dispatcher = HttpToolDispatcher::from_config(&test_config(server.url()));
        assert_eq!(
            dispatcher.dispatch("shell", &json!({})).await,
            Err(ToolError::Execution {
                tool_name: "shell".to_string(),
                message: "permission denied".to_string(),
            })
        );
        assert_eq!(
            dispatcher.dispatch("lookup", &json!({})).await,
            Err(ToolError::Execution {
                tool_name: "lookup".to_string(),
                message: "not found".to_string(),
            })
        );

        failing_mock.assert_async().await;
        soft_error_mock.assert_async().await;
    }

    #[tokio::test]
    async fn http_dispatcher_reports_unreachable_daemon_as_unavailable() {
        let dispatcher = HttpToolDispatcher::new("http://127.0.0.1:1", "turnstile");
        let result = dispatcher.dispatch("get_weather", &json!({})).await;
        assert!(matches!(result, Err(ToolError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn tool_loop_dispatches_streamed_call_and_replays_output() {
        let mut server = Server::new_async().await;

        let first_response_mock = server
            .mock("POST", "/v1/responses")
            .match_header("authorization", "Bearer test-key")
            .match_body(Matcher::Regex(r#""tool_choice":"auto""#.to_string()))
            .match_body(Matcher::Regex(r#""name":"get_weather""#.to_string()))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(concat!(
                "data: {\"type\":\"response.output_item.added\",\"output_index\":0,\"item\":{\"type\":\"function_call\",\"id\":\"fc_1\",\"call_id\":\"call_1\",\"name\":\"get_weather\",\"arguments\":\"\",\"status\":\"in_progress\"}}\n\n",
                "data: {\"type\":\"response.function_call_arguments.delta\",\"item_id\":\"fc_1\",\"delta\":\"{\\\"location\\\":\"}\n\n",
                "data: {\"type\":\"response.function_call_arguments.delta\",\"item_id\":\"fc_1\",\"delta\":\"\\\"Seoul\\\"}\"}\n\n",
                "data: {\"type\":\"response.function_call_arguments.done\",\"item_id\":\"fc_1\",\"arguments\":\"{\\\"location\\\":\\\"Seoul\\\"}\"}\n\n",
                "data: {\"type\":\"response.output_item.done\",\"output_index\":0,\"item\":{\"type\":\"function_call\",\"id\":\"fc_1\",\"call_id\":\"call_1\",\"name\":\"get_weather\",\"arguments\":\"{\\\"location\\\":\\\"Seoul\\\"}\",\"status\":\"completed\"}}\n\n",
                "data: {\"type\":\"response.completed\",\"response\":{\"id\":\"resp_1\"}}\n\n"
            ))
            .expect(1)
            .create_async()
            .await;

        let tool_execute_mock = server
            .mock("POST", "/api/v1/tools/execute")
            .match_body(Matcher::Regex(r#""toolName":"get_weather""#.to_string()))
            .match_body(Matcher::Regex(r#""location":"Seoul""#.to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "success": true, "result": { "temp_c": 21 } }).to_string())
            .expect(1)
            .create_async()
            .await;

        let second_response_mock = server
            .mock("POST", "/v1/responses")
            .match_body(Matcher::Regex(r#""type":"function_call_output""#.to_string()))
            .match_body(Matcher::Regex(r#""call_id":"call_1""#.to_string()))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(concat!(
                "data: {\"event\":\"response.output_text.delta\",\"data\":{\"item_id\":\"msg_2\",\"delta\":\"It is 21C in Seoul.\"}}\n\n",
                "data: {\"event\":\"response.output_item.done\",\"data\":{\"item\":{\"type\":\"message\",\"id\":\"msg_2\",\"role\":\"assistant\",\"content\":[{\"type\":\"output_text\",\"text\":\"It is 21C in Seoul.\"}]}}}\n\n",
                "data: [DONE]\n\n"
            ))
            .expect(1)
            .create_async()
            .await;

        let config = test_config(server.url());
        let tool_loop = ToolLoop::new(
            Arc::new(ResponsesEventSource::new(config.clone())),
            Arc::new(HttpToolDispatcher::from_config(&config)),
            LoopConfig::default(),
        );
        let mut conversation = Conversation::new();
        let _ = conversation.push_user_text("What is the weather in Seoul?");
        let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel::<EventMsg>();

        let outcome = tool_loop
            .run(
                &mut conversation,
                &LoopRequest {
                    tools: vec![weather_tool()],
                    reasoning_enabled: false,
                    max_rounds: None,
                },
                Some(&progress_tx),
            )
            .await
            .expect("tool loop");

        assert_eq!(outcome.rounds, 2);
        assert_eq!(
            outcome.last_agent_message.as_deref(),
            Some("It is 21C in Seoul.")
        );
        let outputs = conversation
            .history()
            .iter()
            .filter_map(|item| match item {
                HistoryItem::FunctionCallOutput(output) => Some(output),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].call_id, "call_1");
        assert_eq!(outputs[0].output, r#"{"temp_c":21}"#);

        let progress_events = drain_progress_events(&mut progress_rx);
        let tool_result = progress_events.iter().find_map(|event| match event {
            EventMsg::ToolResult(result) => Some(result),
            _ => None,
        });
        assert_eq!(
            tool_result.map(|result| result.tool_name.as_str()),
            Some("get_weather")
        );

        first_response_mock.assert_async().await;
        tool_execute_mock.assert_async().await;
        second_response_mock.assert_async().await;
    }
}
