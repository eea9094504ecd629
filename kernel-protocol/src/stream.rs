use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::items::{Annotation, ContentPart, Role, SummaryTextPart, ToolCallStatus, ToolKind};

/// Tag used by sources that signal the end of a turn without a provider
/// `response.completed` event (e.g. the `[DONE]` SSE sentinel).
pub const END_OF_STREAM: &str = "done";

/// One unit of the streaming protocol, as delivered by an event source.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct EventEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl EventEnvelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn end_of_stream() -> Self {
        Self::new(END_OF_STREAM, Value::Null)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TextDelta {
    pub item_id: String,
    #[serde(default)]
    pub content_index: Option<usize>,
    #[serde(default)]
    pub delta: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AnnotationAdded {
    pub item_id: String,
    #[serde(default)]
    pub content_index: Option<usize>,
    pub annotation: Annotation,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ReasoningSummaryDelta {
    pub item_id: String,
    #[serde(default)]
    pub summary_index: usize,
    #[serde(default)]
    pub delta: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ReasoningSummaryDone {
    pub item_id: String,
    #[serde(default)]
    pub summary_index: usize,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ArgumentsDelta {
    pub item_id: String,
    #[serde(default)]
    pub delta: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ArgumentsDone {
    pub item_id: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchCallEvent {
    pub tool: ToolKind,
    pub item_id: String,
    pub output: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchCallPayload {
    item_id: String,
    #[serde(default)]
    output: Option<Value>,
}

/// Item snapshot carried by `response.output_item.added` / `.done`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    Message {
        id: String,
        #[serde(default)]
        role: Option<Role>,
        #[serde(default)]
        content: Vec<ContentPart>,
    },
    FunctionCall {
        id: String,
        #[serde(default)]
        call_id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        arguments: Option<String>,
        #[serde(default)]
        status: Option<String>,
    },
    WebSearchCall {
        id: String,
        #[serde(default)]
        status: Option<String>,
    },
    FileSearchCall {
        id: String,
        #[serde(default)]
        status: Option<String>,
    },
    Reasoning {
        id: String,
        #[serde(default)]
        summary: Vec<SummaryTextPart>,
    },
    #[serde(other)]
    Unsupported,
}

impl OutputItem {
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Message { id, .. }
            | Self::FunctionCall { id, .. }
            | Self::WebSearchCall { id, .. }
            | Self::FileSearchCall { id, .. }
            | Self::Reasoning { id, .. } => Some(id.as_str()),
            Self::Unsupported => None,
        }
    }

    pub fn status(&self) -> Option<ToolCallStatus> {
        match self {
            Self::FunctionCall { status, .. }
            | Self::WebSearchCall { status, .. }
            | Self::FileSearchCall { status, .. } => {
                status.as_deref().and_then(ToolCallStatus::from_wire)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct OutputItemEvent {
    #[serde(default)]
    pub output_index: Option<u32>,
    pub item: OutputItem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFailure {
    pub message: String,
}

impl StreamFailure {
    fn from_payload(payload: &Value) -> Self {
        let message = payload
            .get("response")
            .and_then(|response| response.get("error"))
            .and_then(|error| error.get("message"))
            .or_else(|| payload.get("error").and_then(|error| error.get("message")))
            .or_else(|| payload.get("message"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
            .unwrap_or_else(|| "event stream reported a failed response".to_string());
        Self { message }
    }
}

/// Closed set of events the transcript reducer understands.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    OutputTextDelta(TextDelta),
    AnnotationAdded(AnnotationAdded),
    ReasoningSummaryDelta(ReasoningSummaryDelta),
    ReasoningSummaryDone(ReasoningSummaryDone),
    OutputItemAdded(OutputItemEvent),
    OutputItemDone(OutputItemEvent),
    FunctionCallArgumentsDelta(ArgumentsDelta),
    FunctionCallArgumentsDone(ArgumentsDone),
    SearchCallSearching(SearchCallEvent),
    SearchCallCompleted(SearchCallEvent),
    Completed,
    Failed(StreamFailure),
    Unknown(String),
}

impl StreamEvent {
    /// Decodes an envelope by its tag. Unrecognized tags become `Unknown`;
    /// a recognized tag with a malformed payload is an error.
    pub fn decode(envelope: EventEnvelope) -> Result<Self, serde_json::Error> {
        let EventEnvelope { event, data } = envelope;
        let decoded = match event.as_str() {
            "response.output_text.delta" => Self::OutputTextDelta(serde_json::from_value(data)?),
            "response.output_text.annotation.added" => {
                Self::AnnotationAdded(serde_json::from_value(data)?)
            }
            "response.reasoning_summary_text.delta" => {
                Self::ReasoningSummaryDelta(serde_json::from_value(data)?)
            }
            "response.reasoning_summary_text.done" => {
                Self::ReasoningSummaryDone(serde_json::from_value(data)?)
            }
            "response.output_item.added" => Self::OutputItemAdded(serde_json::from_value(data)?),
            "response.output_item.done" => Self::OutputItemDone(serde_json::from_value(data)?),
            "response.function_call_arguments.delta" => {
                Self::FunctionCallArgumentsDelta(serde_json::from_value(data)?)
            }
            "response.function_call_arguments.done" => {
                Self::FunctionCallArgumentsDone(serde_json::from_value(data)?)
            }
            "response.web_search_call.searching" => {
                Self::SearchCallSearching(search_call(ToolKind::WebSearchCall, data)?)
            }
            "response.file_search_call.searching" => {
                Self::SearchCallSearching(search_call(ToolKind::FileSearchCall, data)?)
            }
            "response.web_search_call.completed" => {
                Self::SearchCallCompleted(search_call(ToolKind::WebSearchCall, data)?)
            }
            "response.file_search_call.completed" => {
                Self::SearchCallCompleted(search_call(ToolKind::FileSearchCall, data)?)
            }
            "response.completed" | END_OF_STREAM => Self::Completed,
            "response.failed" | "error" => Self::Failed(StreamFailure::from_payload(&data)),
            _ => Self::Unknown(event),
        };
        Ok(decoded)
    }

    /// Canonical wire tag for this event.
    pub fn tag(&self) -> &str {
        match self {
            Self::OutputTextDelta(_) => "response.output_text.delta",
            Self::AnnotationAdded(_) => "response.output_text.annotation.added",
            Self::ReasoningSummaryDelta(_) => "response.reasoning_summary_text.delta",
            Self::ReasoningSummaryDone(_) => "response.reasoning_summary_text.done",
            Self::OutputItemAdded(_) => "response.output_item.added",
            Self::OutputItemDone(_) => "response.output_item.done",
            Self::FunctionCallArgumentsDelta(_) => "response.function_call_arguments.delta",
            Self::FunctionCallArgumentsDone(_) => "response.function_call_arguments.done",
            Self::SearchCallSearching(event) => match event.tool {
                ToolKind::FileSearchCall => "response.file_search_call.searching",
                _ => "response.web_search_call.searching",
            },
            Self::SearchCallCompleted(event) => match event.tool {
                ToolKind::FileSearchCall => "response.file_search_call.completed",
                _ => "response.web_search_call.completed",
            },
            Self::Completed => "response.completed",
            Self::Failed(_) => "response.failed",
            Self::Unknown(tag) => tag.as_str(),
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

fn search_call(tool: ToolKind, data: Value) -> Result<SearchCallEvent, serde_json::Error> {
    let payload: SearchCallPayload = serde_json::from_value(data)?;
    let output = match payload.output {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    };
    Ok(SearchCallEvent {
        tool,
        item_id: payload.item_id,
        output,
    })
}
