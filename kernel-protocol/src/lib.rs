use serde::{Deserialize, Serialize};
use serde_json::Value;

mod items;
mod stream;

pub use items::{
    Annotation, ContentKind, ContentPart, ConversationItem, FileSearchConfig,
    FunctionCallOutputItem, HistoryItem, MessageItem, OutputStatus, ReasoningItem, Role,
    SummaryTextPart, ToolCallItem, ToolCallStatus, ToolDeclaration, ToolKind, ToolSpec,
    UserLocation, WebSearchConfig,
};
pub use stream::{
    AnnotationAdded, ArgumentsDelta, ArgumentsDone, EventEnvelope, OutputItem, OutputItemEvent,
    ReasoningSummaryDelta, ReasoningSummaryDone, SearchCallEvent, StreamEvent, StreamFailure,
    TextDelta, END_OF_STREAM,
};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Submission {
    pub id: String,
    pub op: Op,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Op {
    UserTurn {
        items: Vec<InputItem>,
        #[serde(default, skip_serializing_if = "UserTurnOptions::is_empty")]
        options: UserTurnOptions,
    },
    Interrupt,
    Shutdown,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct UserTurnOptions {
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub web_search: Option<WebSearchConfig>,
    #[serde(default)]
    pub file_search: Option<FileSearchConfig>,
    #[serde(default)]
    pub reasoning_enabled: Option<bool>,
    #[serde(default)]
    pub max_tool_rounds: Option<usize>,
}

impl UserTurnOptions {
    fn is_empty(options: &Self) -> bool {
        options.tools.is_empty()
            && options.web_search.is_none()
            && options.file_search.is_none()
            && options.reasoning_enabled.is_none()
            && options.max_tool_rounds.is_none()
    }

    /// Tool declarations sent with every turn, functions first.
    pub fn tool_declarations(&self) -> Vec<ToolDeclaration> {
        let mut declarations: Vec<ToolDeclaration> = self
            .tools
            .iter()
            .cloned()
            .map(ToolDeclaration::Function)
            .collect();
        if let Some(web_search) = self.web_search.as_ref() {
            declarations.push(ToolDeclaration::WebSearch(web_search.clone()));
        }
        if let Some(file_search) = self
            .file_search
            .as_ref()
            .filter(|config| !config.vector_store_ids.is_empty())
        {
            declarations.push(ToolDeclaration::FileSearch(file_search.clone()));
        }
        declarations
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
    Text { text: String },
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub msg: EventMsg,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventMsg {
    SessionConfigured(SessionConfiguredEvent),
    TaskStarted(TaskStartedEvent),
    ItemUpdated(ItemUpdatedEvent),
    HistoryAppended(HistoryAppendedEvent),
    ToolCall(ToolCallEvent),
    ToolResult(ToolResultEvent),
    ToolError(ToolErrorEvent),
    TurnCompleted(TurnCompletedEvent),
    TaskComplete(TaskCompleteEvent),
    TurnAborted(TurnAbortedEvent),
    ShutdownComplete,
    Error(ErrorEvent),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SessionConfiguredEvent {
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TaskStartedEvent {
    pub history_items_count: u64,
}

/// A transcript item was created or mutated. `revision` is strictly
/// increasing across every update of a session.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ItemUpdatedEvent {
    pub revision: u64,
    pub index: usize,
    pub item: ConversationItem,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct HistoryAppendedEvent {
    pub revision: u64,
    pub index: usize,
    pub item: HistoryItem,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ToolCallEvent {
    pub call_id: String,
    pub tool_name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ToolResultEvent {
    pub call_id: String,
    pub tool_name: String,
    pub output: Value,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ToolErrorEvent {
    pub call_id: String,
    pub tool_name: String,
    pub error: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TurnCompletedEvent {
    pub round: u64,
    pub events_applied: u64,
    pub pending_tool_calls: u64,
    #[serde(default)]
    pub protocol_violations: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TaskCompleteEvent {
    pub last_agent_message: Option<String>,
    #[serde(default)]
    pub rounds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TurnAbortedEvent {
    pub reason: TurnAbortReason,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnAbortReason {
    UserInterrupt,
    Shutdown,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ErrorEvent {
    pub message: String,
}
