use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Developer,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    InputText,
    OutputText,
    Refusal,
    OutputAudio,
}

/// Citation attached to a content part. Only the `type` tag is interpreted;
/// every other field is carried through untouched.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Annotation {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: ContentKind,
    #[serde(default, alias = "refusal", alias = "transcript")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
}

impl ContentPart {
    pub fn input_text(text: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::InputText,
            text: text.into(),
            annotations: Vec::new(),
        }
    }

    pub fn output_text(text: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::OutputText,
            text: text.into(),
            annotations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MessageItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

impl MessageItem {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            id: None,
            role: Role::User,
            content: vec![ContentPart::input_text(text)],
        }
    }

    /// Concatenated text of every part, in order.
    pub fn text(&self) -> String {
        self.content.iter().map(|part| part.text.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    FunctionCall,
    WebSearchCall,
    FileSearchCall,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    InProgress,
    Searching,
    Completed,
    Failed,
}

impl ToolCallStatus {
    /// Maps a provider status string. `incomplete` is treated as a failure.
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw.trim() {
            "in_progress" => Some(Self::InProgress),
            "searching" => Some(Self::Searching),
            "completed" => Some(Self::Completed),
            "failed" | "incomplete" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::InProgress => 0,
            Self::Searching => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    pub fn can_advance_to(self, next: Self) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ToolCallItem {
    pub id: String,
    pub tool_type: ToolKind,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub parsed_arguments: Value,
    #[serde(default)]
    pub output: Option<String>,
}

impl ToolCallItem {
    pub fn new(id: impl Into<String>, tool_type: ToolKind, status: ToolCallStatus) -> Self {
        Self {
            id: id.into(),
            tool_type,
            status,
            name: None,
            call_id: None,
            arguments: String::new(),
            parsed_arguments: Value::Object(Map::new()),
            output: None,
        }
    }

    /// Moves the status forward. Returns false when the transition would go
    /// backwards or leave a terminal state; the status is left unchanged.
    pub fn advance_status(&mut self, next: ToolCallStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SummaryTextPart {
    #[serde(rename = "type", default = "SummaryTextPart::default_kind")]
    pub kind: String,
    #[serde(default)]
    pub text: String,
}

impl SummaryTextPart {
    fn default_kind() -> String {
        "summary_text".to_string()
    }

    pub fn new(text: impl Into<String>) -> Self {
        Self {
            kind: Self::default_kind(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ReasoningItem {
    pub id: String,
    #[serde(default)]
    pub summary: Vec<SummaryTextPart>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    Message(MessageItem),
    ToolCall(ToolCallItem),
    Reasoning(ReasoningItem),
}

impl ConversationItem {
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Message(message) => message.id.as_deref(),
            Self::ToolCall(call) => Some(call.id.as_str()),
            Self::Reasoning(reasoning) => Some(reasoning.id.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    #[default]
    Completed,
    Incomplete,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FunctionCallOutputItem {
    pub call_id: String,
    pub output: String,
    #[serde(default)]
    pub status: OutputStatus,
}

/// An entry replayed to the model on the next turn. Reasoning has no variant
/// here, so it cannot reach the API-facing history.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryItem {
    Message(MessageItem),
    ToolCall(ToolCallItem),
    FunctionCallOutput(FunctionCallOutputItem),
}

impl HistoryItem {
    pub fn from_item(item: ConversationItem) -> Option<Self> {
        match item {
            ConversationItem::Message(message) => Some(Self::Message(message)),
            ConversationItem::ToolCall(call) => Some(Self::ToolCall(call)),
            ConversationItem::Reasoning(_) => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct UserLocation {
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct WebSearchConfig {
    #[serde(default)]
    pub user_location: Option<UserLocation>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct FileSearchConfig {
    #[serde(default)]
    pub vector_store_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolDeclaration {
    Function(ToolSpec),
    WebSearch(WebSearchConfig),
    FileSearch(FileSearchConfig),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_only_moves_forward() {
        let mut call = ToolCallItem::new("fc_1", ToolKind::WebSearchCall, ToolCallStatus::InProgress);
        assert!(call.advance_status(ToolCallStatus::Searching));
        assert!(!call.advance_status(ToolCallStatus::InProgress));
        assert!(call.advance_status(ToolCallStatus::Completed));
        assert!(!call.advance_status(ToolCallStatus::Failed));
        assert_eq!(call.status, ToolCallStatus::Completed);
    }

    #[test]
    fn reasoning_cannot_enter_history() {
        let reasoning = ConversationItem::Reasoning(ReasoningItem {
            id: "rs_1".to_string(),
            summary: vec![SummaryTextPart::new("thinking")],
        });
        assert!(HistoryItem::from_item(reasoning).is_none());

        let message = ConversationItem::Message(MessageItem::user_text("hi"));
        assert!(matches!(
            HistoryItem::from_item(message),
            Some(HistoryItem::Message(_))
        ));
    }

    #[test]
    fn content_part_accepts_refusal_field_and_keeps_annotation_fields() {
        let refusal: ContentPart =
            serde_json::from_value(json!({"type": "refusal", "refusal": "no"})).expect("refusal");
        assert_eq!(refusal.kind, ContentKind::Refusal);
        assert_eq!(refusal.text, "no");

        let annotation: Annotation = serde_json::from_value(json!({
            "type": "url_citation",
            "url": "https://example.com",
            "start_index": 0,
            "end_index": 4,
        }))
        .expect("annotation");
        assert_eq!(annotation.kind, "url_citation");
        assert_eq!(annotation.fields.get("end_index"), Some(&json!(4)));
    }

    #[test]
    fn conversation_item_uses_tagged_variant() {
        let item = ConversationItem::ToolCall(ToolCallItem::new(
            "fc_1",
            ToolKind::FunctionCall,
            ToolCallStatus::InProgress,
        ));
        let json = serde_json::to_string(&item).expect("serialize item");
        assert!(json.contains("\"type\":\"tool_call\""));
        assert!(json.contains("\"tool_type\":\"function_call\""));
    }
}
