use std::collections::{HashMap, HashSet};

use serde_json::json;
use thiserror::Error;
use turnstile_kernel_protocol::{
    AnnotationAdded, ArgumentsDelta, ArgumentsDone, ContentKind, ContentPart, ConversationItem,
    HistoryItem, MessageItem, OutputItem, ReasoningItem, ReasoningSummaryDelta,
    ReasoningSummaryDone, Role, SearchCallEvent, StreamEvent, SummaryTextPart, TextDelta,
    ToolCallItem, ToolCallStatus, ToolKind,
};

use crate::conversation::{Change, Conversation};
use crate::partial_json::{parse_complete, PartialJson};

/// An event that does not fit the items seen so far. The offending event is
/// not applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReducerError {
    #[error("`{event}` references unknown item `{item_id}`")]
    UnknownItem { event: String, item_id: String },
    #[error("item `{item_id}` was added twice")]
    DuplicateItem { item_id: String },
    #[error("`{event}` targets sealed item `{item_id}`")]
    ItemSealed { event: String, item_id: String },
    #[error("`{event}` does not apply to item `{item_id}`")]
    WrongKind { event: String, item_id: String },
    #[error("`{event}` index {index} is too far past the parts of item `{item_id}`")]
    IndexOutOfRange {
        event: String,
        item_id: String,
        index: usize,
    },
}

/// How many missing parts an index may skip over; skipped parts are padded.
const MAX_PART_GAP: usize = 8;

/// A function call that needs an output in history before the next turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingCall {
    /// Arguments parsed; the tool should run.
    Dispatch { index: usize },
    /// Final arguments were unusable; the error is already the call's output.
    Rejected { index: usize, error: String },
}

impl PendingCall {
    pub fn index(&self) -> usize {
        match self {
            Self::Dispatch { index } | Self::Rejected { index, .. } => *index,
        }
    }
}

/// Per-turn state machine folding stream events into a [`Conversation`].
///
/// Items are addressed by id only. Events for different items may interleave
/// freely; each event touches exactly one item.
#[derive(Debug, Default)]
pub struct TranscriptReducer {
    index_by_id: HashMap<String, usize>,
    sealed: HashSet<String>,
    implicit: HashSet<String>,
    arguments: HashMap<String, PartialJson>,
    pending: Vec<PendingCall>,
}

impl TranscriptReducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> &[PendingCall] {
        &self.pending
    }

    pub fn apply(
        &mut self,
        conversation: &mut Conversation,
        event: &StreamEvent,
    ) -> Result<Vec<Change>, ReducerError> {
        let tag = event.tag();
        match event {
            StreamEvent::OutputTextDelta(delta) => self.text_delta(conversation, tag, delta),
            StreamEvent::AnnotationAdded(added) => self.annotation_added(conversation, tag, added),
            StreamEvent::ReasoningSummaryDelta(delta) => {
                self.summary_delta(conversation, tag, delta)
            }
            StreamEvent::ReasoningSummaryDone(done) => self.summary_done(conversation, tag, done),
            StreamEvent::OutputItemAdded(added) => self.item_added(conversation, &added.item),
            StreamEvent::OutputItemDone(done) => self.item_done(conversation, tag, &done.item),
            StreamEvent::FunctionCallArgumentsDelta(delta) => {
                self.arguments_delta(conversation, tag, delta)
            }
            StreamEvent::FunctionCallArgumentsDone(done) => {
                self.arguments_done(conversation, tag, done)
            }
            StreamEvent::SearchCallSearching(search) => {
                self.search_progress(conversation, tag, search, ToolCallStatus::Searching)
            }
            StreamEvent::SearchCallCompleted(search) => {
                self.search_progress(conversation, tag, search, ToolCallStatus::Completed)
            }
            StreamEvent::Completed | StreamEvent::Failed(_) | StreamEvent::Unknown(_) => {
                Ok(Vec::new())
            }
        }
    }

    /// Closes the turn. Queued calls whose `done` never arrived are sealed
    /// into history so each output follows its call.
    pub fn finish(mut self, conversation: &mut Conversation) -> (Vec<PendingCall>, Vec<Change>) {
        let pending = std::mem::take(&mut self.pending);
        let mut changes = Vec::new();
        for call in &pending {
            let Some(item) = conversation.item(call.index()) else {
                continue;
            };
            let Some(item_id) = item.id().map(str::to_string) else {
                continue;
            };
            if !self.sealed.insert(item_id) {
                continue;
            }
            if let Some(entry) = HistoryItem::from_item(item.clone()) {
                changes.push(conversation.append_history(entry));
            }
        }
        (pending, changes)
    }

    fn text_delta(
        &mut self,
        conversation: &mut Conversation,
        tag: &str,
        delta: &TextDelta,
    ) -> Result<Vec<Change>, ReducerError> {
        if !self.index_by_id.contains_key(&delta.item_id) {
            let mut message = MessageItem {
                id: Some(delta.item_id.clone()),
                role: Role::Assistant,
                content: Vec::new(),
            };
            append_text(&mut message, delta.content_index, &delta.delta)
                .map_err(|index| out_of_range(tag, &delta.item_id, index))?;
            self.implicit.insert(delta.item_id.clone());
            let change = self.insert(
                conversation,
                &delta.item_id,
                ConversationItem::Message(message),
            );
            return Ok(vec![change]);
        }

        let index = self.open_index(tag, &delta.item_id)?;
        let message = message_mut(conversation, index, tag, &delta.item_id)?;
        append_text(message, delta.content_index, &delta.delta)
            .map_err(|part| out_of_range(tag, &delta.item_id, part))?;
        Ok(vec![conversation.touch_item(index)])
    }

    fn annotation_added(
        &mut self,
        conversation: &mut Conversation,
        tag: &str,
        added: &AnnotationAdded,
    ) -> Result<Vec<Change>, ReducerError> {
        let index = self.open_index(tag, &added.item_id)?;
        let message = message_mut(conversation, index, tag, &added.item_id)?;
        let part_index = added
            .content_index
            .unwrap_or_else(|| message.content.len().saturating_sub(1));
        content_part(message, part_index)
            .map_err(|part| out_of_range(tag, &added.item_id, part))?
            .annotations
            .push(added.annotation.clone());
        Ok(vec![conversation.touch_item(index)])
    }

    fn summary_delta(
        &mut self,
        conversation: &mut Conversation,
        tag: &str,
        delta: &ReasoningSummaryDelta,
    ) -> Result<Vec<Change>, ReducerError> {
        if !self.index_by_id.contains_key(&delta.item_id) {
            let mut reasoning = ReasoningItem {
                id: delta.item_id.clone(),
                summary: Vec::new(),
            };
            summary_part(&mut reasoning.summary, delta.summary_index)
                .map_err(|part| out_of_range(tag, &delta.item_id, part))?
                .text
                .push_str(&delta.delta);
            self.implicit.insert(delta.item_id.clone());
            let change = self.insert(
                conversation,
                &delta.item_id,
                ConversationItem::Reasoning(reasoning),
            );
            return Ok(vec![change]);
        }

        let index = self.open_index(tag, &delta.item_id)?;
        let reasoning = reasoning_mut(conversation, index, tag, &delta.item_id)?;
        summary_part(&mut reasoning.summary, delta.summary_index)
            .map_err(|part| out_of_range(tag, &delta.item_id, part))?
            .text
            .push_str(&delta.delta);
        Ok(vec![conversation.touch_item(index)])
    }

    fn summary_done(
        &mut self,
        conversation: &mut Conversation,
        tag: &str,
        done: &ReasoningSummaryDone,
    ) -> Result<Vec<Change>, ReducerError> {
        let index = self.open_index(tag, &done.item_id)?;
        let reasoning = reasoning_mut(conversation, index, tag, &done.item_id)?;
        summary_part(&mut reasoning.summary, done.summary_index)
            .map_err(|part| out_of_range(tag, &done.item_id, part))?
            .text = done.text.clone();
        Ok(vec![conversation.touch_item(index)])
    }

    fn item_added(
        &mut self,
        conversation: &mut Conversation,
        item: &OutputItem,
    ) -> Result<Vec<Change>, ReducerError> {
        let Some(item_id) = item.id() else {
            return Ok(Vec::new());
        };
        if let Some(&index) = self.index_by_id.get(item_id) {
            // A delta may have opened the item before its `added` event.
            if self.implicit.contains(item_id) && same_kind(conversation.item(index), item) {
                self.implicit.remove(item_id);
                return Ok(Vec::new());
            }
            return Err(ReducerError::DuplicateItem {
                item_id: item_id.to_string(),
            });
        }

        let created = match item {
            OutputItem::Message { id, role, content } => ConversationItem::Message(MessageItem {
                id: Some(id.clone()),
                role: role.unwrap_or(Role::Assistant),
                content: content.clone(),
            }),
            OutputItem::FunctionCall {
                id,
                call_id,
                name,
                arguments,
                ..
            } => {
                // Completion of a function call only happens through its arguments.
                let status = item
                    .status()
                    .filter(|status| !status.is_terminal())
                    .unwrap_or(ToolCallStatus::InProgress);
                let mut call = ToolCallItem::new(id.clone(), ToolKind::FunctionCall, status);
                call.call_id = call_id.clone();
                call.name = name.clone();
                let mut parser = PartialJson::new();
                if let Some(raw) = arguments.as_deref().filter(|raw| !raw.is_empty()) {
                    parser.push(raw);
                    call.arguments = raw.to_string();
                    if let Some(snapshot) = parser.snapshot() {
                        call.parsed_arguments = snapshot;
                    }
                }
                self.arguments.insert(id.clone(), parser);
                ConversationItem::ToolCall(call)
            }
            OutputItem::WebSearchCall { id, .. } => ConversationItem::ToolCall(ToolCallItem::new(
                id.clone(),
                ToolKind::WebSearchCall,
                item.status().unwrap_or(ToolCallStatus::InProgress),
            )),
            OutputItem::FileSearchCall { id, .. } => ConversationItem::ToolCall(ToolCallItem::new(
                id.clone(),
                ToolKind::FileSearchCall,
                item.status().unwrap_or(ToolCallStatus::InProgress),
            )),
            OutputItem::Reasoning { id, summary } => ConversationItem::Reasoning(ReasoningItem {
                id: id.clone(),
                summary: summary.clone(),
            }),
            OutputItem::Unsupported => return Ok(Vec::new()),
        };
        Ok(vec![self.insert(conversation, item_id, created)])
    }

    fn item_done(
        &mut self,
        conversation: &mut Conversation,
        tag: &str,
        item: &OutputItem,
    ) -> Result<Vec<Change>, ReducerError> {
        let Some(item_id) = item.id() else {
            return Ok(Vec::new());
        };
        let index = self.open_index(tag, item_id)?;
        let mut changes = Vec::new();

        match item {
            OutputItem::Reasoning { summary, .. } => {
                let reasoning = reasoning_mut(conversation, index, tag, item_id)?;
                reasoning.summary = summary.clone();
                self.seal(item_id);
                return Ok(vec![conversation.touch_item(index)]);
            }
            OutputItem::Message { content, .. } => {
                let message = message_mut(conversation, index, tag, item_id)?;
                if !content.is_empty() && message.content != *content {
                    message.content = content.clone();
                    changes.push(conversation.touch_item(index));
                }
            }
            OutputItem::FunctionCall {
                call_id,
                name,
                arguments,
                ..
            } => {
                let carried = item.status();
                let call =
                    tool_call_mut(conversation, index, tag, item_id, ToolKind::FunctionCall)?;
                if let Some(call_id) = call_id {
                    call.call_id = Some(call_id.clone());
                }
                if call.name.is_none() {
                    call.name = name.clone();
                }
                // Providers that skip `function_call_arguments.done` finalize here.
                if !call.status.is_terminal() {
                    if let Some(raw) = arguments {
                        call.arguments = raw.clone();
                    }
                    if carried == Some(ToolCallStatus::Failed) {
                        self.reject(
                            call,
                            index,
                            "function call ended before its arguments were complete".to_string(),
                        );
                    } else {
                        self.finalize(call, index);
                    }
                }
                changes.push(conversation.touch_item(index));
            }
            OutputItem::WebSearchCall { .. } | OutputItem::FileSearchCall { .. } => {
                let kind = match item {
                    OutputItem::FileSearchCall { .. } => ToolKind::FileSearchCall,
                    _ => ToolKind::WebSearchCall,
                };
                let carried = item.status();
                let call = tool_call_mut(conversation, index, tag, item_id, kind)?;
                if let Some(status) = carried {
                    call.advance_status(status);
                }
                changes.push(conversation.touch_item(index));
            }
            OutputItem::Unsupported => return Ok(Vec::new()),
        }

        self.seal(item_id);
        if let Some(entry) = conversation
            .item(index)
            .cloned()
            .and_then(HistoryItem::from_item)
        {
            changes.push(conversation.append_history(entry));
        }
        Ok(changes)
    }

    fn arguments_delta(
        &mut self,
        conversation: &mut Conversation,
        tag: &str,
        delta: &ArgumentsDelta,
    ) -> Result<Vec<Change>, ReducerError> {
        let index = self.open_index(tag, &delta.item_id)?;
        let call = tool_call_mut(
            conversation,
            index,
            tag,
            &delta.item_id,
            ToolKind::FunctionCall,
        )?;
        if call.status.is_terminal() {
            return Err(sealed(tag, &delta.item_id));
        }
        call.arguments.push_str(&delta.delta);
        let parser = self.arguments.entry(delta.item_id.clone()).or_default();
        parser.push(&delta.delta);
        if let Some(snapshot) = parser.snapshot() {
            call.parsed_arguments = snapshot;
        }
        Ok(vec![conversation.touch_item(index)])
    }

    fn arguments_done(
        &mut self,
        conversation: &mut Conversation,
        tag: &str,
        done: &ArgumentsDone,
    ) -> Result<Vec<Change>, ReducerError> {
        let index = self.open_index(tag, &done.item_id)?;
        let call = tool_call_mut(
            conversation,
            index,
            tag,
            &done.item_id,
            ToolKind::FunctionCall,
        )?;
        if call.status.is_terminal() {
            return Err(sealed(tag, &done.item_id));
        }
        call.arguments = done.arguments.clone();
        self.finalize(call, index);
        Ok(vec![conversation.touch_item(index)])
    }

    fn search_progress(
        &mut self,
        conversation: &mut Conversation,
        tag: &str,
        search: &SearchCallEvent,
        status: ToolCallStatus,
    ) -> Result<Vec<Change>, ReducerError> {
        let index = self.open_index(tag, &search.item_id)?;
        let call = tool_call_mut(conversation, index, tag, &search.item_id, search.tool)?;
        if !call.advance_status(status) {
            return Ok(Vec::new());
        }
        if let Some(output) = search.output.as_ref() {
            call.output = Some(output.clone());
        }
        Ok(vec![conversation.touch_item(index)])
    }

    fn finalize(&mut self, call: &mut ToolCallItem, index: usize) {
        match parse_complete(&call.arguments) {
            Ok(parsed) => {
                self.arguments.remove(&call.id);
                call.parsed_arguments = parsed;
                call.advance_status(ToolCallStatus::Completed);
                self.pending.push(PendingCall::Dispatch { index });
            }
            Err(error) => self.reject(call, index, format!("invalid function arguments: {error}")),
        }
    }

    fn reject(&mut self, call: &mut ToolCallItem, index: usize, error: String) {
        self.arguments.remove(&call.id);
        call.advance_status(ToolCallStatus::Failed);
        call.output = Some(json!({ "error": error }).to_string());
        self.pending.push(PendingCall::Rejected { index, error });
    }

    fn insert(
        &mut self,
        conversation: &mut Conversation,
        item_id: &str,
        item: ConversationItem,
    ) -> Change {
        self.index_by_id
            .insert(item_id.to_string(), conversation.transcript().len());
        conversation.push_item(item)
    }

    fn open_index(&self, tag: &str, item_id: &str) -> Result<usize, ReducerError> {
        let index = *self
            .index_by_id
            .get(item_id)
            .ok_or_else(|| ReducerError::UnknownItem {
                event: tag.to_string(),
                item_id: item_id.to_string(),
            })?;
        if self.sealed.contains(item_id) {
            return Err(sealed(tag, item_id));
        }
        Ok(index)
    }

    fn seal(&mut self, item_id: &str) {
        self.implicit.remove(item_id);
        self.sealed.insert(item_id.to_string());
    }
}

fn sealed(tag: &str, item_id: &str) -> ReducerError {
    ReducerError::ItemSealed {
        event: tag.to_string(),
        item_id: item_id.to_string(),
    }
}

fn out_of_range(tag: &str, item_id: &str, index: usize) -> ReducerError {
    ReducerError::IndexOutOfRange {
        event: tag.to_string(),
        item_id: item_id.to_string(),
        index,
    }
}

fn wrong_kind(tag: &str, item_id: &str) -> ReducerError {
    ReducerError::WrongKind {
        event: tag.to_string(),
        item_id: item_id.to_string(),
    }
}

fn same_kind(existing: Option<&ConversationItem>, added: &OutputItem) -> bool {
    matches!(
        (existing, added),
        (Some(ConversationItem::Message(_)), OutputItem::Message { .. })
            | (Some(ConversationItem::Reasoning(_)), OutputItem::Reasoning { .. })
    )
}

fn message_mut<'a>(
    conversation: &'a mut Conversation,
    index: usize,
    tag: &str,
    item_id: &str,
) -> Result<&'a mut MessageItem, ReducerError> {
    match conversation.item_mut(index) {
        Some(ConversationItem::Message(message)) => Ok(message),
        _ => Err(wrong_kind(tag, item_id)),
    }
}

fn reasoning_mut<'a>(
    conversation: &'a mut Conversation,
    index: usize,
    tag: &str,
    item_id: &str,
) -> Result<&'a mut ReasoningItem, ReducerError> {
    match conversation.item_mut(index) {
        Some(ConversationItem::Reasoning(reasoning)) => Ok(reasoning),
        _ => Err(wrong_kind(tag, item_id)),
    }
}

fn tool_call_mut<'a>(
    conversation: &'a mut Conversation,
    index: usize,
    tag: &str,
    item_id: &str,
    kind: ToolKind,
) -> Result<&'a mut ToolCallItem, ReducerError> {
    match conversation.item_mut(index) {
        Some(ConversationItem::ToolCall(call)) if call.tool_type == kind => Ok(call),
        _ => Err(wrong_kind(tag, item_id)),
    }
}

fn append_text(
    message: &mut MessageItem,
    content_index: Option<usize>,
    delta: &str,
) -> Result<(), usize> {
    let index = content_index.unwrap_or_else(|| {
        message
            .content
            .iter()
            .rposition(|part| part.kind == ContentKind::OutputText)
            .unwrap_or(message.content.len())
    });
    content_part(message, index)?.text.push_str(delta);
    Ok(())
}

/// Returns the part at `index`, padding any gap. An index more than
/// `MAX_PART_GAP` past the end is handed back as the error.
fn content_part(message: &mut MessageItem, index: usize) -> Result<&mut ContentPart, usize> {
    if index.saturating_sub(message.content.len()) > MAX_PART_GAP {
        return Err(index);
    }
    if message.content.len() <= index {
        message
            .content
            .resize_with(index + 1, || ContentPart::output_text(""));
    }
    Ok(&mut message.content[index])
}

fn summary_part(
    summary: &mut Vec<SummaryTextPart>,
    index: usize,
) -> Result<&mut SummaryTextPart, usize> {
    if index.saturating_sub(summary.len()) > MAX_PART_GAP {
        return Err(index);
    }
    if summary.len() <= index {
        summary.resize_with(index + 1, || SummaryTextPart::new(""));
    }
    Ok(&mut summary[index])
}
