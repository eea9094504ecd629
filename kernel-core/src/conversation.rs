use turnstile_kernel_protocol::{
    ConversationItem, EventMsg, HistoryAppendedEvent, HistoryItem, ItemUpdatedEvent, MessageItem,
    Role,
};

/// Turn-scoped context: the UI transcript and the history replayed to the
/// model. Every mutation bumps `revision` by one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    transcript: Vec<ConversationItem>,
    history: Vec<HistoryItem>,
    revision: u64,
}

/// One mutation of a [`Conversation`], tagged with the revision it produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Item { index: usize, revision: u64 },
    History { index: usize, revision: u64 },
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transcript(&self) -> &[ConversationItem] {
        &self.transcript
    }

    pub fn history(&self) -> &[HistoryItem] {
        &self.history
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn item(&self, index: usize) -> Option<&ConversationItem> {
        self.transcript.get(index)
    }

    /// Appends a user message to both the transcript and the history.
    pub fn push_user_text(&mut self, text: impl Into<String>) -> Vec<Change> {
        let message = MessageItem::user_text(text);
        let item_change = self.push_item(ConversationItem::Message(message.clone()));
        let history_change = self.append_history(HistoryItem::Message(message));
        vec![item_change, history_change]
    }

    /// Text of the most recent assistant message that has any.
    pub fn last_agent_message(&self) -> Option<String> {
        self.transcript.iter().rev().find_map(|item| match item {
            ConversationItem::Message(message) if message.role == Role::Assistant => {
                Some(message.text()).filter(|text| !text.is_empty())
            }
            _ => None,
        })
    }

    pub(crate) fn item_mut(&mut self, index: usize) -> Option<&mut ConversationItem> {
        self.transcript.get_mut(index)
    }

    pub(crate) fn push_item(&mut self, item: ConversationItem) -> Change {
        self.transcript.push(item);
        Change::Item {
            index: self.transcript.len() - 1,
            revision: self.bump(),
        }
    }

    pub(crate) fn touch_item(&mut self, index: usize) -> Change {
        Change::Item {
            index,
            revision: self.bump(),
        }
    }

    pub(crate) fn append_history(&mut self, item: HistoryItem) -> Change {
        self.history.push(item);
        Change::History {
            index: self.history.len() - 1,
            revision: self.bump(),
        }
    }

    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}

impl Change {
    /// Progress event describing this change against the current state.
    pub fn to_event(self, conversation: &Conversation) -> Option<EventMsg> {
        match self {
            Self::Item { index, revision } => conversation.transcript.get(index).map(|item| {
                EventMsg::ItemUpdated(ItemUpdatedEvent {
                    revision,
                    index,
                    item: item.clone(),
                })
            }),
            Self::History { index, revision } => conversation.history.get(index).map(|item| {
                EventMsg::HistoryAppended(HistoryAppendedEvent {
                    revision,
                    index,
                    item: item.clone(),
                })
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_text_lands_in_transcript_and_history_with_increasing_revisions() {
        let mut conversation = Conversation::new();
        let changes = conversation.push_user_text("hello");

        assert_eq!(
            changes,
            vec![
                Change::Item {
                    index: 0,
                    revision: 1
                },
                Change::History {
                    index: 0,
                    revision: 2
                },
            ]
        );
        assert_eq!(conversation.revision(), 2);
        assert!(matches!(
            changes[1].to_event(&conversation),
            Some(EventMsg::HistoryAppended(HistoryAppendedEvent { revision: 2, .. }))
        ));
        assert_eq!(conversation.last_agent_message(), None);
    }
}
