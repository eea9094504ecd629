use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};
use turnstile_kernel_protocol::{
    ErrorEvent, Event, EventMsg, InputItem, Op, SessionConfiguredEvent, Submission,
    TaskCompleteEvent, TaskStartedEvent, TurnAbortReason, TurnAbortedEvent, UserTurnOptions,
};

mod conversation;
mod dispatch;
mod driver;
mod partial_json;
mod reducer;
mod tool_loop;

pub use conversation::{Change, Conversation};
pub use dispatch::{ToolDispatcher, ToolError, ToolRegistry};
pub use driver::{
    run_turn, EventSource, EventStream, TransportError, TurnError, TurnFailure, TurnOptions,
    TurnOutcome, TurnRequest,
};
pub use partial_json::{parse_complete, PartialJson};
pub use reducer::{PendingCall, ReducerError, TranscriptReducer};
pub use tool_loop::{LoopConfig, LoopError, LoopOutcome, LoopRequest, ToolLoop, DEFAULT_MAX_ROUNDS};

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub session_id: String,
    pub channel_capacity: usize,
    pub task_idle_timeout: Duration,
    /// Used when a user turn does not say.
    pub reasoning_enabled: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            session_id: "turnstile-kernel".to_string(),
            channel_capacity: 128,
            task_idle_timeout: Duration::from_millis(200),
            reasoning_enabled: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("failed to send submission: runtime channel closed")]
    SubmissionChannelClosed,
    #[error("kernel join failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq)]
struct UserTurn {
    items: Vec<InputItem>,
    options: UserTurnOptions,
}

impl UserTurn {
    fn text(&self) -> String {
        self.items
            .iter()
            .map(|item| match item {
                InputItem::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub struct KernelRuntime {
    submission_tx: mpsc::Sender<Submission>,
    event_rx: mpsc::Receiver<Event>,
    conversation: Arc<Mutex<Conversation>>,
    loop_handle: JoinHandle<()>,
}

struct RunningTask {
    sub_id: String,
    input_tx: mpsc::Sender<UserTurn>,
    handle: JoinHandle<()>,
}

impl KernelRuntime {
    pub fn spawn(config: KernelConfig, tool_loop: ToolLoop) -> Self {
        let (submission_tx, submission_rx) = mpsc::channel(config.channel_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.channel_capacity);
        let conversation = Arc::new(Mutex::new(Conversation::new()));

        let loop_handle = tokio::spawn(submission_loop(
            config,
            submission_rx,
            event_tx,
            Arc::new(tool_loop),
            Arc::clone(&conversation),
        ));

        Self {
            submission_tx,
            event_rx,
            conversation,
            loop_handle,
        }
    }

    pub async fn submit(&self, submission: Submission) -> Result<(), KernelError> {
        self.submission_tx
            .send(submission)
            .await
            .map_err(|_| KernelError::SubmissionChannelClosed)
    }

    pub fn submission_sender(&self) -> mpsc::Sender<Submission> {
        self.submission_tx.clone()
    }

    pub fn events_mut(&mut self) -> &mut mpsc::Receiver<Event> {
        &mut self.event_rx
    }

    /// Session state. Locked by the running task for the length of a task.
    pub fn conversation(&self) -> Arc<Mutex<Conversation>> {
        Arc::clone(&self.conversation)
    }

    pub async fn join(self) -> Result<(), KernelError> {
        self.loop_handle.await?;
        Ok(())
    }
}

async fn submission_loop(
    config: KernelConfig,
    mut submission_rx: mpsc::Receiver<Submission>,
    event_tx: mpsc::Sender<Event>,
    tool_loop: Arc<ToolLoop>,
    conversation: Arc<Mutex<Conversation>>,
) {
    info!(session_id = %config.session_id, "kernel session configured");
    let _ = send_event(
        &event_tx,
        Event {
            id: "session".to_string(),
            msg: EventMsg::SessionConfigured(SessionConfiguredEvent {
                session_id: config.session_id.clone(),
            }),
        },
    )
    .await;

    let mut running_task: Option<RunningTask> = None;

    while let Some(submission) = submission_rx.recv().await {
        if running_task
            .as_ref()
            .is_some_and(|task| task.handle.is_finished())
        {
            running_task = None;
        }

        match submission.op {
            Op::UserTurn { items, options } => {
                let mut turn = UserTurn { items, options };
                if let Some(task) = running_task.as_ref() {
                    match task.input_tx.send(turn).await {
                        Ok(()) => continue,
                        Err(send_error) => {
                            turn = send_error.0;
                        }
                    }
                }

                let task = spawn_task(
                    submission.id,
                    turn,
                    &config,
                    event_tx.clone(),
                    Arc::clone(&tool_loop),
                    Arc::clone(&conversation),
                );
                running_task = Some(task);
            }
            Op::Interrupt => {
                if let Some(task) = running_task.take() {
                    task.handle.abort();
                    info!(sub_id = %task.sub_id, "task interrupted");
                    let _ = send_event(
                        &event_tx,
                        Event {
                            id: task.sub_id,
                            msg: EventMsg::TurnAborted(TurnAbortedEvent {
                                reason: TurnAbortReason::UserInterrupt,
                            }),
                        },
                    )
                    .await;
                }
            }
            Op::Shutdown => {
                if let Some(task) = running_task.take() {
                    task.handle.abort();
                    let _ = send_event(
                        &event_tx,
                        Event {
                            id: task.sub_id,
                            msg: EventMsg::TurnAborted(TurnAbortedEvent {
                                reason: TurnAbortReason::Shutdown,
                            }),
                        },
                    )
                    .await;
                }

                let _ = send_event(
                    &event_tx,
                    Event {
                        id: submission.id,
                        msg: EventMsg::ShutdownComplete,
                    },
                )
                .await;
                break;
            }
        }
    }
}

fn spawn_task(
    sub_id: String,
    initial_turn: UserTurn,
    config: &KernelConfig,
    event_tx: mpsc::Sender<Event>,
    tool_loop: Arc<ToolLoop>,
    conversation: Arc<Mutex<Conversation>>,
) -> RunningTask {
    let (input_tx, mut input_rx) = mpsc::channel::<UserTurn>(32);
    let task_sub_id = sub_id.clone();
    let task_idle_timeout = config.task_idle_timeout;
    let default_reasoning = config.reasoning_enabled;

    let handle = tokio::spawn(async move {
        let mut conversation = conversation.lock_owned().await;
        let _ = send_event(
            &event_tx,
            Event {
                id: task_sub_id.clone(),
                msg: EventMsg::TaskStarted(TaskStartedEvent {
                    history_items_count: conversation.history().len() as u64,
                }),
            },
        )
        .await;

        let mut pending = Some(initial_turn);
        let mut last_agent_message: Option<String> = None;
        let mut rounds = 0_u64;

        loop {
            if let Some(turn) = pending.take() {
                let text = turn.text();
                if !text.is_empty() {
                    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<EventMsg>();
                    let progress_event_tx = event_tx.clone();
                    let progress_event_id = task_sub_id.clone();
                    let forwarder = tokio::spawn(async move {
                        while let Some(progress_msg) = progress_rx.recv().await {
                            let _ = send_event(
                                &progress_event_tx,
                                Event {
                                    id: progress_event_id.clone(),
                                    msg: progress_msg,
                                },
                            )
                            .await;
                        }
                    });

                    let changes = conversation.push_user_text(text);
                    for change in changes {
                        if let Some(msg) = change.to_event(&conversation) {
                            let _ = progress_tx.send(msg);
                        }
                    }
                    let request = LoopRequest {
                        tools: turn.options.tool_declarations(),
                        reasoning_enabled: turn
                            .options
                            .reasoning_enabled
                            .unwrap_or(default_reasoning),
                        max_rounds: turn.options.max_tool_rounds,
                    };
                    let loop_result = tool_loop
                        .run(&mut conversation, &request, Some(&progress_tx))
                        .await;
                    drop(progress_tx);
                    if let Err(join_error) = forwarder.await {
                        let message = format!("progress forwarder failed: {join_error}");
                        error!("{message}");
                        let _ = send_event(
                            &event_tx,
                            Event {
                                id: task_sub_id.clone(),
                                msg: EventMsg::Error(ErrorEvent { message }),
                            },
                        )
                        .await;
                    }

                    match loop_result {
                        Ok(outcome) => {
                            rounds += outcome.rounds;
                            if outcome.last_agent_message.is_some() {
                                last_agent_message = outcome.last_agent_message;
                            }
                        }
                        Err(err) => {
                            error!(sub_id = %task_sub_id, error = %err, "tool loop failed");
                            let _ = send_event(
                                &event_tx,
                                Event {
                                    id: task_sub_id.clone(),
                                    msg: EventMsg::Error(ErrorEvent {
                                        message: format!("tool loop failed: {err}"),
                                    }),
                                },
                            )
                            .await;
                            break;
                        }
                    }
                }
            }

            match tokio::time::timeout(task_idle_timeout, input_rx.recv()).await {
                Ok(Some(turn)) => {
                    pending = Some(turn);
                }
                Ok(None) | Err(_) => break,
            }
        }
        drop(input_rx);

        let _ = send_event(
            &event_tx,
            Event {
                id: task_sub_id,
                msg: EventMsg::TaskComplete(TaskCompleteEvent {
                    last_agent_message,
                    rounds,
                }),
            },
        )
        .await;
    });

    RunningTask {
        sub_id,
        input_tx,
        handle,
    }
}

async fn send_event(
    event_tx: &mpsc::Sender<Event>,
    event: Event,
) -> Result<(), mpsc::error::SendError<Event>> {
    event_tx.send(event).await
}
