use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turnstile_kernel_config::{load_local_model_config, load_loop_settings};
use turnstile_kernel_core::{
    KernelConfig, KernelRuntime, LoopConfig, ToolLoop, DEFAULT_MAX_ROUNDS,
};
use turnstile_kernel_model::{HttpToolDispatcher, ResponsesEventSource};
use turnstile_kernel_protocol::{EventMsg, Submission};

#[tokio::main]
async fn main() -> io::Result<()> {
    // stdout carries the event protocol, so logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let model_config = load_local_model_config().map_err(config_error)?;
    let settings = load_loop_settings().map_err(config_error)?;
    info!(
        model = %model_config.model,
        base_url = %model_config.base_url,
        max_tool_rounds = ?settings.max_tool_rounds,
        "starting kernel bridge"
    );

    let tool_loop = ToolLoop::new(
        Arc::new(ResponsesEventSource::new(model_config.clone())),
        Arc::new(HttpToolDispatcher::from_config(&model_config)),
        LoopConfig {
            max_rounds: settings.max_tool_rounds.unwrap_or(DEFAULT_MAX_ROUNDS),
            stream_idle_timeout: settings.stream_idle_timeout,
            strict_protocol: settings.strict_protocol,
        },
    );
    let kernel_config = KernelConfig {
        reasoning_enabled: settings.reasoning_enabled,
        ..KernelConfig::default()
    };

    let mut runtime = KernelRuntime::spawn(kernel_config, tool_loop);
    let submission_tx = runtime.submission_sender();

    let stdin_task = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let submission = match serde_json::from_str::<Submission>(&line) {
                Ok(item) => item,
                Err(err) => {
                    warn!("invalid submission json: {err}");
                    continue;
                }
            };

            if submission_tx.send(submission).await.is_err() {
                break;
            }
        }

        Ok::<(), io::Error>(())
    });

    let mut stdout = tokio::io::stdout();
    while let Some(event) = runtime.events_mut().recv().await {
        let line = serde_json::to_string(&event)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;

        if matches!(event.msg, EventMsg::ShutdownComplete) {
            break;
        }
    }

    stdin_task.abort();

    runtime
        .join()
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;

    Ok(())
}

fn config_error(err: turnstile_kernel_config::ConfigError) -> io::Error {
    tracing::error!("failed to load configuration: {err}");
    io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
}
