//! The console adapter.
//!
//! Every non-empty input line becomes a `message.private` event in the
//! configured conversation. `send_message` writes the message as one output
//! line.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use brass_core::{
    Action, Adapter, AdapterContext, AdapterError, AdapterResult, AdapterState, ApiError,
    ApiResult, ConfigurableAdapter, EventKind,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::ConsoleConfig;

/// Line source.
pub type BoxedReader = Box<dyn AsyncBufRead + Send + Unpin>;
/// Line sink.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Event name for input lines.
pub const MESSAGE_EVENT: &str = "message.private";

/// Adapter over a line-oriented reader and writer (stdin/stdout by default).
pub struct ConsoleAdapter {
    config: ConsoleConfig,
    input: Mutex<Option<BoxedReader>>,
    output: tokio::sync::Mutex<BoxedWriter>,
    reader: Mutex<Option<JoinHandle<BoxedReader>>>,
    sent: AtomicU64,
}

impl ConsoleAdapter {
    /// Console adapter on the process's stdin and stdout.
    pub fn new(config: ConsoleConfig) -> Self {
        Self::with_io(
            config,
            Box::new(BufReader::new(tokio::io::stdin())),
            Box::new(tokio::io::stdout()),
        )
    }

    /// Console adapter on arbitrary I/O.
    pub fn with_io(config: ConsoleConfig, input: BoxedReader, output: BoxedWriter) -> Self {
        Self {
            config,
            input: Mutex::new(Some(input)),
            output: tokio::sync::Mutex::new(output),
            reader: Mutex::new(None),
            sent: AtomicU64::new(0),
        }
    }

    /// Returns the adapter configuration.
    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    async fn send_message(&self, action: &Action) -> ApiResult<Value> {
        let conversation = action.str_param("conversation_id")?;
        if conversation != self.config.conversation {
            return Err(ApiError::InvalidParams {
                action: action.name.clone(),
                reason: format!("unknown conversation '{conversation}'"),
            });
        }
        let message = action.str_param("message")?;

        let mut output = self.output.lock().await;
        let line = format!("{}{}\n", self.config.reply_prefix, message);
        output
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ApiError::Failed(e.to_string()))?;
        output
            .flush()
            .await
            .map_err(|e| ApiError::Failed(e.to_string()))?;

        let message_id = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(json!({ "message_id": message_id }))
    }
}

impl Default for ConsoleAdapter {
    fn default() -> Self {
        Self::new(ConsoleConfig::default())
    }
}

/// Reads lines until EOF, a read error, closed intake or shutdown. Hands the
/// reader back so the adapter can be started again.
///
/// Bytes that are not valid UTF-8 are replaced, so one bad line never ends
/// the input. EOF and read errors are reported as `Stopped`.
async fn read_lines(ctx: AdapterContext, mut input: BoxedReader, config: ConsoleConfig) -> BoxedReader {
    let shutdown = ctx.shutdown_token().clone();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            read = input.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => {
                info!(adapter = %ctx.adapter_id(), "Console input closed");
                ctx.set_state(AdapterState::Stopped);
                break;
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let text = line.trim_end_matches(['\r', '\n']);
                if text.trim().is_empty() {
                    continue;
                }
                trace!(adapter = %ctx.adapter_id(), text, "console line");
                let event = ctx
                    .event(EventKind::Message)
                    .name(MESSAGE_EVENT)
                    .conversation(config.conversation.as_str())
                    .text(text)
                    .payload(json!({ "user_id": config.user }))
                    .build();
                if let Err(e) = ctx.emit(event).await {
                    debug!(adapter = %ctx.adapter_id(), error = %e, "event intake closed");
                    break;
                }
            }
            Err(e) => {
                warn!(adapter = %ctx.adapter_id(), error = %e, "console read failed");
                ctx.set_state(AdapterState::Stopped);
                break;
            }
        }
    }
    input
}

#[async_trait]
impl Adapter for ConsoleAdapter {
    async fn start(&self, ctx: AdapterContext) -> AdapterResult<()> {
        // A reader that ended on its own (EOF, read error) still holds the input.
        let finished = {
            let mut reader = self.reader.lock();
            if reader.as_ref().is_some_and(|task| task.is_finished()) {
                reader.take()
            } else {
                None
            }
        };
        if let Some(task) = finished {
            if let Ok(input) = task.await {
                self.input.lock().get_or_insert(input);
            }
        }

        let input = self
            .input
            .lock()
            .take()
            .ok_or_else(|| AdapterError::StartFailed("console input is already in use".into()))?;

        info!(
            adapter = %ctx.adapter_id(),
            conversation = %self.config.conversation,
            "Console adapter reading input"
        );
        let task = tokio::spawn(read_lines(ctx, input, self.config.clone()));
        *self.reader.lock() = Some(task);
        Ok(())
    }

    async fn stop(&self) -> AdapterResult<()> {
        let task = self.reader.lock().take();
        if let Some(task) = task {
            let input = task
                .await
                .map_err(|e| AdapterError::StopFailed(e.to_string()))?;
            *self.input.lock() = Some(input);
        }
        self.output.lock().await.flush().await?;
        Ok(())
    }

    async fn call_api(&self, action: Action) -> ApiResult<Value> {
        match action.name.as_str() {
            Action::SEND_MESSAGE => self.send_message(&action).await,
            _ => Err(ApiError::UnsupportedAction {
                action: action.name,
            }),
        }
    }
}

impl ConfigurableAdapter for ConsoleAdapter {
    type Config = ConsoleConfig;

    fn name() -> &'static str {
        "console"
    }

    fn from_config(config: Self::Config) -> AdapterResult<Arc<Self>> {
        if config.conversation.is_empty() {
            return Err(AdapterError::InvalidConfig(
                "console conversation id must not be empty".into(),
            ));
        }
        Ok(Arc::new(Self::new(config)))
    }
}
