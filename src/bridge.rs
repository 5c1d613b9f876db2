//! Translates front-end commands into calls against the worker's local HTTP API.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::error::ShellError;
use crate::events::{EventBus, ShellEvent};
use crate::readiness::WaitOutcome;
use crate::store::SettingsStore;
use crate::supervisor::{StartOutcome, SupervisorHandle};

const DOWNLOAD_ENDPOINT: &str = "/api/download";
const STATUS_ENDPOINT: &str = "/api/status";

/// Uniform reply of every command: `{success, data}` or `{success, message}`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CommandResult<T = Value> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> CommandResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
        }
    }
}

impl CommandResult<()> {
    pub fn done() -> Self {
        Self {
            success: true,
            data: None,
            message: None,
        }
    }
}

impl<T> From<Result<T, ShellError>> for CommandResult<T> {
    fn from(result: Result<T, ShellError>) -> Self {
        match result {
            Ok(data) => CommandResult::ok(data),
            Err(err) => CommandResult::fail(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDownloadArgs {
    pub book_id: String,
}

#[derive(Serialize)]
struct DownloadRequest<'a> {
    book_id: &'a str,
    download_path: PathBuf,
    file_type: String,
}

pub struct CommandBridge {
    supervisor: SupervisorHandle,
    settings: Arc<SettingsStore>,
    events: EventBus,
    client: Client,
    base_url: String,
    readiness_timeout: Duration,
    /// Job state seen on the previous status poll.
    last_job_status: Mutex<Option<String>>,
}

impl CommandBridge {
    pub fn new(
        config: &WorkerConfig,
        supervisor: SupervisorHandle,
        settings: Arc<SettingsStore>,
        events: EventBus,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            supervisor,
            settings,
            events,
            client,
            base_url: config.base_url(),
            readiness_timeout: config.readiness_timeout(),
            last_job_status: Mutex::new(None),
        })
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    /// Keep the worker alive, start it if needed and wait (bounded) for it.
    pub async fn ensure_running(&self) -> Result<WaitOutcome, ShellError> {
        self.supervisor.touch();
        self.wake_worker().await
    }

    pub async fn start_download(&self, job_id: &str) -> CommandResult<Value> {
        info!("download requested, book_id: {job_id}");
        self.supervisor.touch();

        if job_id.is_empty() {
            error!("download request rejected: book id is empty");
            return CommandResult::fail(
                ShellError::InvalidArgument("book id must not be empty".into()).to_string(),
            );
        }

        let result = self.request_download(job_id).await;
        if let Err(err) = &result {
            error!("download of book {job_id} failed: {err}");
        }
        self.into_command_result(result).await
    }

    pub async fn check_status(&self) -> CommandResult<Value> {
        self.supervisor.touch();

        let result = self.request_status().await;
        match &result {
            Ok(data) => self.observe_job(data),
            Err(err) => error!("status check failed: {err}"),
        }
        self.into_command_result(result).await
    }

    async fn wake_worker(&self) -> Result<WaitOutcome, ShellError> {
        match self.supervisor.start().await? {
            StartOutcome::AlreadyRunning => Ok(WaitOutcome::Ready),
            StartOutcome::Pending(waiter) => {
                let outcome = waiter.wait(self.readiness_timeout).await;
                if outcome != WaitOutcome::Ready {
                    warn!("worker not ready ({outcome:?}), calling it anyway");
                }
                Ok(outcome)
            }
        }
    }

    async fn request_download(&self, job_id: &str) -> Result<Value, ShellError> {
        self.wake_worker().await?;

        let body = DownloadRequest {
            book_id: job_id,
            download_path: self.settings.download_path(),
            file_type: self.settings.file_type(),
        };
        info!(
            "sending download request, book_id: {job_id}, download_path: {}, file_type: {}",
            body.download_path.display(),
            body.file_type
        );

        let response = self
            .client
            .post(self.endpoint(DOWNLOAD_ENDPOINT))
            .json(&body)
            .send()
            .await?;
        read_reply(response).await
    }

    async fn request_status(&self) -> Result<Value, ShellError> {
        self.wake_worker().await?;
        let response = self.client.get(self.endpoint(STATUS_ENDPOINT)).send().await?;
        read_reply(response).await
    }

    /// The bridge call succeeded; whatever job state the worker reports is data.
    fn observe_job(&self, data: &Value) {
        let status = data
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if status == "error" {
            let reason = data
                .get("error_message")
                .and_then(Value::as_str)
                .unwrap_or("no details");
            warn!("backend reported an error: {reason}");
        }

        let previous = self.last_job_status.lock().replace(status.clone());
        match status.as_str() {
            "downloading" => self.events.emit(ShellEvent::DownloadProgress(data.clone())),
            "completed" if previous.as_deref() != Some("completed") => {
                self.events.emit(ShellEvent::DownloadComplete(data.clone()))
            }
            _ => {}
        }
    }

    async fn into_command_result(&self, result: Result<Value, ShellError>) -> CommandResult<Value> {
        match result {
            Ok(data) => CommandResult::ok(data),
            Err(err @ ShellError::Transport(_)) => {
                let mut message = err.to_string();
                if let Ok(status) = self.supervisor.status().await {
                    if let Some(crash) = status.last_crash {
                        let code = crash
                            .code
                            .map_or_else(|| "unknown".to_string(), |code| code.to_string());
                        message.push_str(&format!(" (worker exited unexpectedly, code {code})"));
                    }
                }
                CommandResult::fail(message)
            }
            Err(err) => CommandResult::fail(err.to_string()),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

async fn read_reply(response: Response) -> Result<Value, ShellError> {
    let status = response.status();
    let bytes = response.bytes().await?;
    let body = serde_json::from_slice::<Value>(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));

    if status.is_success() {
        return Ok(body);
    }

    let message = body
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| status.to_string());
    Err(ShellError::Backend {
        status: status.as_u16(),
        message,
    })
}
