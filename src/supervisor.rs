//! Worker lifecycle: spawn on demand, detect readiness from stdout, stop on
//! request or idleness, escalate to a forced kill when the worker lingers.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::error::ShellError;
use crate::events::{EventBus, ShellEvent};
use crate::idle::{IdleDeadline, IdleTimer};
use crate::readiness::{ReadinessGate, ReadinessWaiter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

/// Result of asking the supervisor to start the worker.
#[derive(Debug)]
pub enum StartOutcome {
    /// The worker already announced readiness.
    AlreadyRunning,
    /// A start attempt is in flight (fresh, already running, or queued
    /// behind a stopping worker). Wait on it before calling the worker.
    Pending(ReadinessWaiter),
}

/// Last worker exit that nobody asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitReport {
    pub code: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub last_crash: Option<ExitReport>,
}

enum Request {
    Start(oneshot::Sender<Result<StartOutcome, ShellError>>),
    Stop(oneshot::Sender<()>),
    Status(oneshot::Sender<SupervisorStatus>),
    Touch,
    Shutdown(oneshot::Sender<()>),
}

enum ProcessEvent {
    Stdout { attempt: u64, line: String },
    Stderr { attempt: u64, line: String },
    Exited { attempt: u64, code: Option<i32> },
    GraceElapsed { attempt: u64 },
}

/// Cheap, cloneable front for the supervisor task.
///
/// Dropping every handle shuts the supervisor down and kills the worker.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<Request>,
}

impl SupervisorHandle {
    /// Spawn the supervisor task. Must be called inside a tokio runtime.
    pub fn spawn(config: WorkerConfig, resource_dir: &Path, events: EventBus) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(config, resource_dir.to_path_buf(), events);
        tokio::spawn(supervisor.run(rx));
        Self { tx }
    }

    pub async fn start(&self) -> Result<StartOutcome, ShellError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Start(reply))?;
        rx.await.map_err(|_| ShellError::SupervisorGone)?
    }

    /// Request termination. Returns once the request is issued, not once the
    /// worker has exited.
    pub async fn stop(&self) -> Result<(), ShellError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Stop(reply))?;
        rx.await.map_err(|_| ShellError::SupervisorGone)
    }

    pub async fn status(&self) -> Result<SupervisorStatus, ShellError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Status(reply))?;
        rx.await.map_err(|_| ShellError::SupervisorGone)
    }

    pub async fn is_running(&self) -> bool {
        matches!(
            self.status().await,
            Ok(SupervisorStatus {
                state: WorkerState::Running,
                ..
            })
        )
    }

    /// Push the idle deadline one full window into the future.
    pub fn touch(&self) {
        let _ = self.send(Request::Touch);
    }

    /// Stop the worker, wait for it to exit and end the supervisor task.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Request::Shutdown(reply)).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, request: Request) -> Result<(), ShellError> {
        self.tx.send(request).map_err(|_| ShellError::SupervisorGone)
    }
}

struct WorkerHandle {
    attempt: u64,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl WorkerHandle {
    fn force_kill(&mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }
}

struct Supervisor {
    config: WorkerConfig,
    resource_dir: PathBuf,
    events: EventBus,
    state: WorkerState,
    worker: Option<WorkerHandle>,
    gate: ReadinessGate,
    idle: IdleTimer,
    idle_rx: mpsc::UnboundedReceiver<IdleDeadline>,
    process_tx: mpsc::UnboundedSender<ProcessEvent>,
    process_rx: mpsc::UnboundedReceiver<ProcessEvent>,
    /// Start requested while the previous worker was still stopping.
    restart_queued: bool,
    last_crash: Option<ExitReport>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    shutting_down: bool,
}

impl Supervisor {
    fn new(config: WorkerConfig, resource_dir: PathBuf, events: EventBus) -> Self {
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let (process_tx, process_rx) = mpsc::unbounded_channel();
        Self {
            config,
            resource_dir,
            events,
            state: WorkerState::Stopped,
            worker: None,
            gate: ReadinessGate::new(),
            idle: IdleTimer::new(idle_tx),
            idle_rx,
            process_tx,
            process_rx,
            restart_queued: false,
            last_crash: None,
            shutdown_waiters: Vec::new(),
            shutting_down: false,
        }
    }

    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        loop {
            if self.shutting_down && self.worker.is_none() {
                break;
            }

            tokio::select! {
                request = requests.recv(), if !self.shutting_down => match request {
                    Some(request) => self.on_request(request),
                    None => self.begin_shutdown(None),
                },
                Some(event) = self.process_rx.recv() => self.on_process_event(event),
                Some(deadline) = self.idle_rx.recv() => self.on_idle(deadline),
            }
        }

        self.idle.cancel();
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        info!("worker supervisor stopped");
    }

    fn on_request(&mut self, request: Request) {
        match request {
            Request::Start(reply) => {
                let _ = reply.send(self.start());
            }
            Request::Stop(reply) => {
                self.stop();
                let _ = reply.send(());
            }
            Request::Status(reply) => {
                let _ = reply.send(SupervisorStatus {
                    state: self.state,
                    pid: self.worker.as_ref().and_then(|worker| worker.pid),
                    last_crash: self.last_crash,
                });
            }
            Request::Touch => {
                self.idle.reset(self.config.idle_window());
            }
            Request::Shutdown(reply) => self.begin_shutdown(Some(reply)),
        }
    }

    fn on_process_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Stdout { attempt, line } => self.on_stdout(attempt, line),
            ProcessEvent::Stderr { line, .. } => error!(target: "worker", "{line}"),
            ProcessEvent::Exited { attempt, code } => self.on_exit(attempt, code),
            ProcessEvent::GraceElapsed { attempt } => {
                if self.state != WorkerState::Stopping {
                    return;
                }
                let grace = self.config.stop_grace();
                if let Some(worker) = self.current_worker(attempt) {
                    warn!("worker did not exit within {grace:?}, killing it");
                    worker.force_kill();
                }
            }
        }
    }

    fn start(&mut self) -> Result<StartOutcome, ShellError> {
        match self.state {
            WorkerState::Running => Ok(StartOutcome::AlreadyRunning),
            WorkerState::Starting => match self.gate.waiter() {
                Some(waiter) => Ok(StartOutcome::Pending(waiter)),
                None => Ok(StartOutcome::AlreadyRunning),
            },
            WorkerState::Stopping => {
                if !self.restart_queued {
                    info!("worker is stopping, restart queued");
                    self.restart_queued = true;
                    self.gate.arm();
                }
                match self.gate.waiter() {
                    Some(waiter) => Ok(StartOutcome::Pending(waiter)),
                    None => Ok(StartOutcome::AlreadyRunning),
                }
            }
            WorkerState::Stopped | WorkerState::Crashed => {
                let attempt = self.gate.arm();
                let waiter = self.gate.waiter();
                match self.spawn_worker(attempt) {
                    Ok(()) => Ok(waiter
                        .map(StartOutcome::Pending)
                        .unwrap_or(StartOutcome::AlreadyRunning)),
                    Err(err) => {
                        self.gate.discard();
                        Err(err)
                    }
                }
            }
        }
    }

    fn locate_entry(&self) -> Result<PathBuf, ShellError> {
        let entry = resolve_entry(&self.resource_dir, &self.config.entry);
        if !entry.exists() {
            return Err(ShellError::WorkerEntryMissing(entry));
        }
        Ok(entry)
    }

    fn spawn_worker(&mut self, attempt: u64) -> Result<(), ShellError> {
        let entry = match self.locate_entry() {
            Ok(entry) => entry,
            Err(err) => {
                error!("{err}");
                self.report_fatal(&err);
                return Err(err);
            }
        };

        info!("starting worker: {} {}", self.config.program, entry.display());
        let mut child = match Command::new(&self.config.program)
            .arg(&entry)
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                let err = ShellError::WorkerSpawn(err.to_string());
                error!("{err}");
                self.state = WorkerState::Crashed;
                self.report_fatal(&err);
                return Err(err);
            }
        };

        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, self.process_tx.clone(), move |line| {
                ProcessEvent::Stdout { attempt, line }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, self.process_tx.clone(), move |line| {
                ProcessEvent::Stderr { attempt, line }
            });
        }

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let tx = self.process_tx.clone();
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = status.ok().and_then(|status| status.code());
            let _ = tx.send(ProcessEvent::Exited { attempt, code });
        });

        self.worker = Some(WorkerHandle {
            attempt,
            pid,
            kill_tx: Some(kill_tx),
        });
        self.state = WorkerState::Starting;
        self.last_crash = None;
        Ok(())
    }

    fn on_stdout(&mut self, attempt: u64, line: String) {
        info!(target: "worker", "{line}");
        if self.state != WorkerState::Starting || self.current_worker(attempt).is_none() {
            return;
        }
        if line.contains(&self.config.ready_marker) {
            self.gate.signal(attempt);
            self.state = WorkerState::Running;
            info!("worker is ready");
            self.events.emit(ShellEvent::WorkerStarted);
        }
    }

    fn on_exit(&mut self, attempt: u64, code: Option<i32>) {
        if self.current_worker(attempt).is_none() {
            return;
        }
        self.worker = None;

        let unexpected = matches!(self.state, WorkerState::Starting | WorkerState::Running);
        self.state = WorkerState::Stopped;
        if unexpected {
            warn!("worker exited unexpectedly (code {code:?})");
            self.gate.discard();
            self.last_crash = Some(ExitReport { code });
        } else {
            info!("worker exited (code {code:?})");
        }
        self.events.emit(ShellEvent::WorkerStopped { code, unexpected });

        if self.restart_queued && !self.shutting_down {
            self.restart_queued = false;
            if let Some(attempt) = self.gate.attempt() {
                if self.spawn_worker(attempt).is_err() {
                    self.gate.discard();
                }
            }
        }
    }

    fn on_idle(&mut self, deadline: IdleDeadline) {
        if !self.idle.accept(deadline) {
            return;
        }
        if self.worker.is_some() {
            info!(
                "worker idle for {:?}, shutting it down",
                self.config.idle_window()
            );
            self.stop();
        }
    }

    fn stop(&mut self) {
        match self.state {
            WorkerState::Stopped => return,
            WorkerState::Crashed => {
                self.state = WorkerState::Stopped;
                return;
            }
            WorkerState::Stopping => {
                if self.restart_queued {
                    self.restart_queued = false;
                    self.gate.discard();
                }
                return;
            }
            WorkerState::Starting | WorkerState::Running => {}
        }

        self.gate.discard();
        self.idle.cancel();

        let Some(worker) = self.worker.as_mut() else {
            self.state = WorkerState::Stopped;
            return;
        };

        info!("stopping worker");
        self.state = WorkerState::Stopping;
        request_termination(worker);

        let attempt = worker.attempt;
        let grace = self.config.stop_grace();
        let tx = self.process_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(ProcessEvent::GraceElapsed { attempt });
        });
    }

    fn begin_shutdown(&mut self, reply: Option<oneshot::Sender<()>>) {
        self.shutting_down = true;
        self.restart_queued = false;
        self.stop();
        if let Some(reply) = reply {
            self.shutdown_waiters.push(reply);
        }
    }

    fn current_worker(&mut self, attempt: u64) -> Option<&mut WorkerHandle> {
        self.worker
            .as_mut()
            .filter(|worker| worker.attempt == attempt)
    }

    fn report_fatal(&self, err: &ShellError) {
        self.events.emit(ShellEvent::FatalError {
            title: "Startup error".to_string(),
            message: err.to_string(),
        });
    }
}

/// Relay `stream` line by line until EOF. Bytes that are not UTF-8 are
/// replaced, never fatal, so the pipe keeps draining.
fn forward_lines<R, F>(stream: R, tx: mpsc::UnboundedSender<ProcessEvent>, event: F)
where
    R: AsyncRead + Unpin + Send + 'static,
    F: Fn(String) -> ProcessEvent + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = String::from_utf8_lossy(&buf)
                .trim_end_matches(|ch| ch == '\n' || ch == '\r')
                .to_string();
            if tx.send(event(line)).is_err() {
                break;
            }
        }
    });
}

fn resolve_entry(resource_dir: &Path, entry: &Path) -> PathBuf {
    if entry.is_absolute() {
        entry.to_path_buf()
    } else {
        resource_dir.join(entry)
    }
}

#[cfg(unix)]
fn request_termination(worker: &mut WorkerHandle) {
    let Some(pid) = worker.pid else {
        worker.force_kill();
        return;
    };
    tokio::spawn(async move {
        let _ = Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .status()
            .await;
    });
}

#[cfg(not(unix))]
fn request_termination(worker: &mut WorkerHandle) {
    worker.force_kill();
}
