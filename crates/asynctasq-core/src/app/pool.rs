//! Process pool: offloads CPU-bound handlers to child processes.
//!
//! The async runtime must never run long CPU work on its own threads, and a
//! handler that chews a core for minutes is also the one most likely to leak
//! memory. CPU-bound tasks therefore go to a bounded pool of long-lived
//! children, each recycled after a configurable number of successful tasks.
//!
//! # Wire protocol
//! Newline-delimited JSON over stdin/stdout, one request in flight per
//! child: the parent writes a `PoolRequest` line, the child answers with one
//! `PoolResponse` line. A child that exits (or garbles the stream) mid-task
//! surfaces as `ErrorKind::ProcessCrash` and still counts as an attempt.
//!
//! The child is any binary that calls [`child_main`] with the same registry
//! (typically the worker binary itself invoked with a dedicated
//! subcommand).
//!
//! # Shutdown
//! Closing a child's stdin is the terminate signal (EOF ends `child_main`'s
//! read loop); children that outlive the grace period are killed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

use crate::domain::TaskError;
use crate::ports::serializer::Serializer;
use crate::typed::TaskRegistry;

/// How to spawn and recycle children.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Child binary; usually `std::env::current_exe()` plus a subcommand.
    pub program: PathBuf,
    pub args: Vec<String>,

    /// Number of long-lived children.
    pub size: usize,

    /// Recycle a child after this many successful tasks (bounds memory
    /// growth in leaky handler code). `None` keeps children forever.
    pub max_tasks_per_child: Option<u32>,
}

impl PoolConfig {
    pub fn new(program: impl Into<PathBuf>, size: usize) -> Self {
        Self { program: program.into(), args: Vec::new(), size, max_tasks_per_child: None }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_max_tasks_per_child(mut self, n: u32) -> Self {
        self.max_tasks_per_child = Some(n);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool size must be at least 1")]
    ZeroSize,

    #[error("failed to spawn pool child: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("pool child has no {0} pipe")]
    MissingPipe(&'static str),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PoolRequest {
    pub task_name: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum PoolResponse {
    Ok(Vec<u8>),
    Err(TaskError),
}

struct PoolChild {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    served: u32,
}

impl PoolChild {
    fn spawn(config: &PoolConfig) -> Result<Self, PoolError> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take().ok_or(PoolError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(PoolError::MissingPipe("stdout"))?;
        Ok(Self { child, stdin, stdout: BufReader::new(stdout).lines(), served: 0 })
    }
}

/// Bounded pool of long-lived children.
pub struct ProcessPool {
    config: PoolConfig,
    slots_tx: mpsc::Sender<PoolChild>,
    slots_rx: tokio::sync::Mutex<mpsc::Receiver<PoolChild>>,
}

impl ProcessPool {
    /// Spawn all children up front so a broken child command fails the
    /// worker at startup, not on the first CPU-bound task.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        if config.size == 0 {
            return Err(PoolError::ZeroSize);
        }
        let (slots_tx, slots_rx) = mpsc::channel(config.size);
        for _ in 0..config.size {
            let child = PoolChild::spawn(&config)?;
            slots_tx
                .try_send(child)
                .unwrap_or_else(|_| unreachable!("slot channel sized to pool"));
        }
        Ok(Self { config, slots_tx, slots_rx: tokio::sync::Mutex::new(slots_rx) })
    }

    /// Run one task on a pool child. The caller owns deadlines and
    /// cancellation: dropping this future mid-task kills and replaces the
    /// child (its stream is unusable once a request is half-done).
    pub async fn execute(&self, task_name: &str, payload: &[u8]) -> Result<Vec<u8>, TaskError> {
        let slot = {
            let mut rx = self.slots_rx.lock().await;
            rx.recv().await
        };
        let Some(child) = slot else {
            return Err(TaskError::process_crash("process pool is shut down"));
        };

        let mut guard = SlotGuard {
            child: Some(child),
            slots_tx: self.slots_tx.clone(),
            config: self.config.clone(),
            clean: false,
        };

        let request = PoolRequest { task_name: task_name.to_string(), payload: payload.to_vec() };
        let line = serde_json::to_string(&request)
            .map_err(|e| TaskError::serialization(format!("pool request encode: {e}")))?;

        let child = guard.child_mut();
        let write = async {
            child.stdin.write_all(line.as_bytes()).await?;
            child.stdin.write_all(b"\n").await?;
            child.stdin.flush().await
        };
        if let Err(err) = write.await {
            return Err(TaskError::process_crash(format!("pool child rejected request: {err}")));
        }

        match child.stdout.next_line().await {
            Ok(Some(line)) => {
                let response: PoolResponse = serde_json::from_str(&line).map_err(|e| {
                    TaskError::process_crash(format!("pool child spoke garbage: {e}"))
                })?;
                guard.complete().await;
                match response {
                    PoolResponse::Ok(bytes) => Ok(bytes),
                    PoolResponse::Err(task_error) => Err(task_error),
                }
            }
            Ok(None) => Err(TaskError::process_crash("pool child exited mid-task")),
            Err(err) => Err(TaskError::process_crash(format!("pool child read failed: {err}"))),
        }
    }

    /// Drain and stop every idle child: EOF first, then a bounded wait,
    /// then kill. Children currently out on loan are replaced-and-killed by
    /// their guards; the worker only calls this after the gate is empty.
    pub async fn shutdown(&self, grace: Duration) {
        let mut rx = self.slots_rx.lock().await;
        rx.close();
        while let Some(child) = rx.recv().await {
            let PoolChild { mut child, stdin, .. } = child;
            drop(stdin);
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                tracing::warn!("pool child ignored EOF for {grace:?}; killing");
                let _ = child.kill().await;
            }
        }
    }
}

/// Returns the child to the pool on success, replaces it on failure or
/// mid-task abandonment.
struct SlotGuard {
    child: Option<PoolChild>,
    slots_tx: mpsc::Sender<PoolChild>,
    config: PoolConfig,
    clean: bool,
}

impl SlotGuard {
    fn child_mut(&mut self) -> &mut PoolChild {
        self.child.as_mut().expect("slot present until drop")
    }

    /// Mark the request/response exchange finished; handles recycling.
    async fn complete(&mut self) {
        self.clean = true;
        let mut child = self.child.take().expect("slot present until drop");
        child.served += 1;

        let recycle = self
            .config
            .max_tasks_per_child
            .is_some_and(|max| child.served >= max);
        if !recycle {
            if self.slots_tx.send(child).await.is_err() {
                // pool shut down while we were running; kill_on_drop cleans up
            }
            return;
        }

        tracing::debug!(served = child.served, "recycling pool child");
        let PoolChild { child: process, stdin, .. } = child;
        let mut process = process;
        drop(stdin); // EOF: 子プロセスは読み終わったら自分で終了する
        tokio::spawn(async move {
            if tokio::time::timeout(Duration::from_secs(5), process.wait()).await.is_err() {
                let _ = process.kill().await;
            }
        });
        match PoolChild::spawn(&self.config) {
            Ok(fresh) => {
                let _ = self.slots_tx.try_send(fresh);
            }
            Err(err) => tracing::error!(%err, "failed to respawn pool child"),
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if !self.clean {
                // half-finished exchange: the stream is poisoned
                let _ = child.child.start_kill();
            }
        }
        if !self.clean {
            // replace the lost capacity with a fresh child
            match PoolChild::spawn(&self.config) {
                Ok(fresh) => {
                    let _ = self.slots_tx.try_send(fresh);
                }
                Err(err) => tracing::error!(%err, "failed to respawn pool child"),
            }
        }
    }
}

/// Entry point for the child side of the pool protocol.
///
/// Reads `PoolRequest` lines from stdin, runs the matching handler from
/// `registry`, writes one `PoolResponse` line per request. Returns when
/// stdin reaches EOF (the parent's terminate signal).
pub async fn child_main(
    registry: Arc<TaskRegistry>,
    serializer: Arc<dyn Serializer>,
) -> std::io::Result<()> {
    let mut requests = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = requests.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<PoolRequest>(&line) {
            Ok(request) => run_request(&registry, serializer.as_ref(), request).await,
            Err(err) => PoolResponse::Err(TaskError::serialization(format!("bad pool request: {err}"))),
        };
        let mut out = serde_json::to_vec(&response)
            .unwrap_or_else(|_| b"{\"Err\":{\"kind\":\"serialization\",\"message\":\"response encode failed\"}}".to_vec());
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn run_request(
    registry: &TaskRegistry,
    serializer: &dyn Serializer,
    request: PoolRequest,
) -> PoolResponse {
    let Some(entry) = registry.get(&request.task_name) else {
        return PoolResponse::Err(TaskError::unknown_task(&request.task_name));
    };
    let call = match serializer.decode(&request.payload) {
        Ok(call) => call,
        Err(err) => return PoolResponse::Err(TaskError::serialization(err.to_string())),
    };
    match entry.handler.handle_dyn(call).await {
        Ok(bytes) => PoolResponse::Ok(bytes),
        Err(task_error) => PoolResponse::Err(task_error),
    }
}
