//! Engine process lifecycle
//!
//! Every shard gets its own engine on its own port. [`QProcessLauncher`]
//! spawns a `q` process and waits for it to accept connections;
//! [`LocalLauncher`] hands out embedded engines. Either way the caller owns an
//! [`EngineWorker`] and must call [`EngineWorker::terminate`] when done.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tickload_common::ShardKey;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::command::EngineCommand;
use super::ipc::QIpcEngine;
use super::local::LocalEngine;
use super::{Engine, EngineError, EngineReply};
use crate::error::{IngestError, Result};

/// Number of distinct port offsets handed out to shards
pub const PORT_SPAN: u16 = 1000;

/// Port of the engine serving `shard`
///
/// Consecutive months map to consecutive ports, so any window of up to
/// [`PORT_SPAN`] months is collision free.
pub fn derive_port(base_port: u16, shard: ShardKey) -> Result<u16> {
    let offset = shard.ordinal().rem_euclid(i64::from(PORT_SPAN)) as u16;
    base_port.checked_add(offset).ok_or_else(|| {
        IngestError::Config(format!(
            "base port {base_port} leaves no room for shard {shard} (offset {offset})"
        ))
    })
}

/// Bounded retry with linear backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Base delay; attempt `n` waits `n * delay` before the next try
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay * attempt
    }
}

/// Starts engines for shards
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    /// Start an engine for `shard` listening on `port` and return once it answers
    async fn launch(&self, shard: ShardKey, port: u16) -> Result<EngineWorker>;

    /// Backend name used in logs
    fn name(&self) -> &'static str;
}

/// A running engine owned by one shard
pub struct EngineWorker {
    shard: ShardKey,
    port: u16,
    process: Option<Child>,
    engine: Box<dyn Engine>,
    shutdown_grace: Duration,
}

impl std::fmt::Debug for EngineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineWorker")
            .field("shard", &self.shard)
            .field("port", &self.port)
            .field("pid", &self.pid())
            .field("connected", &self.engine.is_connected())
            .finish()
    }
}

impl EngineWorker {
    pub fn new(
        shard: ShardKey,
        port: u16,
        engine: Box<dyn Engine>,
        process: Option<Child>,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            shard,
            port,
            process,
            engine,
            shutdown_grace,
        }
    }

    pub fn shard(&self) -> ShardKey {
        self.shard
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.id())
    }

    pub fn engine_mut(&mut self) -> &mut (dyn Engine + 'static) {
        self.engine.as_mut()
    }

    /// Send shutdown, close the connection, then reap or kill the process
    ///
    /// Never fails; every step is attempted regardless of the previous one.
    pub async fn terminate(mut self) {
        if self.engine.is_connected() {
            let shutdown = tokio::time::timeout(
                self.shutdown_grace,
                self.engine.execute(&EngineCommand::Shutdown),
            )
            .await;
            match shutdown {
                Ok(Ok(_)) => debug!(port = self.port, "Shutdown sent to engine"),
                Ok(Err(e)) => debug!(port = self.port, error = %e, "Engine shutdown command failed"),
                Err(_) => debug!(port = self.port, "Engine shutdown command timed out"),
            }
        }
        self.engine.close().await;

        if let Some(mut child) = self.process.take() {
            match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
                Ok(Ok(status)) => debug!(port = self.port, %status, "Engine process exited"),
                Ok(Err(e)) => warn!(port = self.port, error = %e, "Failed to reap engine process"),
                Err(_) => {
                    warn!(port = self.port, "Engine process ignored shutdown, killing it");
                    if let Err(e) = child.kill().await {
                        warn!(port = self.port, error = %e, "Failed to kill engine process");
                    }
                },
            }
        }
    }
}

impl Drop for EngineWorker {
    fn drop(&mut self) {
        if let Some(child) = self.process.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// Spawns `q -p <port> -s <threads>` processes
#[derive(Debug, Clone)]
pub struct QProcessLauncher {
    pub program: PathBuf,
    pub host: String,
    pub threads: u32,
    pub credentials: String,
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl QProcessLauncher {
    fn spawn(&self, port: u16) -> Result<Child> {
        Command::new(&self.program)
            .arg("-p")
            .arg(port.to_string())
            .arg("-s")
            .arg(self.threads.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| IngestError::EngineSpawn {
                program: self.program.display().to_string(),
                source,
            })
    }

    /// One connection attempt: handshake followed by a liveness ping
    async fn connect(&self, port: u16) -> std::result::Result<QIpcEngine, EngineError> {
        let mut engine =
            QIpcEngine::connect(&self.host, port, &self.credentials, self.connect_timeout).await?;
        match engine.execute(&EngineCommand::Ping).await? {
            EngineReply::Bool(true) => Ok(engine),
            other => {
                engine.close().await;
                Err(EngineError::Protocol(format!("unexpected ping reply {other:?}")))
            },
        }
    }
}

#[async_trait]
impl EngineLauncher for QProcessLauncher {
    async fn launch(&self, shard: ShardKey, port: u16) -> Result<EngineWorker> {
        let mut child = self.spawn(port)?;
        info!(shard = %shard, port, pid = child.id(), "Engine process spawned");

        let attempts = self.retry.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if let Some(status) = child.try_wait()? {
                return Err(IngestError::EngineStartupTimeout {
                    port,
                    attempts: attempt,
                    reason: format!("engine process exited early ({status})"),
                });
            }

            match self.connect(port).await {
                Ok(engine) => {
                    info!(
                        shard = %shard,
                        port,
                        attempt,
                        protocol_version = engine.protocol_version(),
                        "Engine ready"
                    );
                    return Ok(EngineWorker::new(
                        shard,
                        port,
                        Box::new(engine),
                        Some(child),
                        self.shutdown_grace,
                    ));
                },
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < attempts {
                        let delay = self.retry.delay_for(attempt);
                        debug!(
                            port,
                            "Engine connect attempt {}/{} failed: {}. Retrying in {:?}",
                            attempt,
                            attempts,
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                },
            }
        }

        if let Err(e) = child.kill().await {
            warn!(port, error = %e, "Failed to kill engine that never became ready");
        }
        Err(IngestError::EngineStartupTimeout {
            port,
            attempts,
            reason: last_error,
        })
    }

    fn name(&self) -> &'static str {
        "q"
    }
}

/// Hands out embedded engines; no process is spawned
#[derive(Debug, Clone, Default)]
pub struct LocalLauncher;

#[async_trait]
impl EngineLauncher for LocalLauncher {
    async fn launch(&self, shard: ShardKey, port: u16) -> Result<EngineWorker> {
        debug!(shard = %shard, port, "Embedded engine created");
        Ok(EngineWorker::new(
            shard,
            port,
            Box::new(LocalEngine::new()),
            None,
            Duration::from_secs(1),
        ))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
