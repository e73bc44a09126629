use anyhow::Context;
use futures::Stream;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Poll;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::PtyError;

const READ_BUFFER_SIZE: usize = 4096;
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// The user's login shell, falling back to `/bin/bash`.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string())
}

/// Configuration for spawning a PTY
#[derive(Clone, Debug)]
pub struct PtyConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            command: default_shell(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            rows: 24,
            cols: 80,
        }
    }
}

/// Messages that can be sent to the PTY actor
pub(crate) enum PtyMessage {
    WriteInput {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<usize, PtyError>>,
    },
    Close {
        respond_to: oneshot::Sender<()>,
    },
}

/// Lazy sequence of output chunks read from the PTY.
///
/// Ends when the process exits, the PTY read fails, or the session is
/// closed. A finished stream cannot be restarted; spawn a new session.
pub struct PtyOutput {
    receiver: mpsc::Receiver<Vec<u8>>,
}

impl Stream for PtyOutput {
    type Item = Vec<u8>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Handle to a shell running on a PTY.
///
/// Cloning the handle is cheap; all clones talk to the same actor. The
/// process is terminated by `close()` or once every clone is dropped.
#[derive(Clone)]
pub struct PtySession {
    sender: mpsc::Sender<PtyMessage>,
    running: Arc<AtomicBool>,
    pid: Option<u32>,
}

impl PtySession {
    /// Spawn a new PTY and return a handle to it along with its output stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: PtyConfig) -> Result<(Self, PtyOutput), PtyError> {
        PtyActor::spawn(config)
    }

    /// Write data to the PTY
    pub async fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::WriteInput {
                data: data.to_vec(),
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ProcessExited)?;
        // The actor drops queued requests once it has shut down
        rx.await.map_err(|_| PtyError::ProcessExited)?
    }

    /// Terminate the process and release the PTY. Safe to call repeatedly.
    pub async fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(PtyMessage::Close { respond_to: tx })
            .await
            .is_err()
        {
            // Actor already gone
            return;
        }
        let _ = rx.await;
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// False once the output stream has hit EOF or `close()` was called.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// The PTY actor that manages a single PTY session
struct PtyActor {
    master: Box<dyn MasterPty + Send>,
    writer: Option<Box<dyn Write + Send>>,
    child: Option<Box<dyn Child + Send + Sync>>,
    command: String,
    pid: Option<u32>,
    receiver: mpsc::Receiver<PtyMessage>,
}

impl PtyActor {
    fn spawn(config: PtyConfig) -> Result<(PtySession, PtyOutput), PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&config.command);
        for arg in &config.args {
            cmd.arg(arg);
        }

        if let Some(dir) = &config.working_dir {
            debug!("Setting working directory: {}", dir);
            cmd.cwd(dir);
        }

        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        for key in ["PATH", "HOME", "USER", "LANG"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        info!(
            "Spawning PTY command: {} with args: {:?}",
            config.command, config.args
        );

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("Failed to spawn command '{}': {}", config.command, e);
            PtyError::CreateFailed(e.to_string())
        })?;
        // The child holds its own copy of the slave side; dropping ours lets
        // the master observe EOF once the process exits.
        drop(pair.slave);

        let pid = child.process_id();
        info!("PTY process started with PID: {:?}", pid);

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (msg_tx, msg_rx) = mpsc::channel(32);
        let running = Arc::new(AtomicBool::new(true));

        let reader_running = running.clone();
        std::thread::spawn(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        debug!("PTY EOF detected - process has exited");
                        break;
                    }
                    Ok(n) => {
                        if output_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                            debug!("PTY output receiver dropped");
                            break;
                        }
                    }
                    Err(e) => {
                        // EIO is how Linux reports a hung-up master
                        debug!("PTY read ended: {}", e);
                        break;
                    }
                }
            }
            reader_running.store(false, Ordering::SeqCst);
            debug!("PTY reader thread exiting");
        });

        let mut actor = Self {
            master: pair.master,
            writer: None,
            child: Some(child),
            command: config.command,
            pid,
            receiver: msg_rx,
        };

        tokio::spawn(async move {
            actor.run().await;
        });

        Ok((
            PtySession {
                sender: msg_tx,
                running,
                pid,
            },
            PtyOutput {
                receiver: output_rx,
            },
        ))
    }

    async fn run(&mut self) {
        debug!(
            "PTY actor started for command: {} with PID: {:?}",
            self.command, self.pid
        );

        // Take the writer immediately to keep the PTY stdin open
        match self.master.take_writer() {
            Ok(writer) => self.writer = Some(writer),
            Err(e) => error!("Failed to get PTY writer: {}", e),
        }

        while let Some(msg) = self.receiver.recv().await {
            match msg {
                PtyMessage::WriteInput { data, respond_to } => {
                    let result = self.handle_write_input(&data);
                    let _ = respond_to.send(result);
                }
                PtyMessage::Close { respond_to } => {
                    self.terminate();
                    let _ = respond_to.send(());
                    break;
                }
            }
        }

        // Every handle dropped without an explicit close
        self.terminate();
        debug!("PTY actor shutting down");
    }

    fn handle_write_input(&mut self, data: &[u8]) -> Result<usize, PtyError> {
        if self.child.is_none() {
            return Err(PtyError::ProcessExited);
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PtyError::WriteFailed("No PTY writer available".into()))?;

        writer
            .write_all(data)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;

        Ok(data.len())
    }

    fn terminate(&mut self) {
        self.writer = None;
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Ok(Some(status)) = child.try_wait() {
            info!("PTY process exited with status: {:?}", status);
            return;
        }

        // portable-pty sends SIGHUP, waits a short grace period, then kills;
        // that sleeps, so keep it off the async workers.
        let pid = self.pid;
        tokio::task::spawn_blocking(move || {
            if let Err(e) = child.kill() {
                warn!("Failed to kill PTY process {:?}: {}", pid, e);
            }
            match child.wait() {
                Ok(status) => info!("PTY process {:?} exited with status: {:?}", pid, status),
                Err(e) => warn!("Failed to reap PTY process {:?}: {}", pid, e),
            }
        });
    }
}
