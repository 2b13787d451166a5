//! Local PTY bridge
//!
//! Runs a local shell on a pseudo-terminal and exposes it as a
//! [`LinkChannel`], so local sessions share the channel machinery with remote
//! shells. PTY I/O is blocking and runs on the blocking pool.

use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use tl_core::error::{ChannelError, SessionError};
use tl_core::traits::{ChannelControl, ChannelInput, LinkChannel};
use tl_core::types::LocalShellParams;
use tl_protocol::TerminalSize;

use super::shells::{default_shell, validate_shell_path};

/// Read buffer size for PTY output
const READ_BUFFER_SIZE: usize = 8192;

/// Queue depth between the reader thread and the channel demux
const INBOUND_QUEUE_DEPTH: usize = 64;

/// A started local shell
pub struct LocalShell {
    /// Shell executable
    pub shell: String,
    /// Process ID, when the platform reports one
    pub pid: Option<u32>,
    /// Byte channel to the shell
    pub channel: LinkChannel,
}

/// Start a shell on a new PTY
pub fn spawn_local(params: &LocalShellParams, term: &str) -> Result<LocalShell, SessionError> {
    let requested = params.shell.clone().unwrap_or_else(default_shell);
    let shell = validate_shell_path(&requested)?;

    tracing::info!(
        "Starting local shell {} ({}x{})",
        shell,
        params.size.cols,
        params.size.rows
    );

    let pair = native_pty_system()
        .openpty(pty_size(params.size))
        .map_err(|e| SessionError::PtyAllocation(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&shell);
    if let Some(cwd) = &params.cwd {
        cmd.cwd(cwd);
    }
    cmd.env("TERM", term);
    for (key, value) in &params.env {
        cmd.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| SessionError::PtyAllocation(format!("failed to spawn {}: {}", shell, e)))?;
    // The reader sees EOF only once no slave handle is left open here.
    drop(pair.slave);

    let pid = child.process_id();
    tracing::debug!("Local shell {} started with pid {:?}", shell, pid);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| SessionError::PtyAllocation(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| SessionError::PtyAllocation(e.to_string()))?;
    let killer = child.clone_killer();

    let (tx, inbound) = mpsc::channel(INBOUND_QUEUE_DEPTH);

    let output = tx.clone();
    tokio::task::spawn_blocking(move || read_output(reader, output));

    tokio::task::spawn_blocking(move || match child.wait() {
        Ok(status) => {
            tracing::info!("Local shell exited with {}", status.exit_code());
            let _ = tx.blocking_send(ChannelInput::ExitStatus(status.exit_code()));
        }
        Err(e) => tracing::warn!("Waiting for local shell failed: {}", e),
    });

    let control = PtyControl {
        master: Mutex::new(Some(pair.master)),
        writer: Arc::new(Mutex::new(Some(writer))),
        killer: Mutex::new(killer),
    };

    Ok(LocalShell {
        shell,
        pid,
        channel: LinkChannel {
            inbound,
            control: Arc::new(control),
        },
    })
}

fn read_output(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<ChannelInput>) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if tx.blocking_send(ChannelInput::Data(data)).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO once the shell side is gone.
            Err(_) => break,
        }
    }
    let _ = tx.blocking_send(ChannelInput::Eof);
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

type PtyWriter = Box<dyn Write + Send>;

/// Outbound half of a local shell
struct PtyControl {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Arc<Mutex<Option<PtyWriter>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

fn closed() -> ChannelError {
    ChannelError::Closed("local shell".to_string())
}

#[async_trait]
impl ChannelControl for PtyControl {
    async fn write(&self, data: Bytes) -> Result<(), ChannelError> {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = writer.lock().map_err(|_| closed())?;
            let writer = guard.as_mut().ok_or_else(closed)?;
            writer.write_all(&data).map_err(|_| closed())?;
            writer.flush().map_err(|_| closed())
        })
        .await
        .map_err(|_| closed())?
    }

    async fn resize(&self, size: TerminalSize) -> Result<(), ChannelError> {
        tracing::debug!("Resizing local shell to {}x{}", size.cols, size.rows);
        let guard = self.master.lock().map_err(|_| closed())?;
        let master = guard.as_ref().ok_or_else(closed)?;
        master
            .resize(pty_size(size))
            .map_err(|e| ChannelError::Closed(e.to_string()))
    }

    async fn eof(&self) -> Result<(), ChannelError> {
        // Ctrl-D at the start of a line.
        self.write(Bytes::from_static(&[0x04])).await
    }

    async fn close(&self) -> Result<(), ChannelError> {
        if let Ok(mut killer) = self.killer.lock() {
            if let Err(e) = killer.kill() {
                tracing::trace!("Killing local shell: {}", e);
            }
        }
        if let Ok(mut writer) = self.writer.lock() {
            writer.take();
        }
        if let Ok(mut master) = self.master.lock() {
            master.take();
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn collect_until(
        inbound: &mut mpsc::Receiver<ChannelInput>,
        needle: &str,
    ) -> String {
        let mut out = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !out.contains(needle) {
            let item = tokio::time::timeout_at(deadline, inbound.recv())
                .await
                .expect("timed out waiting for shell output");
            match item {
                Some(ChannelInput::Data(data)) => out.push_str(&String::from_utf8_lossy(&data)),
                Some(_) => {}
                None => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn test_shell_echo_and_exit_code() {
        let params = LocalShellParams {
            shell: Some("/bin/sh".to_string()),
            ..Default::default()
        };
        let mut shell = spawn_local(&params, "xterm-256color").unwrap();
        assert_eq!(shell.shell, "/bin/sh");

        shell
            .channel
            .control
            .write(Bytes::from_static(b"echo termlink-$((40+2))\n"))
            .await
            .unwrap();
        let out = collect_until(&mut shell.channel.inbound, "termlink-42").await;
        assert!(out.contains("termlink-42"));

        shell
            .channel
            .control
            .write(Bytes::from_static(b"exit 3\n"))
            .await
            .unwrap();

        let mut exit = None;
        while let Some(item) = shell.channel.inbound.recv().await {
            if let ChannelInput::ExitStatus(code) = item {
                exit = Some(code);
            }
        }
        assert_eq!(exit, Some(3));
    }

    #[test]
    fn test_rejects_disallowed_shell() {
        let params = LocalShellParams {
            shell: Some("/usr/bin/env".to_string()),
            ..Default::default()
        };
        let err = spawn_local(&params, "xterm").err().unwrap();
        assert_eq!(err.code(), "InvalidShell");
    }
}
