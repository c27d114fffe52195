// src/exec/process.rs

//! `tokio::process` implementation of [`ToolProcess`].

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::exec::runner::{ProcessEvent, ToolExit, ToolProcess};

/// A child process with stdout and stderr merged into one line stream.
pub struct SpawnedProcess {
    child: Child,
    tool: String,
    lines: Option<mpsc::Receiver<String>>,
    exited: Option<ToolExit>,
}

impl SpawnedProcess {
    /// Spawn `program args...` in `cwd`.
    pub fn spawn(tool: &str, program: &str, args: &[String], cwd: &Path) -> Result<Self> {
        info!(tool, program, ?args, cwd = %cwd.display(), "starting tool process");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {tool} process '{program}'"))?;

        let (tx, rx) = mpsc::channel::<String>(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        Ok(Self {
            child,
            tool: tool.to_string(),
            lines: Some(rx),
            exited: None,
        })
    }

    async fn wait_child(&mut self) -> Result<ToolExit> {
        if let Some(exit) = self.exited {
            return Ok(exit);
        }
        let status = self
            .child
            .wait()
            .await
            .with_context(|| format!("waiting for {} process", self.tool))?;
        let exit = ToolExit {
            code: status.code(),
            success: status.success(),
        };
        debug!(tool = %self.tool, code = ?exit.code, success = exit.success, "tool process exited");
        self.exited = Some(exit);
        Ok(exit)
    }
}

/// Split on `\n` and `\r`: progress bars redraw with carriage returns.
async fn forward_lines<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<String>) {
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &byte in &buf[..n] {
            if byte == b'\n' || byte == b'\r' {
                if !pending.is_empty() {
                    let line = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    if tx.send(line).await.is_err() {
                        return;
                    }
                }
            } else {
                pending.push(byte);
            }
        }
    }
    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned()).await;
    }
}

impl ToolProcess for SpawnedProcess {
    fn next_event(&mut self) -> Pin<Box<dyn Future<Output = Option<ProcessEvent>> + Send + '_>> {
        Box::pin(async move {
            if let Some(rx) = self.lines.as_mut() {
                match rx.recv().await {
                    Some(line) => return Some(ProcessEvent::Line(line)),
                    None => self.lines = None,
                }
            }
            if self.exited.is_some() {
                return None;
            }
            match self.wait_child().await {
                Ok(exit) => Some(ProcessEvent::Exited(exit)),
                Err(err) => {
                    warn!(tool = %self.tool, error = %err, "lost track of tool process");
                    let exit = ToolExit::killed();
                    self.exited = Some(exit);
                    Some(ProcessEvent::Exited(exit))
                }
            }
        })
    }

    fn request_stop(&mut self) -> Result<()> {
        if self.exited.is_some() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                let pid = i32::try_from(pid).context("pid out of range")?;
                // SAFETY: plain syscall on a pid we spawned and still own.
                let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
                if rc != 0 {
                    return Err(std::io::Error::last_os_error())
                        .with_context(|| format!("sending SIGTERM to {} ({pid})", self.tool));
                }
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            self.child
                .start_kill()
                .with_context(|| format!("stopping {} process", self.tool))
        }
    }

    fn kill(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.exited.is_some() {
                return Ok(());
            }
            self.child
                .kill()
                .await
                .with_context(|| format!("killing {} process", self.tool))
        })
    }

    fn wait(&mut self) -> Pin<Box<dyn Future<Output = Result<ToolExit>> + Send + '_>> {
        Box::pin(async move {
            // Dropping the receiver lets the reader tasks finish.
            self.lines = None;
            self.wait_child().await
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn merges_output_and_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let args = vec![
            "-c".to_string(),
            "printf 'one\\rtwo\\n'; echo three >&2; exit 3".to_string(),
        ];
        let mut proc = SpawnedProcess::spawn("test", "sh", &args, dir.path()).unwrap();

        let mut lines = Vec::new();
        let mut exit = None;
        while let Some(event) = proc.next_event().await {
            match event {
                ProcessEvent::Line(l) => lines.push(l),
                ProcessEvent::Exited(e) => exit = Some(e),
            }
        }
        lines.sort();
        assert_eq!(lines, vec!["one", "three", "two"]);
        assert_eq!(
            exit,
            Some(ToolExit {
                code: Some(3),
                success: false
            })
        );
    }

    #[tokio::test]
    async fn sigterm_stops_a_sleeping_process() {
        let dir = tempfile::tempdir().unwrap();
        let args = vec!["-c".to_string(), "exec sleep 30".to_string()];
        let mut proc = SpawnedProcess::spawn("test", "sh", &args, dir.path()).unwrap();

        proc.request_stop().unwrap();
        let exit = tokio::time::timeout(std::time::Duration::from_secs(5), proc.wait())
            .await
            .expect("process should stop")
            .unwrap();
        assert!(!exit.success);
        assert_eq!(exit.code, None);
    }
}
