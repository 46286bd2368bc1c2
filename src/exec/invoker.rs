// src/exec/invoker.rs

//! Pluggable tool invoker.
//!
//! Stage runners talk to a [`ToolInvoker`] instead of spawning processes
//! themselves, so tests can swap in a fake that records commands and
//! fabricates outputs.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

/// Number of trailing stderr lines kept for error messages.
pub const STDERR_TAIL_LINES: usize = 20;

/// One external command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Short name used in logs, e.g. `"gibbs:unring:AP"`.
    pub label: String,
    /// Complete shell command line.
    pub command: String,
    /// Files the command is expected to create.
    pub expected_outputs: Vec<PathBuf>,
}

impl Invocation {
    pub fn new(label: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            command: command.into(),
            expected_outputs: Vec::new(),
        }
    }

    pub fn expecting(mut self, outputs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.expected_outputs.extend(outputs);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code, or -1 when the process was killed by a signal.
    pub exit_code: i32,
    pub stderr_tail: Vec<String>,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs external tools. An `Err` means the tool could not be run at all;
/// a non-zero exit is reported through [`ToolOutput::exit_code`].
pub trait ToolInvoker: Send + Sync {
    fn invoke<'a>(
        &'a self,
        invocation: &'a Invocation,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput>> + Send + 'a>>;
}

/// Production invoker: `sh -c <command>`, awaited to completion.
#[derive(Debug, Clone, Default)]
pub struct ShellInvoker;

impl ToolInvoker for ShellInvoker {
    fn invoke<'a>(
        &'a self,
        invocation: &'a Invocation,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput>> + Send + 'a>> {
        Box::pin(run_shell(invocation))
    }
}

async fn run_shell(invocation: &Invocation) -> Result<ToolOutput> {
    info!(
        label = %invocation.label,
        cmd = %invocation.command,
        "starting tool"
    );

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&invocation.command);

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning process for '{}'", invocation.label))?;

    let stdout = child
        .stdout
        .take()
        .map(|s| tokio::spawn(drain_lines(s, invocation.label.clone(), "stdout", 0)));
    let stderr = child.stderr.take().map(|s| {
        tokio::spawn(drain_lines(
            s,
            invocation.label.clone(),
            "stderr",
            STDERR_TAIL_LINES,
        ))
    });

    let status = child
        .wait()
        .await
        .with_context(|| format!("waiting for process of '{}'", invocation.label))?;

    if let Some(handle) = stdout {
        let _ = handle.await;
    }
    let stderr_tail = match stderr {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Vec::new(),
    };

    let exit_code = status.code().unwrap_or(-1);
    info!(
        label = %invocation.label,
        exit_code,
        success = status.success(),
        "tool exited"
    );

    Ok(ToolOutput {
        exit_code,
        stderr_tail,
    })
}

/// Consume a pipe line by line, logging at debug and keeping the last `keep`.
async fn drain_lines<R>(reader: R, label: String, stream: &'static str, keep: usize) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(keep);
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        debug!(label = %label, "{}: {}", stream, line);
        if keep > 0 {
            if tail.len() == keep {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }

    tail.into_iter().collect()
}
