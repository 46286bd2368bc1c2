// src/notify.rs

//! Batch notifications.
//!
//! Delivery is delegated to an external command; the message is appended
//! to it as a single shell-quoted argument.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::exec::{shell_quote, Invocation, ToolInvoker};

pub trait Notifier: Send + Sync {
    fn notify<'a>(&'a self, message: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Drops every message.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify<'a>(&'a self, _message: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}

/// Sends messages by running `<command> '<message>'`.
pub struct CommandNotifier {
    command: String,
    invoker: Arc<dyn ToolInvoker>,
}

impl CommandNotifier {
    pub fn new(command: impl Into<String>, invoker: Arc<dyn ToolInvoker>) -> Self {
        Self {
            command: command.into(),
            invoker,
        }
    }

    pub fn command_line(&self, message: &str) -> String {
        format!("{} {}", self.command.trim(), shell_quote(message))
    }
}

impl Notifier for CommandNotifier {
    fn notify<'a>(&'a self, message: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let invocation = Invocation::new("notify", self.command_line(message));
            let output = self.invoker.invoke(&invocation).await?;
            if !output.success() {
                bail!(
                    "notification command exited with code {}",
                    output.exit_code
                );
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ToolOutput;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        commands: Mutex<Vec<String>>,
        exit_code: i32,
    }

    impl ToolInvoker for Recorder {
        fn invoke<'a>(
            &'a self,
            invocation: &'a Invocation,
        ) -> Pin<Box<dyn Future<Output = Result<ToolOutput>> + Send + 'a>> {
            Box::pin(async move {
                self.commands.lock().unwrap().push(invocation.command.clone());
                Ok(ToolOutput {
                    exit_code: self.exit_code,
                    stderr_tail: Vec::new(),
                })
            })
        }
    }

    #[tokio::test]
    async fn message_is_one_quoted_argument() {
        let recorder = Arc::new(Recorder::default());
        let notifier = CommandNotifier::new("python3 send_telegram.py", recorder.clone());
        notifier.notify("gibbs completed for all 3 subjects").await.unwrap();

        assert_eq!(
            recorder.commands.lock().unwrap().as_slice(),
            ["python3 send_telegram.py 'gibbs completed for all 3 subjects'"]
        );
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let recorder = Arc::new(Recorder {
            exit_code: 2,
            ..Recorder::default()
        });
        let notifier = CommandNotifier::new("notify-send", recorder);
        assert!(notifier.notify("hi").await.is_err());
    }
}
