use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use dwiprep::exec::{Invocation, ToolInvoker, ToolOutput};
use dwiprep::fs::FileSystem;

type ExtraOutputs = Box<dyn Fn(&Invocation) -> Vec<PathBuf> + Send + Sync>;

enum Behaviour {
    Exit(i32),
    SkipOutputs,
    SpawnError,
    Extra(ExtraOutputs),
}

struct Rule {
    needle: String,
    behaviour: Behaviour,
}

/// A fake tool invoker that:
/// - records every invocation
/// - writes each expected output with placeholder contents and exits 0,
///   unless a rule matching the label or command line says otherwise.
pub struct FakeInvoker {
    fs: Arc<dyn FileSystem>,
    calls: Mutex<Vec<Invocation>>,
    rules: Mutex<Vec<Rule>>,
}

impl FakeInvoker {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            calls: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, needle: &str, behaviour: Behaviour) {
        self.rules.lock().unwrap().push(Rule {
            needle: needle.to_string(),
            behaviour,
        });
    }

    /// Exit with `code` (and write nothing) when `needle` matches.
    pub fn fail_when(&self, needle: &str, code: i32) {
        self.push(needle, Behaviour::Exit(code));
    }

    /// Exit 0 without writing the expected outputs.
    pub fn skip_outputs_when(&self, needle: &str) {
        self.push(needle, Behaviour::SkipOutputs);
    }

    /// Fail to start at all.
    pub fn spawn_error_when(&self, needle: &str) {
        self.push(needle, Behaviour::SpawnError);
    }

    /// Write extra files besides the expected outputs.
    pub fn also_create_when(
        &self,
        needle: &str,
        extra: impl Fn(&Invocation) -> Vec<PathBuf> + Send + Sync + 'static,
    ) {
        self.push(needle, Behaviour::Extra(Box::new(extra)));
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.label).collect()
    }

    /// Command lines whose label contains `needle`.
    pub fn commands_for(&self, needle: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.label.contains(needle))
            .map(|c| c.command)
            .collect()
    }

    fn write_outputs(&self, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            self.fs.write(path, b"fake output\n")?;
        }
        Ok(())
    }
}

impl ToolInvoker for FakeInvoker {
    fn invoke<'a>(
        &'a self,
        invocation: &'a Invocation,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(invocation.clone());

            let rules = self.rules.lock().unwrap();
            let matching = rules.iter().find(|r| {
                invocation.label.contains(&r.needle) || invocation.command.contains(&r.needle)
            });

            match matching.map(|r| &r.behaviour) {
                Some(Behaviour::Exit(code)) => Ok(ToolOutput {
                    exit_code: *code,
                    stderr_tail: vec![format!("{} failed on purpose", invocation.label)],
                }),
                Some(Behaviour::SkipOutputs) => Ok(ToolOutput::default()),
                Some(Behaviour::SpawnError) => Err(anyhow!("sh: not found")),
                Some(Behaviour::Extra(extra)) => {
                    self.write_outputs(&invocation.expected_outputs)?;
                    self.write_outputs(&extra(invocation))?;
                    Ok(ToolOutput::default())
                }
                None => {
                    self.write_outputs(&invocation.expected_outputs)?;
                    Ok(ToolOutput::default())
                }
            }
        })
    }
}
