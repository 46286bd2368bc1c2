// src/exec/mod.rs

//! External tool execution.
//!
//! - [`invoker`] provides the `ToolInvoker` trait and the production
//!   `ShellInvoker`, which tests replace with a fake.
//! - [`template`] renders `{name}` command templates.

pub mod invoker;
pub mod template;

pub use invoker::{Invocation, ShellInvoker, ToolInvoker, ToolOutput};
pub use template::{render, shell_quote, TemplateVars};
