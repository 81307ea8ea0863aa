//! External command execution seam.
//!
//! Signature inspection relies on platform tooling. This module provides
//! the abstraction that lets production code shell out while tests
//! substitute predefined responses without side effects.

use std::process::{Command, Output};

/// Abstraction for running external commands.
pub trait CommandExecutor {
    /// Run a command with arguments and return the captured output.
    ///
    /// # Errors
    ///
    /// Returns any I/O error encountered while spawning the command.
    fn run(&self, cmd: &str, args: &[&str]) -> std::io::Result<Output>;
}

impl<T: CommandExecutor + ?Sized> CommandExecutor for &T {
    fn run(&self, cmd: &str, args: &[&str]) -> std::io::Result<Output> {
        (**self).run(cmd, args)
    }
}

/// Executes commands on the host system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandExecutor;

impl CommandExecutor for SystemCommandExecutor {
    fn run(&self, cmd: &str, args: &[&str]) -> std::io::Result<Output> {
        Command::new(cmd).args(args).output()
    }
}
