//! Small process-related helpers shared across the workspace.
//!
//! - [`split_command_line`] turns a configured command template into argv.
//! - [`spawn_group`] starts a helper in its own process group so that the
//!   helper and everything it forks can be signalled together.
//! - [`GroupChild::terminate`] implements graceful-then-forced teardown.

mod command_line;
mod group;

use std::ffi::OsStr;

pub use command_line::{CommandLineError, split_command_line};
pub use group::{GroupChild, SpawnError, TerminationOutcome, TerminationPolicy, spawn_group};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}
