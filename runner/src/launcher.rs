// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! Blocking invocation of external tools.
//!
//! The pipeline never touches [`Command`] directly. It describes each tool
//! call as an [`Invocation`] and hands it to a [`ProcessLauncher`], so tests
//! can substitute a launcher that returns scripted exit codes.

use std::{
    ffi::OsString,
    fmt, io,
    process::Command,
    thread,
    time::{Duration, Instant},
};

use camino::Utf8PathBuf;

/// How often a child with a deadline is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A fully-resolved external tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// The executable, interpreted in some way by the OS/shell.
    pub program: OsString,

    /// Arguments, passed verbatim and in order.
    pub args: Vec<OsString>,

    /// Directory the child runs in.
    pub working_directory: Utf8PathBuf,

    /// If set, the child is killed once it has run this long.
    pub timeout: Option<Duration>,
}

impl Invocation {
    /// Renders the invocation the way a user would type it, for logs.
    pub fn command_line(&self) -> String {
        let mut line = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }
}

/// How a launched process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process exited on its own with this code.
    Exited(i32),

    /// The process was terminated by a signal and has no exit code.
    Signaled,

    /// The process outlived its timeout and was killed.
    TimedOut(Duration),
}

impl Termination {
    pub fn success(&self) -> bool {
        matches!(self, Termination::Exited(0))
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exited(code) => write!(f, "exit code {code}"),
            Termination::Signaled => "termination by signal".fmt(f),
            Termination::TimedOut(timeout) => {
                write!(f, "timeout after {}s", timeout.as_secs_f64())
            }
        }
    }
}

/// Runs an [`Invocation`] to completion.
pub trait ProcessLauncher {
    /// Blocks until the process described by `invocation` terminates.
    ///
    /// An `Err` means the process could not be started or waited on at all;
    /// a process that ran and failed is an `Ok` with a non-successful
    /// [`Termination`].
    fn launch(&mut self, invocation: &Invocation) -> io::Result<Termination>;
}

/// Launches real child processes. Standard streams are inherited, so tool
/// diagnostics go straight to the user.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn launch(&mut self, invocation: &Invocation) -> io::Result<Termination> {
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.working_directory)
            .spawn()?;

        // a deadline past what `Instant` can represent is never reached
        let deadline = invocation.timeout.and_then(|timeout| {
            Some((timeout, Instant::now().checked_add(timeout)?))
        });

        let status = match deadline {
            None => child.wait()?,
            Some((timeout, deadline)) => loop {
                if let Some(status) = child.try_wait()? {
                    break status;
                }
                if Instant::now() >= deadline {
                    // the child may exit between try_wait and kill
                    let _ = child.kill();
                    child.wait()?;
                    return Ok(Termination::TimedOut(timeout));
                }
                thread::sleep(POLL_INTERVAL);
            },
        };

        Ok(match status.code() {
            Some(code) => Termination::Exited(code),
            None => Termination::Signaled,
        })
    }
}
