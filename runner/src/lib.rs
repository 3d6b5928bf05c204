// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! This module implements the generate/combine/simulate pipeline.
//!
//! A [`Pipeline`] runs three steps in order and stops at the first failure:
//!
//! 1. The generator turns a source file into a VHDL fragment.
//! 2. The fragment list (typically a prolog, the generated fragment, and an
//!    epilog) is concatenated byte for byte into the combined artifact.
//! 3. The simulator compiles and runs the combined artifact's top-level
//!    entity, writing a waveform.
//!
//! External processes go through a [`ProcessLauncher`] and file access
//! through an [`ArtifactStore`], so the pipeline can be exercised without
//! real tools or a real filesystem.

use std::{ffi::OsString, fmt, io, io::Write, time::Duration};

use camino::{Utf8Path, Utf8PathBuf};
use snafu::{ResultExt, Snafu, Whatever};

pub mod config;
pub mod launcher;
pub mod store;

pub use config::PipelineConfig;
pub use launcher::{Invocation, ProcessLauncher, SystemLauncher, Termination};
pub use store::{ArtifactStore, DiskStore, MemoryStore};

use store::{AppendError, append};

/// The three pipeline steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Generate,
    Concatenate,
    Simulate,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Generate => "generate",
            Step::Concatenate => "concatenate",
            Step::Simulate => "simulate",
        }
        .fmt(f)
    }
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("nonzero exit code {code}"),
        None => "termination by signal".into(),
    }
}

#[derive(Debug, Snafu)]
pub enum PipelineError {
    /// The generator ran but did not exit successfully. `exit_code` is `None`
    /// if it was killed by a signal.
    #[snafu(display("Generator failed with {}", describe_exit(exit_code)))]
    GenerationFailed { exit_code: Option<i32> },

    #[snafu(display("Failed to read fragment {path}"))]
    FragmentReadFailed { path: Utf8PathBuf, source: io::Error },

    #[snafu(display("Failed to write combined artifact {path}"))]
    CombinedWriteFailed { path: Utf8PathBuf, source: io::Error },

    /// The simulator ran but did not exit successfully. `exit_code` is `None`
    /// if it was killed by a signal.
    #[snafu(display("Simulator failed with {}", describe_exit(exit_code)))]
    SimulationFailed { exit_code: Option<i32> },

    /// The process could not be started or waited on.
    #[snafu(display("Invocation of `{program}` for the {step} step failed"))]
    LaunchFailed {
        step: Step,
        program: String,
        source: io::Error,
    },

    #[snafu(display(
        "The {step} step was killed after exceeding its {}s timeout",
        timeout.as_secs_f64()
    ))]
    TimedOut { step: Step, timeout: Duration },
}

impl PipelineError {
    /// The step that failed.
    pub fn step(&self) -> Step {
        match self {
            PipelineError::GenerationFailed { .. } => Step::Generate,
            PipelineError::FragmentReadFailed { .. }
            | PipelineError::CombinedWriteFailed { .. } => Step::Concatenate,
            PipelineError::SimulationFailed { .. } => Step::Simulate,
            PipelineError::LaunchFailed { step, .. }
            | PipelineError::TimedOut { step, .. } => *step,
        }
    }
}

fn exit_code(termination: Termination) -> Option<i32> {
    match termination {
        Termination::Exited(code) => Some(code),
        Termination::Signaled | Termination::TimedOut(_) => None,
    }
}

/// Runs the generate/combine/simulate sequence described by a
/// [`PipelineConfig`].
pub struct Pipeline<L = SystemLauncher, S = DiskStore> {
    config: PipelineConfig,
    launcher: L,
    store: S,
}

impl Pipeline {
    /// Creates a pipeline that launches real processes and reads and writes
    /// files under `config.working_directory`.
    pub fn new(config: PipelineConfig) -> Result<Self, Whatever> {
        let store = DiskStore::new(config.working_directory.clone());
        Self::with_capabilities(config, SystemLauncher, store)
    }
}

impl<L: ProcessLauncher, S: ArtifactStore> Pipeline<L, S> {
    /// Creates a pipeline with caller-supplied process and file access.
    pub fn with_capabilities(
        config: PipelineConfig,
        launcher: L,
        store: S,
    ) -> Result<Self, Whatever> {
        if config.log {
            log::info!("Validating pipeline configuration");
        }
        config.validate()?;

        Ok(Self {
            config,
            launcher,
            store,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Bare program names are left for `PATH` lookup; relative paths with a
    /// directory component are anchored at the working directory and made
    /// absolute, since `Command` leaves the interpretation of a relative
    /// program platform-specific once the child's directory changes.
    fn program(&self, path: &Utf8Path) -> OsString {
        if path.is_relative() && path.components().count() > 1 {
            let anchored = self.config.working_directory.join(path);
            std::path::absolute(&anchored)
                .map(OsString::from)
                .unwrap_or_else(|_| anchored.into())
        } else {
            path.as_os_str().to_owned()
        }
    }

    /// `<generator> <source> -o <generated output> [<mode flag>]`
    pub fn generator_invocation(&self) -> Invocation {
        let mut args: Vec<OsString> = vec![
            self.config.source_input.as_str().into(),
            "-o".into(),
            self.config.generated_output_path.as_str().into(),
        ];
        if let Some(mode_flag) = &self.config.mode_flag {
            args.push(mode_flag.into());
        }

        Invocation {
            program: self.program(&self.config.generator_path),
            args,
            working_directory: self.config.working_directory.clone(),
            timeout: self.config.generator_timeout,
        }
    }

    /// `<simulator> -c <combined> -r <top entity> --wave=<waveform> [<extra>...]`
    pub fn simulator_invocation(&self) -> Invocation {
        let mut args: Vec<OsString> = vec![
            "-c".into(),
            self.config.combined_output_path.as_str().into(),
            "-r".into(),
            self.config.top_entity_name.as_str().into(),
            format!("--wave={}", self.config.waveform_output_path).into(),
        ];
        args.extend(self.config.simulator_extra_args.iter().map(Into::into));

        Invocation {
            program: self.program(&self.config.simulator_path),
            args,
            working_directory: self.config.working_directory.clone(),
            timeout: self.config.simulator_timeout,
        }
    }

    fn launch(
        &mut self,
        step: Step,
        invocation: Invocation,
    ) -> Result<Termination, PipelineError> {
        if self.config.log {
            log::info!("Invoking `{}`", invocation.command_line());
        }
        let termination = self.launcher.launch(&invocation).context(
            LaunchFailedSnafu {
                step,
                program: invocation.program.to_string_lossy().into_owned(),
            },
        )?;
        if let Termination::TimedOut(timeout) = termination {
            return TimedOutSnafu { step, timeout }.fail();
        }
        if self.config.log {
            log::info!("The {} step finished with {}", step, termination);
        }
        Ok(termination)
    }

    /// Runs all three steps in order, stopping at the first failure. On
    /// success the waveform file exists.
    pub fn run(&mut self) -> Result<(), PipelineError> {
        self.generate()?;
        self.concatenate()?;
        self.simulate()
    }

    /// Invokes the generator and blocks until it exits.
    pub fn generate(&mut self) -> Result<(), PipelineError> {
        let termination = self.launch(Step::Generate, self.generator_invocation())?;
        if !termination.success() {
            return GenerationFailedSnafu {
                exit_code: exit_code(termination),
            }
            .fail();
        }
        Ok(())
    }

    /// Concatenates the fragments into the combined artifact and returns the
    /// number of bytes written.
    ///
    /// Every fragment is opened before the combined artifact is touched, so a
    /// missing fragment leaves any previous combined artifact as it was. A
    /// failure after that point removes the partially written artifact.
    pub fn concatenate(&self) -> Result<u64, PipelineError> {
        let mut fragments = Vec::with_capacity(self.config.fragment_paths.len());
        for path in &self.config.fragment_paths {
            if self.config.log {
                log::debug!("Opening fragment {}", path);
            }
            let fragment = self
                .store
                .open_fragment(path)
                .context(FragmentReadFailedSnafu { path: path.clone() })?;
            fragments.push((path, fragment));
        }

        let combined_path = &self.config.combined_output_path;
        if self.config.log {
            log::info!("Writing combined artifact {}", combined_path);
        }
        let mut combined = self
            .store
            .create_combined(combined_path)
            .context(CombinedWriteFailedSnafu {
                path: combined_path.clone(),
            })?;

        let result = self.write_combined(&mut fragments, &mut combined);
        drop(combined);

        if result.is_err() {
            if let Err(removal_error) = self.store.remove(combined_path) {
                if self.config.log {
                    log::warn!(
                        "Failed to remove partial combined artifact {}: {}",
                        combined_path,
                        removal_error
                    );
                }
            }
        }

        result
    }

    fn write_combined(
        &self,
        fragments: &mut [(&Utf8PathBuf, S::Fragment)],
        combined: &mut S::Combined,
    ) -> Result<u64, PipelineError> {
        let combined_path = &self.config.combined_output_path;
        let mut total = 0;
        for (path, fragment) in fragments {
            let count = append(fragment, combined).map_err(|error| match error {
                AppendError::Read(source) => PipelineError::FragmentReadFailed {
                    path: path.to_path_buf(),
                    source,
                },
                AppendError::Write(source) => {
                    PipelineError::CombinedWriteFailed {
                        path: combined_path.clone(),
                        source,
                    }
                }
            })?;
            if self.config.log {
                log::debug!("Appended {} bytes from {}", count, path);
            }
            total += count;
        }
        combined.flush().context(CombinedWriteFailedSnafu {
            path: combined_path.clone(),
        })?;
        Ok(total)
    }

    /// Invokes the simulator on the combined artifact and blocks until it
    /// exits.
    pub fn simulate(&mut self) -> Result<(), PipelineError> {
        let termination = self.launch(Step::Simulate, self.simulator_invocation())?;
        if !termination.success() {
            return SimulationFailedSnafu {
                exit_code: exit_code(termination),
            }
            .fail();
        }
        Ok(())
    }
}
