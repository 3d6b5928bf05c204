// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! Runs the pipeline against real child processes, with small shell scripts
//! standing in for the generator and the simulator.

#![cfg(unix)]

use std::{
    fs, io,
    os::unix::fs::PermissionsExt,
    sync::{Mutex, MutexGuard},
};

use camino::{Utf8Path, Utf8PathBuf};
use snafu::{ResultExt, Whatever, whatever};
use tempfile::TempDir;
use wavepipe_runner::{Pipeline, PipelineConfig, PipelineError};

const PROLOG: &str = "library ieee;\nuse ieee.std_logic_1164.all;\n";
const GENERATED: &str = "entity fptool is\nend fptool;\n";
const EPILOG: &str = "-- end of test bench\n";

/// Writes `$3` (the `-o` argument) like the real generator would.
const GENERATOR: &str = r#"
[ "$2" = "-o" ] || exit 64
printf 'entity fptool is\nend fptool;\n' > "$3"
"#;

/// Copies the combined file (`$2`) to the waveform path and leaves a marker
/// so tests can tell whether it ran.
const SIMULATOR: &str = r#"
touch simulator-ran
[ "$1" = "-c" ] && [ "$3" = "-r" ] || exit 64
[ -f "$2" ] || exit 65
cp "$2" "${5#--wave=}"
"#;

// Writing a script while another test forks can leave the script busy
// (ETXTBSY) when it is executed, so tests in this file run one at a time.
static SERIAL: Mutex<()> = Mutex::new(());

struct Workspace {
    _directory: TempDir,
    root: Utf8PathBuf,
    _guard: MutexGuard<'static, ()>,
}

impl Workspace {
    fn new(generator: &str, simulator: &str) -> Result<Self, Whatever> {
        Self::create(tempfile::tempdir(), generator, simulator)
    }

    /// Like [`Workspace::new`], but created under the current directory so
    /// that it can also be reached through a relative path.
    fn in_current_directory(
        generator: &str,
        simulator: &str,
    ) -> Result<Self, Whatever> {
        Self::create(tempfile::tempdir_in("."), generator, simulator)
    }

    fn create(
        directory: io::Result<TempDir>,
        generator: &str,
        simulator: &str,
    ) -> Result<Self, Whatever> {
        let guard = SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let directory = directory.whatever_context("Failed to create tempdir")?;
        let root = Utf8PathBuf::try_from(directory.path().to_path_buf())
            .whatever_context("Tempdir path is not UTF-8")?;

        let workspace = Self {
            _directory: directory,
            root,
            _guard: guard,
        };
        workspace.write_script("generator.sh", generator)?;
        workspace.write_script("simulator.sh", simulator)?;
        workspace.write("csd_test.fp", "x = a * 0.75;\n")?;
        workspace.write("csd_test_prolog.vhdl", PROLOG)?;
        workspace.write("csd_test_epilog.vhdl", EPILOG)?;
        Ok(workspace)
    }

    fn write(&self, name: &str, contents: &str) -> Result<(), Whatever> {
        fs::write(self.root.join(name), contents)
            .whatever_context(format!("Failed to write {name}"))
    }

    fn write_script(&self, name: &str, body: &str) -> Result<(), Whatever> {
        let path = self.root.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}"))
            .whatever_context(format!("Failed to write {name}"))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .whatever_context(format!("Failed to make {name} executable"))
    }

    /// The workspace relative to the current directory.
    fn relative_root(&self) -> Result<Utf8PathBuf, Whatever> {
        let Some(name) = self.root.file_name() else {
            whatever!("Workspace {} has no file name", self.root);
        };
        Ok(Utf8PathBuf::from(name))
    }

    fn read(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.root.join(name)).ok()
    }

    fn exists(&self, name: &str) -> bool {
        self.root.join(name).exists()
    }

    fn config(&self) -> PipelineConfig {
        PipelineConfig {
            generator_path: self.root.join("generator.sh"),
            source_input: "csd_test.fp".into(),
            simulator_path: self.root.join("simulator.sh"),
            working_directory: self.root.clone(),
            ..PipelineConfig::default_logging()
        }
    }

    fn pipeline(&self) -> Result<Pipeline, Whatever> {
        Pipeline::new(self.config())
    }
}

#[test]
#[snafu::report]
fn produces_the_combined_file_and_the_waveform() -> Result<(), Whatever> {
    let workspace = Workspace::new(GENERATOR, SIMULATOR)?;

    workspace
        .pipeline()?
        .run()
        .whatever_context("Pipeline failed")?;

    let expected = format!("{PROLOG}{GENERATED}{EPILOG}");
    assert_eq!(workspace.read("csd_test.vhdl").as_deref(), Some(GENERATED));
    assert_eq!(
        workspace.read("csd_test_final.vhdl").as_deref(),
        Some(expected.as_str())
    );
    assert_eq!(
        workspace.read("csd_test_final.ghw").as_deref(),
        Some(expected.as_str())
    );
    Ok(())
}

#[test]
#[snafu::report]
fn generator_failure_skips_the_rest() -> Result<(), Whatever> {
    let workspace = Workspace::new("exit 2", SIMULATOR)?;

    let result = workspace.pipeline()?.run();

    assert!(matches!(
        result,
        Err(PipelineError::GenerationFailed { exit_code: Some(2) })
    ));
    assert!(!workspace.exists("csd_test_final.vhdl"));
    assert!(!workspace.exists("simulator-ran"));
    Ok(())
}

#[test]
#[snafu::report]
fn missing_fragment_skips_the_simulator() -> Result<(), Whatever> {
    let workspace = Workspace::new(GENERATOR, SIMULATOR)?;
    fs::remove_file(workspace.root.join("csd_test_epilog.vhdl"))
        .whatever_context("Failed to remove epilog")?;

    let result = workspace.pipeline()?.run();

    match result {
        Err(PipelineError::FragmentReadFailed { path, .. }) => {
            assert_eq!(path, "csd_test_epilog.vhdl");
        }
        other => panic!("expected a fragment read failure, got {other:?}"),
    }
    assert!(!workspace.exists("csd_test_final.vhdl"));
    assert!(!workspace.exists("simulator-ran"));
    Ok(())
}

#[test]
#[snafu::report]
fn simulator_exit_code_is_reported() -> Result<(), Whatever> {
    let workspace = Workspace::new(GENERATOR, "exit 5")?;

    let result = workspace.pipeline()?.run();

    assert!(matches!(
        result,
        Err(PipelineError::SimulationFailed { exit_code: Some(5) })
    ));
    Ok(())
}

#[test]
#[snafu::report]
fn repeated_runs_produce_identical_output() -> Result<(), Whatever> {
    let workspace = Workspace::new(GENERATOR, SIMULATOR)?;
    let mut pipeline = workspace.pipeline()?;

    pipeline.run().whatever_context("First run failed")?;
    let first = workspace.read("csd_test_final.vhdl");
    pipeline.run().whatever_context("Second run failed")?;
    let second = workspace.read("csd_test_final.vhdl");

    assert!(first.is_some());
    assert_eq!(first, second);
    Ok(())
}

#[test]
#[snafu::report]
fn harness_files_run_relative_to_themselves() -> Result<(), Whatever> {
    let workspace = Workspace::new(GENERATOR, SIMULATOR)?;
    workspace.write(
        "harness.toml",
        r#"
        [generator]
        executable = "./generator.sh"
        source = "csd_test.fp"

        [simulator]
        executable = "./simulator.sh"
        "#,
    )?;

    let config = PipelineConfig::load(&workspace.root.join("harness.toml"))?;
    assert_eq!(config.working_directory, workspace.root);
    Pipeline::new(config)?
        .run()
        .whatever_context("Pipeline failed")?;

    assert!(workspace.exists("csd_test_final.ghw"));
    Ok(())
}

#[test]
#[snafu::report]
fn relative_harness_paths_still_find_relative_tools() -> Result<(), Whatever> {
    let workspace = Workspace::in_current_directory(GENERATOR, SIMULATOR)?;
    workspace.write(
        "harness.toml",
        r#"
        [generator]
        executable = "./generator.sh"
        source = "csd_test.fp"

        [simulator]
        executable = "./simulator.sh"
        "#,
    )?;

    let harness = workspace.relative_root()?.join("harness.toml");
    let config = PipelineConfig::load(&harness)?;
    assert!(config.working_directory.is_absolute());
    Pipeline::new(config)?
        .run()
        .whatever_context("Pipeline failed")?;

    assert!(workspace.exists("csd_test_final.ghw"));
    Ok(())
}

#[test]
fn nonexistent_generator_is_a_launch_failure() -> Result<(), Whatever> {
    let workspace = Workspace::new(GENERATOR, SIMULATOR)?;
    let mut config = workspace.config();
    config.generator_path = Utf8Path::new("/nonexistent/fptool").to_path_buf();

    let result = Pipeline::new(config)?.run();

    assert!(matches!(result, Err(PipelineError::LaunchFailed { .. })));
    Ok(())
}
