// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! Pipeline configuration and the harness file format.
//!
//! A harness file is TOML with three tables. Every key is optional and falls
//! back to [`PipelineConfig::default()`]:
//!
//! ```toml
//! working_directory = "."
//!
//! [generator]
//! executable = "../build/debug/fptool"
//! source = "../tests/csd_test.fp"
//! output = "csd_test.vhdl"
//! mode_flag = "-d"        # "" passes no mode flag
//! timeout_secs = 60
//!
//! [combine]
//! fragments = ["csd_test_prolog.vhdl", "csd_test.vhdl", "csd_test_epilog.vhdl"]
//! output = "csd_test_final.vhdl"
//!
//! [simulator]
//! executable = "ghdl"
//! top_entity = "tb"
//! waveform = "csd_test_final.ghw"
//! extra_args = ["--stop-time=1us"]
//! timeout_secs = 60
//! ```

use std::{fs, time::Duration};

use camino::{Utf8Path, Utf8PathBuf};
use snafu::{ResultExt, Whatever, whatever};

const TOP_LEVEL_KEYS: &[&str] =
    &["working_directory", "generator", "combine", "simulator"];
const GENERATOR_KEYS: &[&str] =
    &["executable", "source", "output", "mode_flag", "timeout_secs"];
const COMBINE_KEYS: &[&str] = &["fragments", "output"];
const SIMULATOR_KEYS: &[&str] = &[
    "executable",
    "top_entity",
    "waveform",
    "extra_args",
    "timeout_secs",
];

/// Everything the pipeline needs to know. Usually, you load this from a
/// harness file with [`PipelineConfig::load`].
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// The generator executable. A bare name is looked up on `PATH`; a
    /// relative path is taken relative to `working_directory`.
    pub generator_path: Utf8PathBuf,

    /// Source file handed to the generator as its first argument.
    pub source_input: Utf8PathBuf,

    /// Where the generator is told to write (`-o`).
    pub generated_output_path: Utf8PathBuf,

    /// Trailing flag selecting the generator's output mode, if any.
    pub mode_flag: Option<String>,

    pub generator_timeout: Option<Duration>,

    /// Concatenated in this order. Normally includes `generated_output_path`.
    pub fragment_paths: Vec<Utf8PathBuf>,

    /// Truncated and rewritten on every run.
    pub combined_output_path: Utf8PathBuf,

    /// The simulator executable, resolved like `generator_path`.
    pub simulator_path: Utf8PathBuf,

    /// Entity elaborated and run by the simulator (`-r`).
    pub top_entity_name: String,

    /// Passed to the simulator as `--wave=<path>`.
    pub waveform_output_path: Utf8PathBuf,

    /// Appended after the waveform flag, e.g. `--stop-time=1us`.
    pub simulator_extra_args: Vec<String>,

    pub simulator_timeout: Option<Duration>,

    /// Directory both tools run in and relative artifact paths resolve
    /// against.
    pub working_directory: Utf8PathBuf,

    /// Whether to use the log crate.
    pub log: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            generator_path: "../build/debug/fptool".into(),
            source_input: "../tests/csd_test.fp".into(),
            generated_output_path: "csd_test.vhdl".into(),
            mode_flag: Some("-d".into()),
            generator_timeout: None,
            fragment_paths: vec![
                "csd_test_prolog.vhdl".into(),
                "csd_test.vhdl".into(),
                "csd_test_epilog.vhdl".into(),
            ],
            combined_output_path: "csd_test_final.vhdl".into(),
            simulator_path: "ghdl".into(),
            top_entity_name: "tb".into(),
            waveform_output_path: "csd_test_final.ghw".into(),
            simulator_extra_args: vec![],
            simulator_timeout: None,
            working_directory: ".".into(),
            log: false,
        }
    }
}

fn check_keys(
    table: &toml::Value,
    name: &str,
    allowed: &[&str],
) -> Result<(), Whatever> {
    let Some(table) = table.as_table() else {
        whatever!("`{}` must be a table", name);
    };
    if let Some(key) = table.keys().find(|key| !allowed.contains(&key.as_str())) {
        if name.is_empty() {
            whatever!("Unknown key `{}` in harness file", key);
        }
        whatever!("Unknown key `{}` in [{}]", key, name);
    }
    Ok(())
}

fn read_string(
    document: &toml::Value,
    section: &str,
    key: &str,
) -> Result<Option<String>, Whatever> {
    match document.get(section).and_then(|table| table.get(key)) {
        None => Ok(None),
        Some(value) => match value.as_str() {
            Some(string) => Ok(Some(string.to_string())),
            None => {
                whatever!("`{}.{}` must be a string", section, key);
            }
        },
    }
}

fn read_string_array(
    document: &toml::Value,
    section: &str,
    key: &str,
) -> Result<Option<Vec<String>>, Whatever> {
    let Some(value) = document.get(section).and_then(|table| table.get(key))
    else {
        return Ok(None);
    };
    let Some(array) = value.as_array() else {
        whatever!("`{}.{}` must be an array of strings", section, key);
    };
    array
        .iter()
        .map(|element| match element.as_str() {
            Some(string) => Ok(string.to_string()),
            None => {
                whatever!(
                    "`{}.{}` must contain only strings, found {}",
                    section,
                    key,
                    element
                );
            }
        })
        .collect::<Result<Vec<_>, Whatever>>()
        .map(Some)
}

fn read_timeout(
    document: &toml::Value,
    section: &str,
) -> Result<Option<Duration>, Whatever> {
    let Some(value) = document
        .get(section)
        .and_then(|table| table.get("timeout_secs"))
    else {
        return Ok(None);
    };
    let seconds = match value {
        toml::Value::Integer(seconds) => *seconds as f64,
        toml::Value::Float(seconds) => *seconds,
        _ => {
            whatever!("`{}.timeout_secs` must be a number", section);
        }
    };
    if seconds <= 0.0 {
        whatever!("`{}.timeout_secs` must be positive", section);
    }
    Duration::try_from_secs_f64(seconds)
        .whatever_context(format!("`{section}.timeout_secs` is out of range"))
        .map(Some)
}

fn timeout_value(timeout: Duration) -> toml::Value {
    match i64::try_from(timeout.as_secs()) {
        Ok(seconds) if timeout.subsec_nanos() == 0 => {
            toml::Value::Integer(seconds)
        }
        _ => toml::Value::Float(timeout.as_secs_f64()),
    }
}

fn string_array(strings: impl IntoIterator<Item = impl Into<String>>) -> toml::Value {
    toml::Value::Array(
        strings
            .into_iter()
            .map(|string| toml::Value::String(string.into()))
            .collect(),
    )
}

impl PipelineConfig {
    /// The same as the [`Default`] implementation except that the log crate is
    /// used.
    pub fn default_logging() -> Self {
        Self {
            log: true,
            ..Default::default()
        }
    }

    /// Reads a harness file. A relative `working_directory` (including the
    /// implicit default) is taken relative to the directory containing the
    /// file, so harness files can be run from anywhere. The resulting
    /// working directory is always absolute.
    pub fn load(path: &Utf8Path) -> Result<Self, Whatever> {
        let contents = fs::read_to_string(path)
            .whatever_context(format!("Failed to read harness file {path}"))?;
        let mut config = Self::from_toml_str(&contents)
            .whatever_context(format!("Invalid harness file {path}"))?;

        let harness_directory = path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."));
        let harness_directory = std::path::absolute(harness_directory)
            .whatever_context(format!(
                "Failed to resolve the directory containing {path}"
            ))?;
        let harness_directory = Utf8PathBuf::try_from(harness_directory)
            .whatever_context(format!(
                "The directory containing {path} is not UTF-8"
            ))?;
        config.working_directory = if config.working_directory == "." {
            harness_directory.to_path_buf()
        } else {
            harness_directory.join(&config.working_directory)
        };

        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, Whatever> {
        let document: toml::Value =
            toml::from_str(contents).whatever_context("Failed to parse TOML")?;
        Self::from_toml(&document)
    }

    /// Builds a configuration from a parsed harness document. Missing keys
    /// keep their defaults; unknown keys are rejected.
    pub fn from_toml(document: &toml::Value) -> Result<Self, Whatever> {
        check_keys(document, "", TOP_LEVEL_KEYS)?;
        for (section, keys) in [
            ("generator", GENERATOR_KEYS),
            ("combine", COMBINE_KEYS),
            ("simulator", SIMULATOR_KEYS),
        ] {
            if let Some(table) = document.get(section) {
                check_keys(table, section, keys)?;
            }
        }

        let mut config = Self::default();

        if let Some(value) = document.get("working_directory") {
            let Some(directory) = value.as_str() else {
                whatever!("`working_directory` must be a string");
            };
            config.working_directory = directory.into();
        }

        if let Some(executable) = read_string(document, "generator", "executable")? {
            config.generator_path = executable.into();
        }
        if let Some(source) = read_string(document, "generator", "source")? {
            config.source_input = source.into();
        }
        if let Some(output) = read_string(document, "generator", "output")? {
            config.generated_output_path = output.into();
        }
        if let Some(mode_flag) = read_string(document, "generator", "mode_flag")? {
            config.mode_flag = Some(mode_flag).filter(|flag| !flag.is_empty());
        }
        config.generator_timeout = read_timeout(document, "generator")?;

        if let Some(fragments) = read_string_array(document, "combine", "fragments")? {
            config.fragment_paths = fragments.into_iter().map(Into::into).collect();
        }
        if let Some(output) = read_string(document, "combine", "output")? {
            config.combined_output_path = output.into();
        }

        if let Some(executable) = read_string(document, "simulator", "executable")? {
            config.simulator_path = executable.into();
        }
        if let Some(top_entity) = read_string(document, "simulator", "top_entity")? {
            config.top_entity_name = top_entity;
        }
        if let Some(waveform) = read_string(document, "simulator", "waveform")? {
            config.waveform_output_path = waveform.into();
        }
        if let Some(extra_args) =
            read_string_array(document, "simulator", "extra_args")?
        {
            config.simulator_extra_args = extra_args;
        }
        config.simulator_timeout = read_timeout(document, "simulator")?;

        Ok(config)
    }

    /// Renders the configuration as a harness document that
    /// [`PipelineConfig::from_toml`] reads back to the same value (ignoring
    /// `log`).
    pub fn to_toml(&self) -> toml::Table {
        let mut generator = toml::Table::new();
        generator.insert("executable".into(), self.generator_path.as_str().into());
        generator.insert("source".into(), self.source_input.as_str().into());
        generator.insert(
            "output".into(),
            self.generated_output_path.as_str().into(),
        );
        generator.insert(
            "mode_flag".into(),
            self.mode_flag.as_deref().unwrap_or("").into(),
        );
        if let Some(timeout) = self.generator_timeout {
            generator.insert("timeout_secs".into(), timeout_value(timeout));
        }

        let mut combine = toml::Table::new();
        combine.insert(
            "fragments".into(),
            string_array(self.fragment_paths.iter().map(|path| path.as_str())),
        );
        combine.insert("output".into(), self.combined_output_path.as_str().into());

        let mut simulator = toml::Table::new();
        simulator.insert("executable".into(), self.simulator_path.as_str().into());
        simulator.insert("top_entity".into(), self.top_entity_name.as_str().into());
        simulator.insert(
            "waveform".into(),
            self.waveform_output_path.as_str().into(),
        );
        if !self.simulator_extra_args.is_empty() {
            simulator.insert(
                "extra_args".into(),
                string_array(self.simulator_extra_args.iter().map(String::as_str)),
            );
        }
        if let Some(timeout) = self.simulator_timeout {
            simulator.insert("timeout_secs".into(), timeout_value(timeout));
        }

        let mut document = toml::Table::new();
        document.insert(
            "working_directory".into(),
            self.working_directory.as_str().into(),
        );
        document.insert("generator".into(), generator.into());
        document.insert("combine".into(), combine.into());
        document.insert("simulator".into(), simulator.into());
        document
    }

    /// Rejects configurations the pipeline cannot run. Does not touch the
    /// filesystem: the generated fragment legitimately does not exist yet.
    pub fn validate(&self) -> Result<(), Whatever> {
        if self.generator_path.as_str().is_empty() {
            whatever!("No generator executable was configured");
        }
        if self.simulator_path.as_str().is_empty() {
            whatever!("No simulator executable was configured");
        }
        if self.source_input.as_str().is_empty() {
            whatever!("No generator source input was configured");
        }
        if self.generated_output_path.as_str().is_empty() {
            whatever!("No generator output path was configured");
        }
        if self.fragment_paths.is_empty() {
            whatever!("The fragment list is empty");
        }
        if let Some(fragment) =
            self.fragment_paths.iter().find(|path| path.as_str().is_empty())
        {
            whatever!("Fragment list contains an empty path ({:?})", fragment);
        }
        if self.combined_output_path.as_str().is_empty() {
            whatever!("No combined output path was configured");
        }
        if self.fragment_paths.contains(&self.combined_output_path) {
            whatever!(
                "Combined output {} is also listed as a fragment; it would be truncated before it is read",
                self.combined_output_path
            );
        }
        if self.top_entity_name.is_empty() {
            whatever!("No top-level entity was configured");
        }
        if self
            .top_entity_name
            .chars()
            .any(|c| c.is_whitespace() || c == '\\')
        {
            whatever!(
                "Top-level entity `{}` is not a plain identifier; escaped names are not supported",
                self.top_entity_name
            );
        }
        if self.waveform_output_path.as_str().is_empty() {
            whatever!("No waveform output path was configured");
        }
        if self.generator_timeout == Some(Duration::ZERO)
            || self.simulator_timeout == Some(Duration::ZERO)
        {
            whatever!("Timeouts must be positive");
        }

        if self.log && !self.fragment_paths.contains(&self.generated_output_path)
        {
            log::warn!(
                "Generated output {} is not in the fragment list, so it will not reach the simulator",
                self.generated_output_path
            );
        }

        Ok(())
    }
}
