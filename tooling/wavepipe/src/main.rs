// Copyright (C) 2024 Ethan Uppal.
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3 of the License only.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{env, fmt::Display, fs, time::Instant};

use argh::FromArgs;
use camino::{Utf8Path, Utf8PathBuf};
use owo_colors::OwoColorize;
use snafu::{Report, ResultExt, Whatever, whatever};
use wavepipe_runner::{Pipeline, PipelineConfig, PipelineError};

const DEFAULT_HARNESS_FILE: &str = "harness.toml";
const DEFAULT_HARNESS_GLOB: &str = "harness/*.toml";

/// Generate VHDL, wrap it in a test bench, and simulate it
#[derive(FromArgs)]
struct WavepipeCommand {
    /// log what the pipeline is doing (also enabled by setting RUST_LOG)
    #[argh(switch, short = 'v')]
    verbose: bool,

    #[argh(subcommand)]
    subcommand: Subcommand,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Subcommand {
    Run(RunSubcommand),
    Check(CheckSubcommand),
    Init(InitSubcommand),
    Test(TestSubcommand),
}

/// run the pipeline described by a harness file
#[derive(FromArgs)]
#[argh(subcommand, name = "run")]
struct RunSubcommand {
    /// the harness file
    #[argh(
        option,
        short = 'c',
        default = "Utf8PathBuf::from(DEFAULT_HARNESS_FILE)"
    )]
    config: Utf8PathBuf,
}

/// check that a harness file is well-formed and its inputs exist
#[derive(FromArgs)]
#[argh(subcommand, name = "check")]
struct CheckSubcommand {
    /// the harness file
    #[argh(
        option,
        short = 'c',
        default = "Utf8PathBuf::from(DEFAULT_HARNESS_FILE)"
    )]
    config: Utf8PathBuf,
}

/// write a harness file with the default settings
#[derive(FromArgs)]
#[argh(subcommand, name = "init")]
struct InitSubcommand {
    /// where to write the harness file
    #[argh(
        option,
        short = 'c',
        default = "Utf8PathBuf::from(DEFAULT_HARNESS_FILE)"
    )]
    config: Utf8PathBuf,

    /// overwrite an existing file
    #[argh(switch)]
    force: bool,
}

/// run every matching harness file, one after another
#[derive(FromArgs)]
#[argh(subcommand, name = "test")]
struct TestSubcommand {
    /// substring of harness names to run
    #[argh(positional, default = "String::new()")]
    harness_pattern: String,

    /// glob selecting harness files
    #[argh(option, short = 'g', default = "DEFAULT_HARNESS_GLOB.to_string()")]
    glob: String,
}

fn status(verb: &str, message: impl Display) {
    eprintln!("{} {}", format!("{verb:>12}").bold().green(), message);
}

fn warning(verb: &str, message: impl Display) {
    eprintln!("{} {}", format!("{verb:>12}").bold().yellow(), message);
}

fn load(path: &Utf8Path, log: bool) -> Result<PipelineConfig, Whatever> {
    let mut config = PipelineConfig::load(path)?;
    config.log = log;
    Ok(config)
}

fn failed(path: &Utf8Path, error: &PipelineError) -> String {
    format!("Harness {path} failed in the {} step", error.step())
}

fn run(path: &Utf8Path, log: bool) -> Result<(), Whatever> {
    let config = load(path, log)?;
    let mut pipeline = Pipeline::new(config)
        .whatever_context(format!("Invalid harness file {path}"))?;
    let start = Instant::now();

    let config = pipeline.config().clone();
    status(
        "Generating",
        format!("{} ({})", config.generated_output_path, config.source_input),
    );
    pipeline.generate().with_whatever_context(|error| failed(path, error))?;

    status(
        "Combining",
        format!(
            "{} fragment{} into {}",
            config.fragment_paths.len(),
            if config.fragment_paths.len() == 1 { "" } else { "s" },
            config.combined_output_path
        ),
    );
    let bytes = pipeline
        .concatenate()
        .with_whatever_context(|error| failed(path, error))?;
    if log {
        log::info!("Combined artifact is {} bytes", bytes);
    }

    status(
        "Simulating",
        format!("{} ({})", config.top_entity_name, config.combined_output_path),
    );
    pipeline.simulate().with_whatever_context(|error| failed(path, error))?;

    let duration = start.elapsed();
    status(
        "Finished",
        format!(
            "{} in {}.{:02}s",
            config.waveform_output_path,
            duration.as_secs(),
            duration.subsec_millis() / 10
        ),
    );

    let waveform = config.working_directory.join(&config.waveform_output_path);
    if !waveform.is_file() {
        warning(
            "Warning",
            format!("the simulator exited successfully but {waveform} does not exist"),
        );
    }

    Ok(())
}

/// Inputs that must exist before the pipeline starts: the source input and
/// every fragment except the one the generator writes.
fn missing_inputs(config: &PipelineConfig) -> Vec<Utf8PathBuf> {
    std::iter::once(&config.source_input)
        .chain(
            config
                .fragment_paths
                .iter()
                .filter(|path| **path != config.generated_output_path),
        )
        .filter(|path| !config.working_directory.join(path).is_file())
        .cloned()
        .collect()
}

fn check(path: &Utf8Path, log: bool) -> Result<(), Whatever> {
    let config = load(path, log)?;
    config
        .validate()
        .whatever_context(format!("Invalid harness file {path}"))?;

    let missing = missing_inputs(&config);
    for input in &missing {
        warning(
            "Missing",
            format!("{} (under {})", input, config.working_directory),
        );
    }
    if !missing.is_empty() {
        whatever!(
            "{} input{} of {} do not exist",
            missing.len(),
            if missing.len() == 1 { "" } else { "s" },
            path
        );
    }

    println!("Everything looks good!");
    Ok(())
}

fn harness_template() -> Result<String, Whatever> {
    let body = toml::to_string_pretty(&PipelineConfig::default().to_toml())
        .whatever_context("Failed to format default harness as TOML")?;
    Ok(format!(
        "# Pipeline harness. Relative paths are relative to this file.\n\n{body}"
    ))
}

fn init(options: InitSubcommand) -> Result<(), Whatever> {
    if options.config.exists() && !options.force {
        whatever!(
            "{} already exists; pass --force to overwrite it",
            options.config
        );
    }

    fs::write(&options.config, harness_template()?).whatever_context(format!(
        "Failed to write harness file {}",
        options.config
    ))?;

    println!("  Wrote {}", options.config);
    println!();
    println!("  Use `wavepipe check -c {}` to verify it", options.config);
    Ok(())
}

fn harness_matches(path: &Utf8Path, pattern: &str) -> bool {
    path.file_stem()
        .map(|stem| stem.contains(pattern))
        .unwrap_or(false)
}

fn run_harnesses(options: TestSubcommand, log: bool) -> Result<(), Whatever> {
    let mut harnesses = vec![];
    for entry in glob::glob(&options.glob)
        .whatever_context(format!("Invalid harness glob `{}`", options.glob))?
    {
        let path = entry.whatever_context("Failed to read harness directory")?;
        let path = Utf8PathBuf::try_from(path)
            .whatever_context("Harness path is not UTF-8")?;
        if path.is_file() && harness_matches(&path, &options.harness_pattern) {
            harnesses.push(path);
        }
    }
    harnesses.sort();

    let harness_count = harnesses.len();
    println!(
        "{} {} harness{} [{}]",
        "     STARTING".bold().bright_cyan(),
        harness_count,
        if harness_count == 1 { "" } else { "es" },
        options.glob
    );

    let mut failures = 0;
    for harness in harnesses {
        match run(&harness, log) {
            Ok(()) => println!(
                "         {} [{}]",
                "PASS".bold().bright_green(),
                harness
            ),
            Err(error) => {
                failures += 1;
                println!(
                    "         {} [{}]\n{}",
                    "FAIL".bold().bright_red(),
                    harness,
                    Report::from_error(error)
                );
            }
        }
    }

    println!(
        "{} with {} failure{}",
        "     FINISHED".bold().bright_cyan(),
        failures,
        if failures == 1 { "" } else { "s" },
    );

    if failures > 0 {
        whatever!("Exiting due to failure(s)");
    }

    Ok(())
}

#[snafu::report]
fn main() -> Result<(), Whatever> {
    let command: WavepipeCommand = argh::from_env();

    let log = command.verbose || env::var("RUST_LOG").is_ok();
    if log {
        env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("info"),
        )
        .init();
    }

    match command.subcommand {
        Subcommand::Run(run_subcommand) => run(&run_subcommand.config, log),
        Subcommand::Check(check_subcommand) => {
            check(&check_subcommand.config, log)
        }
        Subcommand::Init(init_subcommand) => init(init_subcommand),
        Subcommand::Test(test_subcommand) => {
            run_harnesses(test_subcommand, log)
        }
    }
}
