//! Wrappers around the tools a Python package repository is built with.

use anyhow::Result;
use ignore::WalkBuilder;
use log::{info, warn};
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use crate::{
    errors::Error,
    output::Reporter,
    process::{stream_command, CommandLine, CommandRunner},
};

pub const DEFAULT_MIN_SCORE: f64 = 9.5;

const PYPI_URL: &str = "https://upload.pypi.org/legacy/";
const TEST_PYPI_URL: &str = "https://test.pypi.org/legacy/";

const DYNAMIC_README_PREFIX: &str = "dynamic_";

/// Where `gh run download` puts the artifacts of a workflow run.
const STAGE_DIR: &str = "stage";

pub fn black(
    reporter: &mut Reporter,
    runner: &mut dyn CommandRunner,
    source_root: &Path,
    format_sources: bool,
    args: &[String],
) -> Result<()> {
    let mut command = CommandLine::new("black");
    if !format_sources {
        command = command.arg("--check");
    }
    if reporter.is_verbose() {
        command = command.arg("--verbose");
    }
    let command = command
        .args(args.iter().map(String::as_str))
        .path_arg(source_root);

    stream_command(reporter, runner, "Running black...", &command)?;
    Ok(())
}

pub fn pylint(
    reporter: &mut Reporter,
    runner: &mut dyn CommandRunner,
    source_root: &Path,
    min_score: f64,
    args: &[String],
) -> Result<()> {
    let mut command = CommandLine::new("pylint").arg(format!("--fail-under={}", min_score));
    if reporter.is_verbose() {
        command = command.arg("--verbose");
    }
    let command = command
        .args(args.iter().map(String::as_str))
        .path_arg(source_root);

    stream_command(reporter, runner, "Running pylint...", &command)?;
    Ok(())
}

#[derive(Clone, Debug, Default)]
pub struct PytestOptions {
    /// Implies `code_coverage`.
    pub min_coverage: Option<f64>,
    pub code_coverage: bool,
    pub benchmark: bool,
    pub args: Vec<String>,
}

pub fn pytest(
    reporter: &mut Reporter,
    runner: &mut dyn CommandRunner,
    test_root: &Path,
    package_name: &str,
    options: &PytestOptions,
) -> Result<()> {
    let mut command = CommandLine::new("pytest");
    if !options.benchmark {
        command = command.arg("--benchmark-skip");
    }
    if options.code_coverage || options.min_coverage.is_some() {
        command = command.arg(format!("--cov={}", package_name));
    }
    if let Some(min_coverage) = options.min_coverage {
        command = command.arg(format!("--cov-fail-under={}", min_coverage));
    }
    let command = command
        .args(vec!["--capture=no", "--verbose", "-vv"])
        .args(options.args.iter().map(String::as_str))
        .arg(".")
        .current_dir(test_root);

    stream_command(reporter, runner, "Running pytest...", &command)?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct PyProject {
    project: Option<Project>,
}

#[derive(Debug, Deserialize)]
struct Project {
    readme: Option<Readme>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Readme {
    File(String),
    Table { file: Option<String> },
}

impl Readme {
    fn file(&self) -> Option<&str> {
        match self {
            Readme::File(file) => Some(file.as_str()),
            Readme::Table { file } => file.as_deref(),
        }
    }
}

/// Removed again when dropped, whichever way packaging ends.
struct GeneratedFile(PathBuf);

impl Drop for GeneratedFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.0) {
            Ok(()) => info!("removed {:?}", self.0),
            Err(err) => warn!("could not remove {:?}: {}", self.0, err),
        }
    }
}

/// Builds the sdist and wheel. When `pyproject.toml` points its readme at a
/// `dynamic_` file, that file is generated from `README.md` for the duration
/// of the build.
pub fn package(
    reporter: &mut Reporter,
    runner: &mut dyn CommandRunner,
    source_root: &Path,
    args: &[String],
) -> Result<()> {
    let _readme = reporter.nested("Preparing README.md...", |_| prepare_readme(source_root))?;

    let command = CommandLine::new("python")
        .args(vec!["-m", "build"])
        .args(args.iter().map(String::as_str))
        .current_dir(source_root);

    stream_command(reporter, runner, "Packaging...", &command)?;
    Ok(())
}

fn prepare_readme(source_root: &Path) -> Result<Option<GeneratedFile>> {
    let pyproject_path = source_root.join("pyproject.toml");
    if !pyproject_path.is_file() {
        return Err(Error::Precondition(format!(
            "'{}' does not exist",
            pyproject_path.display()
        ))
        .into());
    }

    let pyproject: PyProject = toml::from_str(&fs::read_to_string(&pyproject_path)?)?;
    let readme = pyproject
        .project
        .as_ref()
        .and_then(|project| project.readme.as_ref())
        .and_then(Readme::file);

    let readme = match readme {
        Some(readme) if readme.starts_with(DYNAMIC_README_PREFIX) => readme,
        _ => return Ok(None),
    };

    let original = source_root.join("README.md");
    if !original.is_file() {
        return Err(Error::Precondition(format!("'{}' does not exist", original.display())).into());
    }

    let content = strip_excluded_sections(&fs::read_to_string(&original)?)?;
    let generated = source_root.join(readme);
    fs::write(&generated, content)?;

    Ok(Some(GeneratedFile(generated)))
}

/// Drops everything between `<!-- BEGIN: Exclude Package -->` and
/// `<!-- END: Exclude Package -->`, tags included.
pub fn strip_excluded_sections(content: &str) -> Result<String> {
    let begin = Regex::new(r"<!--\s*BEGIN:\s*Exclude Package\s*-->")?;
    let end = Regex::new(r"<!--\s*END:\s*Exclude Package\s*-->")?;

    let mut result = String::with_capacity(content.len());
    let mut last_index = 0;

    while let Some(begin_match) = begin.find_at(content, last_index) {
        result.push_str(&content[last_index..begin_match.start()]);

        let end_match = end.find_at(content, begin_match.end()).ok_or_else(|| {
            Error::Precondition("Missing end tag for exclude package".into())
        })?;
        last_index = end_match.end();
    }

    result.push_str(&content[last_index..]);
    Ok(result)
}

/// Builds a frozen executable with `python <build_file> build_exe` and
/// moves the result to `output_dir`, replacing a previous build.
pub fn build_binary(
    reporter: &mut Reporter,
    runner: &mut dyn CommandRunner,
    build_file: &Path,
    output_dir: &Path,
) -> Result<()> {
    let file_name = match build_file.file_name() {
        Some(file_name) if build_file.is_file() => file_name,
        _ => {
            return Err(Error::Precondition(format!(
                "'{}' is not a file",
                build_file.display()
            ))
            .into())
        }
    };
    let build_root = match build_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    reporter.nested("Building binary...", |reporter| {
        let command = CommandLine::new("python")
            .path_arg(file_name)
            .arg("build_exe")
            .current_dir(build_root);
        stream_command(reporter, runner, "Building executable...", &command)?;

        let build_dir = build_root.join("build");
        fs::create_dir_all(&build_dir)?;

        reporter.nested("Removing empty directories...", |reporter| {
            let removed = remove_empty_directories(reporter, &build_dir)?;
            reporter.write_verbose(&format!(
                "{} {} removed",
                removed,
                if removed == 1 { "directory" } else { "directories" }
            ))
        })?;

        if output_dir.is_dir() {
            reporter.nested("Removing previous build directory...", |_| {
                fs::remove_dir_all(output_dir)?;
                Ok(())
            })?;
        }

        reporter.nested("Moving files...", |_| {
            if let Some(parent) = output_dir.parent() {
                fs::create_dir_all(parent)?;
            }
            move_tree(&build_dir, output_dir)
        })
    })
}

/// Removes every empty directory below `root`, innermost first, and
/// returns how many were removed. `root` itself is kept.
fn remove_empty_directories(reporter: &mut Reporter, root: &Path) -> Result<usize> {
    let mut directories = Vec::new();
    for entry in WalkBuilder::new(root).standard_filters(false).build() {
        let entry = entry?;
        let is_dir = entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false);
        if is_dir && entry.depth() > 0 {
            directories.push(entry.into_path());
        }
    }

    let mut removed = 0;
    for directory in directories.iter().rev() {
        if fs::read_dir(directory)?.next().is_none() {
            reporter.write_verbose(&format!("Removing '{}'...", directory.display()))?;
            fs::remove_dir(directory)?;
            removed += 1;
        }
    }

    Ok(removed)
}

fn move_tree(source: &Path, destination: &Path) -> Result<()> {
    if fs::rename(source, destination).is_ok() {
        return Ok(());
    }

    // Different file systems.
    fs::create_dir_all(destination)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            move_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            fs::remove_file(entry.path())?;
        }
    }
    fs::remove_dir(source)?;

    Ok(())
}

#[derive(Clone, Debug, Default)]
pub struct PublishOptions {
    /// Push to PyPI rather than TestPyPI.
    pub production: bool,
    /// Download `dist/` from this GitHub Actions run when it is missing.
    pub github_action_run_id: Option<String>,
    pub args: Vec<String>,
}

pub fn publish(
    reporter: &mut Reporter,
    runner: &mut dyn CommandRunner,
    source_root: &Path,
    api_token: &str,
    options: &PublishOptions,
) -> Result<()> {
    let dist_dir = source_root.join("dist");
    if !dist_dir.is_dir() {
        if let Some(run_id) = &options.github_action_run_id {
            prepare_publish_artifacts(reporter, runner, source_root, run_id)?;
        }
    }

    if !dist_dir.is_dir() {
        return Err(Error::Precondition(format!(
            "The distribution directory '{}' does not exist. Please make sure that the package has been built before invoking this functionality.",
            dist_dir.display()
        ))
        .into());
    }

    let mut wheels = fs::read_dir(&dist_dir)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().map(|ext| ext == "whl").unwrap_or(false))
        .collect::<Vec<_>>();
    wheels.sort();

    if wheels.is_empty() {
        return Err(
            Error::Precondition(format!("'{}' contains no wheels", dist_dir.display())).into(),
        );
    }

    let repository_url = if options.production {
        PYPI_URL
    } else {
        TEST_PYPI_URL
    };

    let mut command = CommandLine::new("twine")
        .args(vec![
            "upload",
            "--repository-url",
            repository_url,
            "--username",
            "__token__",
            "--non-interactive",
            "--disable-progress-bar",
        ])
        .env("TWINE_PASSWORD", api_token)
        .current_dir(source_root);
    if reporter.is_verbose() {
        command = command.arg("--verbose");
    }
    command = command.args(options.args.iter().map(String::as_str));
    for wheel in wheels.iter() {
        command = command.path_arg(wheel.strip_prefix(source_root).unwrap_or(wheel));
    }

    stream_command(
        reporter,
        runner,
        &format!("Publishing to '{}'...", repository_url),
        &command,
    )?;
    Ok(())
}

/// Fills `dist/` from the artifacts of a GitHub Actions run. Every artifact
/// must be a wheel or an sdist; when several jobs produced the same file,
/// the smallest copy is used.
fn prepare_publish_artifacts(
    reporter: &mut Reporter,
    runner: &mut dyn CommandRunner,
    source_root: &Path,
    run_id: &str,
) -> Result<()> {
    let stage_dir = source_root.join(STAGE_DIR);
    let dist_dir = source_root.join("dist");

    let command = CommandLine::new("gh")
        .args(vec!["run", "download", run_id, "--dir", STAGE_DIR])
        .current_dir(source_root);
    stream_command(reporter, runner, "Downloading build artifacts...", &command)?;

    let files = reporter.nested("Collecting build artifacts...", |reporter| {
        let mut files = Vec::new();
        if stage_dir.is_dir() {
            for entry in WalkBuilder::new(&stage_dir).standard_filters(false).build() {
                let entry = entry?;
                if entry.file_type().map(|kind| kind.is_file()).unwrap_or(false) {
                    files.push(entry.into_path());
                }
            }
        }

        reporter.write_verbose(&format!("{} found", files.len()))?;
        Ok(files)
    })?;

    let packages = reporter.nested("Organizing files...", |reporter| {
        let mut packages: BTreeMap<String, Vec<(u64, PathBuf)>> = BTreeMap::new();
        let mut unsupported = 0;

        for file in files {
            let name = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();

            if name.ends_with(".whl") || name.ends_with(".tar.gz") {
                let size = fs::metadata(&file)?.len();
                packages.entry(name).or_default().push((size, file));
            } else {
                reporter.write_error(&format!(
                    "'{}' is not a supported file type.",
                    file.display()
                ))?;
                unsupported += 1;
            }
        }

        if unsupported != 0 {
            return Err(Error::Precondition(format!(
                "{} build artifacts are not python packages",
                unsupported
            ))
            .into());
        }

        Ok(packages)
    })?;

    reporter.nested("Copying files...", |reporter| {
        fs::create_dir_all(&dist_dir)?;

        for (name, mut candidates) in packages {
            candidates.sort();
            if let Some((_, smallest)) = candidates.first() {
                reporter.nested(&format!("Copying '{}'...", name), |_| {
                    fs::copy(smallest, dist_dir.join(&name))?;
                    Ok(())
                })?;
            }
        }

        Ok(())
    })
}
