use anyhow::Result;
use log::info;
use std::path::PathBuf;
use structopt::StructOpt;

use activities::{PublishOptions, PytestOptions};
use backends::DockerBackend;
use base_images::{DefaultBaseImage, ExistingBaseImage};
use git::RepositoryInfo;
use models::ImageName;
use output::Reporter;
use pipeline::{CreateImageOptions, ImagePipeline};
use process::{stream_command, CommandLine, SystemRunner};
use services::ArchiveFormat;
use settings::Settings;

mod activities;
mod backends;
mod base_images;
mod errors;
mod export;
mod git;
mod models;
mod output;
mod pipeline;
mod process;
mod resources;
mod services;
mod settings;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "devtools",
    about = "Build, check and package tooling for Python repositories."
)]
struct Opt {
    #[structopt(long, global = true)]
    /// Write verbose information to the terminal.
    verbose: bool,

    #[structopt(long, global = true)]
    /// Show the commands that would run without running them.
    dry_run: bool,

    #[structopt(long, global = true, env = "DEVTOOLS_DOCKER", default_value = "docker")]
    docker: String,

    #[structopt(long, global = true, env = "DEVTOOLS_GIT", default_value = "git")]
    git: String,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Builds a docker image containing a bootstrapped clone of the repository.
    CreateImage {
        #[structopt(parse(from_os_str), default_value = ".")]
        repo_root: PathBuf,

        #[structopt(long)]
        /// Start from this image instead of building a default one.
        base_image: Option<String>,

        #[structopt(long, default_value = "./Bootstrap.sh")]
        bootstrap_command: String,

        #[structopt(long, default_value = "--package", allow_hyphen_values = true)]
        bootstrap_args: String,

        #[structopt(long)]
        /// Appended to the image tag.
        suffix: Option<String>,

        #[structopt(long)]
        license: Option<String>,

        #[structopt(long)]
        description: Option<String>,
    },
    /// Saves an image to a compressed archive.
    SaveImage {
        image: String,

        #[structopt(parse(from_os_str))]
        output: PathBuf,

        #[structopt(long)]
        /// `gzip` or `zip`; defaults to what the platform uses.
        format: Option<ArchiveFormat>,

        #[structopt(long)]
        delete_image: bool,
    },
    /// Pushes an image to a container registry.
    PushImage {
        image: String,

        #[structopt(long)]
        registry_url: Option<String>,

        #[structopt(long)]
        username: Option<String>,

        #[structopt(long)]
        /// Remove the tag created for the push afterwards.
        delete_tag: bool,
    },
    /// Runs black on the python code.
    Black {
        #[structopt(parse(from_os_str), default_value = ".")]
        source_root: PathBuf,

        #[structopt(long)]
        /// Format the files; the default behavior checks if any files need to be formatted.
        format: bool,

        #[structopt(long = "arg", allow_hyphen_values = true, number_of_values = 1)]
        args: Vec<String>,
    },
    /// Runs pylint on the python code.
    Pylint {
        #[structopt(parse(from_os_str), default_value = ".")]
        source_root: PathBuf,

        #[structopt(long)]
        /// Fail below this score, 9.5 by default.
        min_score: Option<f64>,

        #[structopt(long = "arg", allow_hyphen_values = true, number_of_values = 1)]
        args: Vec<String>,
    },
    /// Runs pytest on the python tests.
    Pytest {
        #[structopt(parse(from_os_str), default_value = ".")]
        test_root: PathBuf,

        #[structopt(long)]
        /// The package coverage is measured for.
        package: String,

        #[structopt(long)]
        code_coverage: bool,

        #[structopt(long)]
        min_coverage: Option<f64>,

        #[structopt(long)]
        /// Run benchmark tests in addition to other tests.
        benchmark: bool,

        #[structopt(long = "pytest-arg", allow_hyphen_values = true, number_of_values = 1)]
        pytest_args: Vec<String>,
    },
    /// Builds a frozen executable and moves it to the output directory.
    BuildBinary {
        #[structopt(parse(from_os_str))]
        output_dir: PathBuf,

        #[structopt(long, parse(from_os_str), default_value = "setup.py")]
        /// The cx_Freeze script that provides `build_exe`.
        build_file: PathBuf,
    },
    /// Builds the python package.
    Package {
        #[structopt(parse(from_os_str), default_value = ".")]
        source_root: PathBuf,

        #[structopt(long = "arg", allow_hyphen_values = true, number_of_values = 1)]
        args: Vec<String>,
    },
    /// Publishes the python package.
    Publish {
        #[structopt(long, env = "PYPI_API_TOKEN", hide_env_values = true)]
        token: String,

        #[structopt(parse(from_os_str), default_value = ".")]
        source_root: PathBuf,

        #[structopt(long)]
        /// Push to PyPI rather than TestPyPI.
        production: bool,

        #[structopt(long)]
        /// Download the distribution from this GitHub Actions run when `dist` is missing.
        github_action_run_id: Option<String>,

        #[structopt(long = "arg", allow_hyphen_values = true, number_of_values = 1)]
        args: Vec<String>,
    },
    /// Runs a command under a status heading.
    StreamCommand {
        heading: String,

        #[structopt(required = true)]
        command: Vec<String>,
    },
}

fn main() -> Result<()> {
    pretty_env_logger::init_custom_env("LOG");

    let opt = Opt::from_args();

    let settings = Settings {
        verbose: opt.verbose,
        dry_run: opt.dry_run,
        docker: opt.docker,
        git: opt.git,
    };
    info!("settings {:?}", settings);

    let mut reporter = Reporter::stdout(settings.verbose);
    let mut runner = SystemRunner::new(settings.dry_run);

    match opt.command {
        Command::CreateImage {
            repo_root,
            base_image,
            bootstrap_command,
            bootstrap_args,
            suffix,
            license,
            description,
        } => {
            let repo_root = repo_root.canonicalize()?;
            let repository = RepositoryInfo::query(&mut runner, &settings.git, &repo_root)?;
            info!("repository {:?}", repository);

            let options = CreateImageOptions {
                bootstrap_command,
                bootstrap_args,
                name_suffix: suffix.unwrap_or_default(),
                license,
                description,
                ..CreateImageOptions::new(repo_root)
            };

            let mut backend = DockerBackend::new(runner, settings.docker.as_str());
            let image = reporter.nested("Creating docker image...", |reporter| {
                let mut pipeline = match base_image {
                    Some(name) => {
                        ImagePipeline::new(&mut backend, ExistingBaseImage(ImageName(name)))
                    }
                    None => ImagePipeline::new(&mut backend, DefaultBaseImage::default()),
                };
                let result = pipeline.create_image(reporter, &repository, &options);
                info!("pipeline stopped at stage {}", pipeline.stage());
                result
            })?;

            println!("{}", image.0);
        }
        Command::SaveImage {
            image,
            output,
            format,
            delete_image,
        } => {
            let mut backend = DockerBackend::new(runner, settings.docker.as_str());
            export::save_image(
                &mut backend,
                &mut reporter,
                &ImageName(image),
                &output,
                format.unwrap_or_else(ArchiveFormat::native),
                delete_image,
            )?;
        }
        Command::PushImage {
            image,
            registry_url,
            username,
            delete_tag,
        } => {
            let mut backend = DockerBackend::new(runner, settings.docker.as_str());
            export::push_image(
                &mut backend,
                &mut reporter,
                &ImageName(image),
                registry_url.as_deref(),
                username.as_deref(),
                delete_tag,
            )?;
        }
        Command::Black {
            source_root,
            format,
            args,
        } => activities::black(&mut reporter, &mut runner, &source_root, format, &args)?,
        Command::Pylint {
            source_root,
            min_score,
            args,
        } => activities::pylint(
            &mut reporter,
            &mut runner,
            &source_root,
            min_score.unwrap_or(activities::DEFAULT_MIN_SCORE),
            &args,
        )?,
        Command::Pytest {
            test_root,
            package,
            code_coverage,
            min_coverage,
            benchmark,
            pytest_args,
        } => {
            let options = PytestOptions {
                min_coverage,
                code_coverage,
                benchmark,
                args: pytest_args,
            };
            activities::pytest(&mut reporter, &mut runner, &test_root, &package, &options)?;
        }
        Command::BuildBinary {
            build_file,
            output_dir,
        } => activities::build_binary(&mut reporter, &mut runner, &build_file, &output_dir)?,
        Command::Package { source_root, args } => {
            activities::package(&mut reporter, &mut runner, &source_root, &args)?
        }
        Command::Publish {
            token,
            source_root,
            production,
            github_action_run_id,
            args,
        } => {
            let options = PublishOptions {
                production,
                github_action_run_id,
                args,
            };
            activities::publish(&mut reporter, &mut runner, &source_root, &token, &options)?;
        }
        Command::StreamCommand { heading, command } => {
            let mut parts = command.into_iter();
            let program = parts.next().unwrap_or_default();
            let command = CommandLine::new(program).args(parts);
            stream_command(&mut reporter, &mut runner, &heading, &command)?;
        }
    }

    Ok(())
}
