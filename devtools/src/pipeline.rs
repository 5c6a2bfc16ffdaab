use anyhow::Result;
use log::{debug, info, warn};
use regex::Regex;
use std::{
    fmt,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};
use tempfile::{Builder as TempFileBuilder, NamedTempFile};
use uuid::Uuid;

use crate::{
    errors::Error,
    git::RepositoryInfo,
    models::{
        BaseImage, ContainerName, ContainerRunSpec, FinalImage, ImageBuildSpec, ImageName,
        TemporaryImage, Volume,
    },
    output::Reporter,
    resources::{Resource, ResourceStack},
    services::{BaseImageProvider, ContainerBackend},
};

const SOURCE_MOUNT: &str = "/source";
const CONTEXT_DIR: &str = "/context";

const MAX_TAG_LENGTH: usize = 128;

const LABEL_SOURCE: &str = "org.opencontainers.image.source";
const LABEL_LICENSES: &str = "org.opencontainers.image.licenses";
const LABEL_DESCRIPTION: &str = "org.opencontainers.image.description";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    Idle,
    BuildingBase,
    InitializingContainer,
    Committing,
    BuildingFinal,
    Aborted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::BuildingBase => "building base image",
            Stage::InitializingContainer => "initializing container",
            Stage::Committing => "committing container",
            Stage::BuildingFinal => "building final image",
            Stage::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct CreateImageOptions {
    pub repo_root: PathBuf,
    /// Run inside the cloned repository, relative to its root.
    pub bootstrap_command: String,
    pub bootstrap_args: String,
    pub name_suffix: String,
    pub license: Option<String>,
    pub description: Option<String>,
}

impl CreateImageOptions {
    pub fn new<P: Into<PathBuf>>(repo_root: P) -> CreateImageOptions {
        CreateImageOptions {
            repo_root: repo_root.into(),
            bootstrap_command: "./Bootstrap.sh".into(),
            bootstrap_args: "--package".into(),
            name_suffix: String::new(),
            license: None,
            description: None,
        }
    }
}

/// Builds a distributable image from a repository:
/// base image, bootstrap container, commit, then a final image that only
/// adds metadata. Every intermediate image and container is removed again,
/// whether the run succeeds or not.
pub struct ImagePipeline<'a> {
    backend: &'a mut dyn ContainerBackend,
    provider: Box<dyn BaseImageProvider>,
    stage: Stage,
}

impl<'a> ImagePipeline<'a> {
    pub fn new<P>(backend: &'a mut dyn ContainerBackend, provider: P) -> ImagePipeline<'a>
    where
        P: 'static + BaseImageProvider,
    {
        ImagePipeline {
            backend,
            provider: Box::new(provider),
            stage: Stage::Idle,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn create_image(
        &mut self,
        reporter: &mut Reporter,
        repository: &RepositoryInfo,
        options: &CreateImageOptions,
    ) -> Result<FinalImage> {
        if !options.repo_root.is_dir() {
            return Err(Error::Precondition(format!(
                "the repository root '{}' is not a directory",
                options.repo_root.display()
            ))
            .into());
        }
        let final_name = final_image_name(repository, &options.name_suffix)?;

        let ImagePipeline {
            backend,
            provider,
            stage,
        } = self;

        let mut resources = ResourceStack::new();
        let result = run_stages(
            &mut **backend,
            provider.as_mut(),
            stage,
            &mut resources,
            reporter,
            repository,
            options,
            final_name,
        );

        if let Err(err) = &result {
            warn!("aborted while {}: {}", stage, err);
            *stage = Stage::Aborted;
        }

        let cleanup = resources.unwind(&mut **backend, reporter);

        let image = result?;
        if let Err(err) = cleanup {
            reporter.write_error(&format!("Cleaning up intermediate resources failed: {}", err))?;
        }

        *stage = Stage::Idle;
        info!("created image {}", image.0);

        Ok(image)
    }
}

#[allow(clippy::too_many_arguments)]
fn run_stages(
    backend: &mut dyn ContainerBackend,
    provider: &mut dyn BaseImageProvider,
    stage: &mut Stage,
    resources: &mut ResourceStack,
    reporter: &mut Reporter,
    repository: &RepositoryInfo,
    options: &CreateImageOptions,
    final_name: ImageName,
) -> Result<FinalImage> {
    enter(stage, Stage::BuildingBase);
    let base = provider.produce(backend, reporter)?;
    if base.owned {
        resources.push(Resource::Image(base.name.clone()));
    }

    enter(stage, Stage::InitializingContainer);
    let container = reporter.nested("Initializing container...", |reporter| {
        initialize_container(backend, reporter, &base, options)
    })?;
    resources.push(Resource::Container(container.clone()));

    enter(stage, Stage::Committing);
    let temporary = reporter.nested("Committing container...", |reporter| {
        let name = ImageName(format!("devtools-tmp-{}", Uuid::new_v4().simple()));
        backend
            .commit_container(reporter, &container, &name)
            .map(TemporaryImage)
    })?;
    resources.push(Resource::Image(temporary.0.clone()));

    enter(stage, Stage::BuildingFinal);
    let spec = ImageBuildSpec {
        name: final_name,
        dockerfile: final_dockerfile(&temporary, repository, options),
    };
    let image = reporter.nested("Building final image...", |reporter| {
        backend.build_image(reporter, &spec)
    })?;

    Ok(FinalImage(image))
}

fn enter(stage: &mut Stage, next: Stage) {
    debug!("{} -> {}", stage, next);
    *stage = next;
}

/// `lowercase(repository):lowercase(commit + suffix)`, checked against the
/// image reference grammar so a bad name fails before anything is built.
pub fn final_image_name(repository: &RepositoryInfo, suffix: &str) -> Result<ImageName> {
    let valid_suffix = suffix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
    if !valid_suffix {
        return Err(Error::Configuration(format!(
            "the image name suffix '{}' may only contain letters, digits, '_', '.' and '-'",
            suffix
        ))
        .into());
    }

    let name = repository.name.to_lowercase();
    let component = Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$")?;
    if !component.is_match(&name) {
        return Err(Error::Configuration(format!(
            "the repository name '{}' is not a valid image name",
            repository.name
        ))
        .into());
    }

    let tag = format!(
        "{}{}",
        repository.commit.to_lowercase(),
        suffix.to_lowercase()
    );
    if tag.len() > MAX_TAG_LENGTH {
        return Err(Error::Configuration(format!(
            "the image tag '{}' is longer than {} characters",
            tag, MAX_TAG_LENGTH
        ))
        .into());
    }

    Ok(ImageName(format!("{}:{}", name, tag)))
}

fn initialize_container(
    backend: &mut dyn ContainerBackend,
    reporter: &mut Reporter,
    base: &BaseImage,
    options: &CreateImageOptions,
) -> Result<ContainerName> {
    let script = write_init_script(&options.repo_root, options)?;
    let script_name = script
        .path()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Precondition("the init script has no file name".into()))?;

    let spec = ContainerRunSpec {
        name: ContainerName(format!("devtools-init-{}", Uuid::new_v4().simple())),
        image: base.name.clone(),
        volumes: vec![Volume {
            host: options.repo_root.clone(),
            guest: SOURCE_MOUNT.into(),
        }],
        command: vec!["bash".into(), format!("{}/{}", SOURCE_MOUNT, script_name)],
    };

    let container = backend.run_container(reporter, &spec);
    if let Err(err) = script.close() {
        warn!("could not remove the init script: {}", err);
    }

    container
}

fn write_init_script(repo_root: &Path, options: &CreateImageOptions) -> Result<NamedTempFile> {
    let script = TempFileBuilder::new()
        .prefix(".devtools-init-")
        .suffix(".sh")
        .tempfile_in(repo_root)?;

    let mut file: &File = script.as_file();
    file.write_all(init_script(options).as_bytes())?;
    file.flush()?;

    Ok(script)
}

fn init_script(options: &CreateImageOptions) -> String {
    let mut bootstrap = shell_quote(&options.bootstrap_command);
    for arg in options.bootstrap_args.split_whitespace() {
        bootstrap.push(' ');
        bootstrap.push_str(&shell_quote(arg));
    }

    format!(
        "#!/usr/bin/env bash\n\
         set -euo pipefail\n\
         \n\
         git config --global --add safe.directory {source}\n\
         git clone {source} {context}\n\
         cd {context}\n\
         {bootstrap}\n",
        source = SOURCE_MOUNT,
        context = CONTEXT_DIR,
        bootstrap = bootstrap,
    )
}

fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));

    if plain {
        value.to_owned()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

fn final_dockerfile(
    temporary: &TemporaryImage,
    repository: &RepositoryInfo,
    options: &CreateImageOptions,
) -> String {
    let mut dockerfile = format!(
        "FROM {}\n\nWORKDIR {}\nENTRYPOINT [\"/bin/bash\"]\n",
        temporary.0, CONTEXT_DIR
    );

    let labels = [
        (LABEL_SOURCE, repository.remote_url.as_ref()),
        (LABEL_LICENSES, options.license.as_ref()),
        (LABEL_DESCRIPTION, options.description.as_ref()),
    ];
    for (label, value) in labels.iter() {
        if let Some(value) = value {
            dockerfile.push_str(&format!("LABEL {}=\"{}\"\n", label, label_value(value)));
        }
    }

    dockerfile
}

fn label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', " ")
}


#[cfg(test)]
mod tests {
    use std::fs;
    use tempfile::TempDir;

    use super::{
        testing::{FakeBackend, Operation},
        *,
    };
    use crate::{
        backends::DockerBackend,
        base_images::{DefaultBaseImage, ExistingBaseImage},
        output::testing::reporter,
        process::{testing::RecordingRunner, SystemRunner},
    };

    fn repository() -> RepositoryInfo {
        RepositoryInfo {
            remote_url: Some("https://github.com/owner/DevTools".into()),
            name: "DevTools".into(),
            commit: "ABC123".into(),
        }
    }

    fn run(backend: &mut FakeBackend, options: &CreateImageOptions) -> (Result<FinalImage>, Stage) {
        let (mut reporter, _) = reporter(false);
        let mut pipeline = ImagePipeline::new(backend, DefaultBaseImage::default());
        let result = pipeline.create_image(&mut reporter, &repository(), options);
        (result, pipeline.stage())
    }

    fn leftover_files(dir: &TempDir) -> Vec<String> {
        fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn creates_image_and_removes_intermediates() {
        let repo = TempDir::new().unwrap();
        let mut backend = FakeBackend::default();

        let (result, stage) = run(&mut backend, &CreateImageOptions::new(repo.path()));

        let image = result.unwrap();
        assert_eq!(image, FinalImage(ImageName("devtools:abc123".into())));
        assert_eq!(stage, Stage::Idle);

        let kinds = backend
            .operations
            .iter()
            .map(Operation::kind)
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                "build_image",
                "run_container",
                "commit_container",
                "build_image",
                "remove_image",
                "remove_container",
                "remove_image",
            ]
        );

        let (base, container, temporary) = match &backend.operations[..3] {
            [Operation::BuildImage(base), Operation::RunContainer(container), Operation::CommitContainer(committed, temporary)] =>
            {
                assert_eq!(committed, container);
                (base.clone(), container.clone(), temporary.clone())
            }
            other => panic!("unexpected operations: {:?}", other),
        };
        assert_eq!(
            backend.operations[3..],
            [
                Operation::BuildImage("devtools:abc123".into()),
                Operation::RemoveImage(temporary),
                Operation::RemoveContainer(container),
                Operation::RemoveImage(base),
            ]
        );

        assert!(leftover_files(&repo).is_empty());
    }

    #[test]
    fn init_script_clones_and_bootstraps() {
        let repo = TempDir::new().unwrap();
        let mut backend = FakeBackend::default();
        let mut options = CreateImageOptions::new(repo.path());
        options.bootstrap_args = "--package --verbose".into();

        run(&mut backend, &options).0.unwrap();

        assert_eq!(
            backend.scripts,
            vec![
                "#!/usr/bin/env bash\n\
                 set -euo pipefail\n\
                 \n\
                 git config --global --add safe.directory /source\n\
                 git clone /source /context\n\
                 cd /context\n\
                 ./Bootstrap.sh --package --verbose\n"
            ]
        );
    }

    #[test]
    fn final_image_carries_metadata() {
        let repo = TempDir::new().unwrap();
        let mut backend = FakeBackend::default();
        let mut options = CreateImageOptions::new(repo.path());
        options.name_suffix = "-Nightly".into();
        options.license = Some("MIT".into());
        options.description = Some("Tools \"for\" builds".into());

        let image = run(&mut backend, &options).0.unwrap();
        assert_eq!(image.0, ImageName("devtools:abc123-nightly".into()));

        let dockerfile = &backend.dockerfiles[1];
        assert!(dockerfile.starts_with("FROM devtools-tmp-"));
        assert!(dockerfile.contains("WORKDIR /context\nENTRYPOINT [\"/bin/bash\"]\n"));
        assert!(dockerfile
            .contains("LABEL org.opencontainers.image.source=\"https://github.com/owner/DevTools\"\n"));
        assert!(dockerfile.contains("LABEL org.opencontainers.image.licenses=\"MIT\"\n"));
        assert!(dockerfile
            .contains("LABEL org.opencontainers.image.description=\"Tools \\\"for\\\" builds\"\n"));
    }

    #[test]
    fn failed_base_build_runs_nothing_else() {
        let repo = TempDir::new().unwrap();
        let mut backend = FakeBackend::failing_on("build_image");

        let (result, stage) = run(&mut backend, &CreateImageOptions::new(repo.path()));

        assert!(result.is_err());
        assert_eq!(stage, Stage::Aborted);
        assert_eq!(backend.operations.len(), 1);
        assert_eq!(backend.count("build_image"), 1);
    }

    #[test]
    fn failed_run_removes_base_and_script() {
        let repo = TempDir::new().unwrap();
        let mut backend = FakeBackend::failing_on("run_container");

        let (result, _) = run(&mut backend, &CreateImageOptions::new(repo.path()));

        assert!(result.is_err());
        let kinds = backend
            .operations
            .iter()
            .map(Operation::kind)
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["build_image", "run_container", "remove_image"]);
        assert_eq!(backend.scripts.len(), 1);
        assert!(leftover_files(&repo).is_empty());
    }

    #[test]
    fn removals_match_successful_creations_at_every_failure_point() {
        let failures: Vec<(&str, Box<dyn Fn(&Operation) -> bool>)> = vec![
            ("none", Box::new(|_: &Operation| false)),
            (
                "base",
                Box::new(|op: &Operation| {
                    matches!(op, Operation::BuildImage(name) if name.starts_with("devtools-base-"))
                }),
            ),
            ("run", Box::new(|op: &Operation| op.kind() == "run_container")),
            ("commit", Box::new(|op: &Operation| op.kind() == "commit_container")),
            (
                "final",
                Box::new(|op: &Operation| {
                    matches!(op, Operation::BuildImage(name) if name.starts_with("devtools:"))
                }),
            ),
        ];

        for (label, predicate) in failures {
            let repo = TempDir::new().unwrap();
            let mut backend = FakeBackend::failing_when(predicate);
            let (result, _) = run(&mut backend, &CreateImageOptions::new(repo.path()));
            assert_eq!(result.is_ok(), label == "none", "{}", label);

            let failed_index = if result.is_err() {
                backend
                    .operations
                    .iter()
                    .rposition(|operation| !operation.kind().starts_with("remove"))
            } else {
                None
            };

            let mut created = 0;
            let mut removed = 0;
            for (index, operation) in backend.operations.iter().enumerate() {
                let failed = failed_index == Some(index);
                match operation {
                    Operation::BuildImage(name) if name.starts_with("devtools-base-") && !failed => {
                        created += 1
                    }
                    Operation::RunContainer(_) | Operation::CommitContainer(..) if !failed => {
                        created += 1
                    }
                    Operation::RemoveImage(_) | Operation::RemoveContainer(_) => removed += 1,
                    _ => (),
                }
            }

            assert_eq!(created, removed, "{}", label);
            assert!(leftover_files(&repo).is_empty(), "{}", label);
        }
    }

    #[test]
    fn existing_base_image_is_kept() {
        let repo = TempDir::new().unwrap();
        let mut backend = FakeBackend::default();
        let (mut reporter, _) = reporter(false);

        let mut pipeline =
            ImagePipeline::new(&mut backend, ExistingBaseImage(ImageName("python:3.12".into())));
        pipeline
            .create_image(&mut reporter, &repository(), &CreateImageOptions::new(repo.path()))
            .unwrap();
        drop(pipeline);

        assert_eq!(backend.count("build_image"), 1);
        assert_eq!(backend.count("remove_container"), 1);
        assert_eq!(backend.count("remove_image"), 1);
        assert!(!backend
            .operations
            .contains(&Operation::RemoveImage("python:3.12".into())));
    }

    #[test]
    fn invalid_suffix_fails_before_any_command() {
        let repo = TempDir::new().unwrap();
        let mut backend = FakeBackend::default();
        let mut options = CreateImageOptions::new(repo.path());
        options.name_suffix = "bad suffix".into();

        let (result, stage) = run(&mut backend, &options);

        let err = result.unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Configuration(_))));
        assert_eq!(stage, Stage::Idle);
        assert!(backend.operations.is_empty());
    }

    #[test]
    fn invalid_repository_name_fails_before_any_command() {
        let repo = TempDir::new().unwrap();
        let mut backend = FakeBackend::default();
        let (mut reporter, _) = reporter(false);
        let mut repository = repository();
        repository.name = "My Repo".into();

        let result = ImagePipeline::new(&mut backend, DefaultBaseImage::default()).create_image(
            &mut reporter,
            &repository,
            &CreateImageOptions::new(repo.path()),
        );

        let err = result.unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Configuration(_))));
        assert!(backend.operations.is_empty());
    }

    #[test]
    fn image_names() {
        let mut repository = repository();
        assert_eq!(
            final_image_name(&repository, "").unwrap(),
            ImageName("devtools:abc123".into())
        );

        repository.name = "dev_tools-2.x".into();
        assert_eq!(
            final_image_name(&repository, ".rc1").unwrap(),
            ImageName("dev_tools-2.x:abc123.rc1".into())
        );

        for name in ["-tools", "tools.", "a..b", "café", ""].iter() {
            repository.name = (*name).into();
            assert!(final_image_name(&repository, "").is_err(), "{}", name);
        }

        repository.name = "tools".into();
        assert!(final_image_name(&repository, &"x".repeat(130)).is_err());
    }

    #[test]
    fn vanished_init_script_does_not_leak_the_container() {
        let repo = TempDir::new().unwrap();
        let mut backend = FakeBackend::default();
        backend.consume_scripts = true;

        let (result, _) = run(&mut backend, &CreateImageOptions::new(repo.path()));

        result.unwrap();
        assert_eq!(backend.scripts.len(), 1);
        assert_eq!(backend.count("remove_container"), 1);
        assert_eq!(backend.count("remove_image"), 2);
        assert!(leftover_files(&repo).is_empty());
    }

    #[test]
    fn docker_commands_for_a_successful_run() {
        let repo = TempDir::new().unwrap();
        let (mut reporter, _) = reporter(false);
        let mut backend = DockerBackend::new(RecordingRunner::default(), "docker");

        ImagePipeline::new(&mut backend, DefaultBaseImage::default())
            .create_image(&mut reporter, &repository(), &CreateImageOptions::new(repo.path()))
            .unwrap();

        let runner = backend.runner_mut();
        let rendered = runner.rendered();
        assert_eq!(rendered.len(), 7, "{:#?}", rendered);

        let base = runner.commands[0].args[2].clone();
        let container = runner.commands[1].args[2].clone();
        let temporary = runner.commands[2].args[2].clone();
        assert!(base.starts_with("devtools-base-"));
        assert!(container.starts_with("devtools-init-"));
        assert!(temporary.starts_with("devtools-tmp-"));

        assert!(rendered[0].starts_with(&format!("docker build --tag {} --file ", base)));
        assert!(rendered[1].starts_with(&format!(
            "docker run --name {} --volume {}:/source {} bash /source/.devtools-init-",
            container,
            repo.path().display(),
            base
        )));
        assert_eq!(rendered[2], format!("docker commit {} {}", container, temporary));
        assert!(rendered[3].starts_with("docker build --tag devtools:abc123 --file "));
        assert_eq!(
            rendered[4..],
            [
                format!("docker image rm {}", temporary),
                format!("docker container rm {}", container),
                format!("docker image rm {}", base),
            ]
        );
        assert!(leftover_files(&repo).is_empty());
    }

    #[test]
    fn docker_commands_after_a_failed_commit() {
        let repo = TempDir::new().unwrap();
        let (mut reporter, _) = reporter(false);
        let runner = RecordingRunner::default().fail_when("docker commit", 1);
        let mut backend = DockerBackend::new(runner, "docker");

        let result = ImagePipeline::new(&mut backend, DefaultBaseImage::default()).create_image(
            &mut reporter,
            &repository(),
            &CreateImageOptions::new(repo.path()),
        );
        assert!(result.is_err());

        let runner = backend.runner_mut();
        let base = runner.commands[0].args[2].clone();
        let container = runner.commands[1].args[2].clone();
        let rendered = runner.rendered();
        assert_eq!(rendered.len(), 5, "{:#?}", rendered);
        assert!(rendered[2].starts_with("docker commit "));
        assert_eq!(
            rendered[3..],
            [
                format!("docker container rm {}", container),
                format!("docker image rm {}", base),
            ]
        );
    }

    #[test]
    fn dry_run_shows_every_docker_command() {
        let repo = TempDir::new().unwrap();
        let (mut reporter, captured) = reporter(false);
        let mut backend = DockerBackend::new(SystemRunner::new(true), "docker");

        let image = ImagePipeline::new(&mut backend, DefaultBaseImage::default())
            .create_image(&mut reporter, &repository(), &CreateImageOptions::new(repo.path()))
            .unwrap();

        assert_eq!(image.0, ImageName("devtools:abc123".into()));
        let dry_runs = captured
            .contents()
            .lines()
            .filter(|line| line.trim_start().starts_with("INFO: Dry run: docker "))
            .count();
        assert_eq!(dry_runs, 7);
        assert!(leftover_files(&repo).is_empty());
    }

    #[test]
    fn missing_repository_root_is_a_precondition_error() {
        let repo = TempDir::new().unwrap();
        let mut backend = FakeBackend::default();
        let options = CreateImageOptions::new(repo.path().join("missing"));

        let (result, _) = run(&mut backend, &options);

        let err = result.unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Precondition(_))));
        assert!(backend.operations.is_empty());
    }

    #[test]
    fn quoting_for_the_init_script() {
        assert_eq!(shell_quote("--package"), "--package");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(rm)"), "'$(rm)'");
    }
}
