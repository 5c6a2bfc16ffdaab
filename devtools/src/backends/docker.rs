use anyhow::Result;
use log::{info, warn};
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

use crate::{
    models::{ContainerName, ContainerRunSpec, ImageBuildSpec, ImageName},
    output::Reporter,
    process::{CommandLine, CommandRunner},
    services::{ArchiveFormat, ContainerBackend},
};

/// Drives the `docker` command line tool.
pub struct DockerBackend<R> {
    runner: R,
    docker: String,
}

impl<R: CommandRunner> DockerBackend<R> {
    pub fn new<S: Into<String>>(runner: R, docker: S) -> DockerBackend<R> {
        DockerBackend {
            runner,
            docker: docker.into(),
        }
    }

    #[cfg(test)]
    pub fn runner_mut(&mut self) -> &mut R {
        &mut self.runner
    }

    fn docker(&self) -> CommandLine {
        CommandLine::new(self.docker.as_str())
    }

    fn run(&mut self, reporter: &mut Reporter, command: CommandLine) -> Result<()> {
        let result = self.runner.stream(reporter, &command)?;
        result.check(&command)?;
        Ok(())
    }
}

impl<R: CommandRunner> ContainerBackend for DockerBackend<R> {
    fn build_image(&mut self, reporter: &mut Reporter, spec: &ImageBuildSpec) -> Result<ImageName> {
        let temp_dir = TempDir::new()?;
        let dockerfile_path = temp_dir.path().join("Dockerfile");

        let mut dockerfile = {
            let mut options = OpenOptions::new();
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            options.write(true).create(true).open(&dockerfile_path)?
        };
        dockerfile.write_all(spec.dockerfile.as_bytes())?;
        drop(dockerfile);

        reporter.write_verbose(&format!("Dockerfile:\n{}", spec.dockerfile))?;

        let command = self
            .docker()
            .args(vec!["build", "--tag", spec.name.0.as_str(), "--file"])
            .path_arg(&dockerfile_path)
            .path_arg(temp_dir.path());
        self.run(reporter, command)?;

        temp_dir.close()?;

        Ok(spec.name.clone())
    }

    fn run_container(
        &mut self,
        reporter: &mut Reporter,
        spec: &ContainerRunSpec,
    ) -> Result<ContainerName> {
        let mut command = self.docker().args(vec!["run", "--name", spec.name.0.as_str()]);
        for volume in spec.volumes.iter() {
            command = command.arg("--volume").arg(format!(
                "{}:{}",
                volume.host.to_string_lossy(),
                volume.guest
            ));
        }
        let command = command
            .arg(spec.image.0.as_str())
            .args(spec.command.iter().map(String::as_str));

        let result = self.runner.stream(reporter, &command)?;
        if let Err(err) = result.check(&command) {
            // docker has already created the container even though the
            // command inside it failed.
            let remove = self
                .docker()
                .args(vec!["container", "rm", "--force", spec.name.0.as_str()]);
            match self.runner.capture(&remove) {
                Ok(removed) if removed.success() => info!("removed failed container {}", spec.name),
                _ => warn!("could not remove failed container {}", spec.name),
            }
            return Err(err.into());
        }

        Ok(spec.name.clone())
    }

    fn commit_container(
        &mut self,
        reporter: &mut Reporter,
        container: &ContainerName,
        image: &ImageName,
    ) -> Result<ImageName> {
        let command = self
            .docker()
            .args(vec!["commit", container.0.as_str(), image.0.as_str()]);
        self.run(reporter, command)?;

        Ok(image.clone())
    }

    fn remove_container(
        &mut self,
        reporter: &mut Reporter,
        container: &ContainerName,
    ) -> Result<()> {
        let command = self
            .docker()
            .args(vec!["container", "rm", container.0.as_str()]);
        self.run(reporter, command)
    }

    fn remove_image(&mut self, reporter: &mut Reporter, image: &ImageName) -> Result<()> {
        let command = self.docker().args(vec!["image", "rm", image.0.as_str()]);
        self.run(reporter, command)
    }

    fn tag_image(
        &mut self,
        reporter: &mut Reporter,
        source: &ImageName,
        target: &ImageName,
    ) -> Result<()> {
        let command = self
            .docker()
            .args(vec!["tag", source.0.as_str(), target.0.as_str()]);
        self.run(reporter, command)
    }

    fn push_image(&mut self, reporter: &mut Reporter, image: &ImageName) -> Result<()> {
        let command = self.docker().args(vec!["push", image.0.as_str()]);
        self.run(reporter, command)
    }

    fn save_image(
        &mut self,
        reporter: &mut Reporter,
        image: &ImageName,
        output: &Path,
    ) -> Result<()> {
        let command = self
            .docker()
            .args(vec!["save", "--output"])
            .path_arg(output)
            .arg(image.0.as_str());
        self.run(reporter, command)
    }

    fn compress_archive(
        &mut self,
        reporter: &mut Reporter,
        archive: &Path,
        format: ArchiveFormat,
        output: &Path,
    ) -> Result<()> {
        match format {
            ArchiveFormat::Gzip => {
                let command = CommandLine::new("gzip").path_arg(archive);
                self.run(reporter, command)?;

                let mut produced = archive.as_os_str().to_owned();
                produced.push(".gz");
                let produced = PathBuf::from(produced);

                if produced != output && produced.exists() {
                    fs::rename(&produced, output)?;
                }
            }
            ArchiveFormat::Zip => {
                let command = CommandLine::new("PowerShell")
                    .args(vec!["-NoProfile", "-Command", "Compress-Archive", "-Path"])
                    .path_arg(archive)
                    .arg("-DestinationPath")
                    .path_arg(output);
                self.run(reporter, command)?;
            }
        }

        Ok(())
    }
}
