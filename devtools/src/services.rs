use anyhow::Result;
use std::{path::Path, str::FromStr};

use crate::{
    errors::Error,
    models::{BaseImage, ContainerName, ContainerRunSpec, ImageBuildSpec, ImageName},
    output::Reporter,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArchiveFormat {
    Gzip,
    Zip,
}

impl ArchiveFormat {
    /// Zip on Windows, gzip everywhere else.
    pub fn native() -> ArchiveFormat {
        if cfg!(windows) {
            ArchiveFormat::Zip
        } else {
            ArchiveFormat::Gzip
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::Gzip => "gz",
            ArchiveFormat::Zip => "zip",
        }
    }
}

impl FromStr for ArchiveFormat {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "gzip" | "gz" => Ok(ArchiveFormat::Gzip),
            "zip" => Ok(ArchiveFormat::Zip),
            other => Err(Error::Configuration(format!(
                "unknown archive format '{}', expected 'gzip' or 'zip'",
                other
            ))),
        }
    }
}

/// Every operation is a single external command; a non-zero exit code is
/// returned as `Error::CommandFailed`.
pub trait ContainerBackend {
    fn build_image(&mut self, reporter: &mut Reporter, spec: &ImageBuildSpec) -> Result<ImageName>;

    /// Runs the container to completion. The stopped container is kept so
    /// it can be committed.
    fn run_container(
        &mut self,
        reporter: &mut Reporter,
        spec: &ContainerRunSpec,
    ) -> Result<ContainerName>;

    fn commit_container(
        &mut self,
        reporter: &mut Reporter,
        container: &ContainerName,
        image: &ImageName,
    ) -> Result<ImageName>;

    fn remove_container(&mut self, reporter: &mut Reporter, container: &ContainerName)
        -> Result<()>;

    fn remove_image(&mut self, reporter: &mut Reporter, image: &ImageName) -> Result<()>;

    fn tag_image(
        &mut self,
        reporter: &mut Reporter,
        source: &ImageName,
        target: &ImageName,
    ) -> Result<()>;

    fn push_image(&mut self, reporter: &mut Reporter, image: &ImageName) -> Result<()>;

    fn save_image(&mut self, reporter: &mut Reporter, image: &ImageName, output: &Path)
        -> Result<()>;

    /// Compresses `archive` into `output`.
    fn compress_archive(
        &mut self,
        reporter: &mut Reporter,
        archive: &Path,
        format: ArchiveFormat,
        output: &Path,
    ) -> Result<()>;
}

/// How the pipeline obtains the image it starts the bootstrap container
/// from.
pub trait BaseImageProvider {
    fn produce(
        &mut self,
        backend: &mut dyn ContainerBackend,
        reporter: &mut Reporter,
    ) -> Result<BaseImage>;
}
