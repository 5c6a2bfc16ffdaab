use std::{fmt, path::PathBuf};

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ImageName(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ContainerName(pub String);

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Starting image for the bootstrap container. Only images the pipeline
/// built itself are `owned` and removed once the run is over.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BaseImage {
    pub name: ImageName,
    pub owned: bool,
}

/// Snapshot of the bootstrapped container, removed once the final image
/// has been built on top of it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemporaryImage(pub ImageName);

/// The distributable image. Never removed by the pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalImage(pub ImageName);

#[derive(Clone, Debug)]
pub struct ImageBuildSpec {
    pub name: ImageName,
    /// Contents of the build definition; there is no other build context.
    pub dockerfile: String,
}

#[derive(Clone, Debug)]
pub struct Volume {
    pub host: PathBuf,
    pub guest: String,
}

#[derive(Clone, Debug)]
pub struct ContainerRunSpec {
    pub name: ContainerName,
    pub image: ImageName,
    pub volumes: Vec<Volume>,
    pub command: Vec<String>,
}
