use anyhow::Result;
use log::info;
use uuid::Uuid;

use crate::{
    models::{BaseImage, ImageBuildSpec, ImageName},
    output::Reporter,
    services::{BaseImageProvider, ContainerBackend},
};

const DEFAULT_FROM: &str = "ubuntu:22.04";
const DEFAULT_PACKAGES: &[&str] = &[
    "ca-certificates",
    "curl",
    "git",
    "python3",
    "python3-pip",
    "python3-venv",
];

/// Builds a throwaway image with an OS and the toolchain the bootstrap
/// script needs.
pub struct DefaultBaseImage {
    pub from: String,
    pub packages: Vec<String>,
}

impl Default for DefaultBaseImage {
    fn default() -> Self {
        DefaultBaseImage {
            from: DEFAULT_FROM.into(),
            packages: DEFAULT_PACKAGES.iter().map(|p| (*p).to_owned()).collect(),
        }
    }
}

impl DefaultBaseImage {
    pub fn dockerfile(&self) -> String {
        format!(
            "FROM {}\n\
             \n\
             ENV DEBIAN_FRONTEND=noninteractive\n\
             \n\
             RUN apt-get update \\\n    \
             && apt-get install -y --no-install-recommends {} \\\n    \
             && rm -rf /var/lib/apt/lists/*\n",
            self.from,
            self.packages.join(" "),
        )
    }
}

impl BaseImageProvider for DefaultBaseImage {
    fn produce(
        &mut self,
        backend: &mut dyn ContainerBackend,
        reporter: &mut Reporter,
    ) -> Result<BaseImage> {
        let spec = ImageBuildSpec {
            name: ImageName(format!("devtools-base-{}", Uuid::new_v4().simple())),
            dockerfile: self.dockerfile(),
        };

        let name = reporter.nested("Building base image...", |reporter| {
            backend.build_image(reporter, &spec)
        })?;
        info!("built base image {}", name);

        Ok(BaseImage { name, owned: true })
    }
}

/// An image that already exists. It belongs to the caller and is never
/// removed.
pub struct ExistingBaseImage(pub ImageName);

impl BaseImageProvider for ExistingBaseImage {
    fn produce(
        &mut self,
        _backend: &mut dyn ContainerBackend,
        reporter: &mut Reporter,
    ) -> Result<BaseImage> {
        reporter.write_verbose(&format!("Using base image '{}'.", self.0))?;

        Ok(BaseImage {
            name: self.0.clone(),
            owned: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        output::testing::reporter,
        pipeline::testing::{FakeBackend, Operation},
    };

    #[test]
    fn default_image_is_owned_and_uniquely_named() {
        let (mut reporter, _) = reporter(false);
        let mut backend = FakeBackend::default();
        let mut provider = DefaultBaseImage::default();

        let first = provider.produce(&mut backend, &mut reporter).unwrap();
        let second = provider.produce(&mut backend, &mut reporter).unwrap();

        assert!(first.owned);
        assert!(first.name.0.starts_with("devtools-base-"));
        assert_ne!(first.name, second.name);
        assert_eq!(
            backend.operations[0],
            Operation::BuildImage(first.name.0.clone())
        );
    }

    #[test]
    fn default_dockerfile_installs_the_toolchain() {
        let dockerfile = DefaultBaseImage::default().dockerfile();

        assert!(dockerfile.starts_with("FROM ubuntu:22.04\n"));
        assert!(dockerfile.contains(
            "apt-get install -y --no-install-recommends ca-certificates curl git python3 python3-pip python3-venv"
        ));
    }

    #[test]
    fn existing_image_runs_nothing() {
        let (mut reporter, _) = reporter(false);
        let mut backend = FakeBackend::default();

        let image = ExistingBaseImage(ImageName("python:3.12".into()))
            .produce(&mut backend, &mut reporter)
            .unwrap();

        assert!(!image.owned);
        assert_eq!(image.name.0, "python:3.12");
        assert!(backend.operations.is_empty());
    }
}
