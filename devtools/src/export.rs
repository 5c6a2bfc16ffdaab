use anyhow::Result;
use log::info;
use number_prefix::NumberPrefix;
use std::{
    fs,
    path::{Path, PathBuf},
};
use uuid::Uuid;

use crate::{
    errors::Error,
    models::ImageName,
    output::Reporter,
    services::{ArchiveFormat, ContainerBackend},
};

/// Writes `image` to a compressed archive at `output`. Steps that already
/// ran are kept when a later one fails.
pub fn save_image(
    backend: &mut dyn ContainerBackend,
    reporter: &mut Reporter,
    image: &ImageName,
    output: &Path,
    format: ArchiveFormat,
    delete_image: bool,
) -> Result<()> {
    let archive = intermediate_archive(output, format);

    if output.exists() {
        reporter.nested(&format!("Removing '{}'...", output.display()), |_| {
            fs::remove_file(output)?;
            Ok(())
        })?;
    }

    reporter.nested(&format!("Saving '{}'...", image), |reporter| {
        backend.save_image(reporter, image, &archive)
    })?;

    reporter.nested(&format!("Compressing '{}'...", archive.display()), |reporter| {
        backend.compress_archive(reporter, &archive, format, output)?;

        if archive != output && archive.exists() {
            fs::remove_file(&archive)?;
        }

        if let Ok(metadata) = fs::metadata(output) {
            let size = match NumberPrefix::binary(metadata.len() as f64) {
                NumberPrefix::Standalone(bytes) => format!("{} bytes", bytes),
                NumberPrefix::Prefixed(prefix, n) => format!("{:.1} {}B", n, prefix),
            };
            reporter.write_verbose(&format!("Created '{}' ({})", output.display(), size))?;
        }

        Ok(())
    })?;

    if delete_image {
        reporter.nested(&format!("Removing image '{}'...", image), |reporter| {
            backend.remove_image(reporter, image)
        })?;
    }

    info!("saved {} to {:?}", image, output);
    Ok(())
}

/// `out.tar.gz` and `out.zip` are both produced from `out.tar`. The
/// intermediate never shares its path with `output`.
fn intermediate_archive(output: &Path, format: ArchiveFormat) -> PathBuf {
    let extension = format!(".{}", format.extension());
    let file_name = output
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let stem = file_name.strip_suffix(&extension).unwrap_or(&file_name);
    let stem = stem.strip_suffix(".tar").unwrap_or(stem);

    let archive = output.with_file_name(format!("{}.tar", stem));
    if archive != output {
        return archive;
    }

    output.with_file_name(format!("{}.{}.tar", stem, Uuid::new_v4().simple()))
}

/// `[registry/][namespace/]repository[:tag]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: Option<String>,
    pub namespace: Option<String>,
    pub repository: String,
}

impl ImageReference {
    pub fn parse(name: &str) -> Result<ImageReference, Error> {
        let mut parts = name.split('/').collect::<Vec<_>>();
        if name.is_empty() || parts.iter().any(|part| part.is_empty()) {
            return Err(Error::Configuration(format!(
                "'{}' is not a valid image name",
                name
            )));
        }

        let registry = if parts.len() > 1 && is_registry(parts[0]) {
            Some(parts.remove(0).to_owned())
        } else {
            None
        };

        let repository = parts.pop().unwrap_or_default().to_owned();
        let namespace = if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        };

        Ok(ImageReference {
            registry,
            namespace,
            repository,
        })
    }

    pub fn name(&self) -> ImageName {
        let mut parts = Vec::new();
        parts.extend(self.registry.as_deref());
        parts.extend(self.namespace.as_deref());
        parts.push(self.repository.as_str());

        ImageName(parts.join("/"))
    }
}

fn is_registry(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

/// Combines the embedded parts of `image` with the explicit registry and
/// username. Giving a part both ways is ambiguous and rejected.
pub fn push_target(
    image: &ImageName,
    registry_url: Option<&str>,
    username: Option<&str>,
) -> Result<ImageName, Error> {
    let mut reference = ImageReference::parse(&image.0)?;

    if let Some(username) = username {
        if let Some(namespace) = &reference.namespace {
            return Err(Error::Configuration(format!(
                "the username '{}' was provided, but the image name '{}' already contains '{}'",
                username, image, namespace
            )));
        }
        reference.namespace = Some(username.to_owned());
    }

    if let Some(registry_url) = registry_url {
        if let Some(registry) = &reference.registry {
            return Err(Error::Configuration(format!(
                "the registry '{}' was provided, but the image name '{}' already contains '{}'",
                registry_url, image, registry
            )));
        }

        let registry_url = registry_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        reference.registry = Some(registry_url.to_owned());
    }

    Ok(reference.name())
}

pub fn push_image(
    backend: &mut dyn ContainerBackend,
    reporter: &mut Reporter,
    image: &ImageName,
    registry_url: Option<&str>,
    username: Option<&str>,
    delete_tag: bool,
) -> Result<ImageName> {
    let target = push_target(image, registry_url, username)?;
    let retagged = target != *image;

    if retagged {
        reporter.nested(&format!("Tagging '{}' as '{}'...", image, target), |reporter| {
            backend.tag_image(reporter, image, &target)
        })?;
    }

    reporter.nested(&format!("Pushing '{}'...", target), |reporter| {
        backend.push_image(reporter, &target)
    })?;

    // Only the tag created here is ours to remove.
    if delete_tag && retagged {
        reporter.nested(&format!("Removing tag '{}'...", target), |reporter| {
            backend.remove_image(reporter, &target)
        })?;
    }

    info!("pushed {}", target);
    Ok(target)
}
