use anyhow::Result;
use log::{debug, warn};

use crate::{
    models::{ContainerName, ImageName},
    output::Reporter,
    services::ContainerBackend,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resource {
    Container(ContainerName),
    Image(ImageName),
}

/// Cleanup obligations for everything a pipeline run has acquired so far.
/// Resources are released in reverse order of acquisition.
#[derive(Debug, Default)]
pub struct ResourceStack {
    resources: Vec<Resource>,
}

impl ResourceStack {
    pub fn new() -> ResourceStack {
        Default::default()
    }

    pub fn push(&mut self, resource: Resource) {
        debug!("acquired {:?}", resource);
        self.resources.push(resource);
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Releases every resource, innermost first. A failed removal does not
    /// stop the remaining ones; the first failure is returned.
    pub fn unwind(
        &mut self,
        backend: &mut dyn ContainerBackend,
        reporter: &mut Reporter,
    ) -> Result<()> {
        let mut first_error = None;

        while let Some(resource) = self.resources.pop() {
            let result = match &resource {
                Resource::Container(name) => {
                    reporter.nested(&format!("Removing container '{}'...", name), |reporter| {
                        backend.remove_container(reporter, name)
                    })
                }
                Resource::Image(name) => {
                    reporter.nested(&format!("Removing image '{}'...", name), |reporter| {
                        backend.remove_image(reporter, name)
                    })
                }
            };

            if let Err(err) = result {
                warn!("failed to release {:?}: {}", resource, err);
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for ResourceStack {
    fn drop(&mut self) {
        if !self.resources.is_empty() {
            warn!("dropped without releasing {:?}", self.resources);
        }
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
    fn unwinds_in_reverse_order() {
        let (mut reporter, _) = reporter(false);
        let mut backend = FakeBackend::default();
        let mut stack = ResourceStack::new();

        stack.push(Resource::Image(ImageName("base".into())));
        stack.push(Resource::Container(ContainerName("init".into())));
        stack.push(Resource::Image(ImageName("tmp".into())));

        stack.unwind(&mut backend, &mut reporter).unwrap();

        assert!(stack.is_empty());
        assert_eq!(
            backend.operations,
            vec![
                Operation::RemoveImage("tmp".into()),
                Operation::RemoveContainer("init".into()),
                Operation::RemoveImage("base".into()),
            ]
        );
    }

    #[test]
    fn keeps_going_after_a_failed_removal() {
        let (mut reporter, captured) = reporter(false);
        let mut backend = FakeBackend::failing_on("remove_container");
        let mut stack = ResourceStack::new();

        stack.push(Resource::Image(ImageName("base".into())));
        stack.push(Resource::Container(ContainerName("init".into())));

        assert!(stack.unwind(&mut backend, &mut reporter).is_err());

        assert!(stack.is_empty());
        assert_eq!(
            backend.operations,
            vec![
                Operation::RemoveContainer("init".into()),
                Operation::RemoveImage("base".into()),
            ]
        );
        assert_eq!(
            captured.scrubbed(),
            "Removing container 'init'...FAILED! (1, <duration>)\nRemoving image 'base'...DONE! (0, <duration>)\n"
        );
    }
}
