use std::sync::Arc;

use crate::{
    config::Settings, EventHandler, FileImageService, HttpImageService, ImageError, ImageSource,
    NoEventHandler, Reference, RegistryConnector, RequestContext,
};

/// Select the image service for a reference.
///
/// # Examples
///
/// ```
/// # use image_fetch::*;
/// let resolver = Resolver::new(RetrievalConfig::default().timeout(15));
///
/// let source = resolver.resolve("file:///srv/images/fedora.qcow2", None).unwrap();
/// assert!(matches!(source, ImageSource::File(_)));
///
/// assert!(matches!(
///     resolver.resolve("usenet://alt.binaries.dvd/image.qcow2", None),
///     Err(ImageError::InvalidReference { .. }),
/// ));
/// ```
pub struct Resolver {
    settings: Settings,
    registry: Option<Arc<dyn RegistryConnector>>,
    event_handler: Arc<dyn EventHandler>,
}

impl Resolver {
    pub fn new(settings: impl Into<Settings>) -> Self {
        Resolver {
            settings: settings.into(),
            registry: None,
            event_handler: Arc::new(NoEventHandler),
        }
    }

    /// Client for references to images in the registry.
    ///
    /// Without it, those references are rejected.
    pub fn registry(mut self, connector: impl RegistryConnector + 'static) -> Self {
        self.registry = Some(Arc::new(connector));
        self
    }

    /// Handler for the events of the services created by this resolver.
    pub fn event_handler(mut self, event_handler: impl EventHandler) -> Self {
        self.event_handler = Arc::new(event_handler);
        self
    }

    /// Settings shared with the services created by this resolver.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Get the service for `reference`.
    ///
    /// `context` is only used for images in the registry.
    pub fn resolve(
        &self,
        reference: &str,
        context: Option<&RequestContext>,
    ) -> Result<ImageSource, ImageError> {
        let parsed = Reference::try_from(reference)
            .map_err(|e| ImageError::invalid_reference(reference, e))?;

        let source = match parsed {
            Reference::Http(_) => ImageSource::Http(
                HttpImageService::new(self.settings.clone())
                    .event_handler(self.event_handler.clone()),
            ),

            Reference::File(_) => ImageSource::File(
                FileImageService::new().event_handler(self.event_handler.clone()),
            ),

            Reference::Registry(id) => {
                let Some(registry) = &self.registry else {
                    return Err(ImageError::invalid_reference(
                        reference,
                        "No image registry is configured.",
                    ));
                };

                ImageSource::Registry(registry.connect(id, None, context)?)
            }
        };

        tracing::debug!(?source, "Image service selected");

        Ok(source)
    }
}
