use std::{fmt::Display, path::Path};

/// Handler to receive notifications while images are retrieved.
///
/// All methods are optional.
#[expect(unused_variables)]
pub trait EventHandler: Send + Sync + 'static {
    /// HTTP request to the image server.
    ///
    /// `url` is [`SECRET_PLACEHOLDER`](crate::SECRET_PLACEHOLDER) when
    /// the request was made for a secret reference.
    fn http_request(&self, method: &str, url: &str) {}

    /// Some data (in `bytes`) has been written to the destination file.
    fn download_progress_bytes(&self, bytes: usize) {}

    /// A local image could not be hard-linked, and it is going to be copied.
    fn copy_fallback(&self, source: &Path, cause: &dyn Display) {}

    /// The image in `reference` was completely downloaded.
    fn finished(&self, reference: &str) {}
}

/// [`EventHandler`] instance to ignore all events.
pub struct NoEventHandler;

impl EventHandler for NoEventHandler {}
