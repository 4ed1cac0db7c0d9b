mod parser;

use uuid::Uuid;

/// Errors from [`Reference::try_from`].
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("Image download protocol {0} is not supported.")]
    UnsupportedScheme(String),

    #[error("Scheme-less image href is not a UUID.")]
    NotAnImageId,

    #[error("Invalid image identifier in {0:?}.")]
    InvalidImageId(String),
}

/// Reference to an image, classified by the service that can retrieve it.
///
/// Only the scheme is inspected. The rest of the reference is parsed by
/// the service.
///
/// * A UUID, or a UUID after `glance://`, is an image in the registry.
/// * `http://` and `https://` URLs are downloaded from a web server.
/// * `file://` URLs are files in the local host.
///
/// Schemes are case-insensitive.
///
/// # Examples
///
/// ```
/// # use image_fetch::*;
/// let reference = Reference::try_from("https://example.com/fedora.qcow2").unwrap();
/// assert_eq!(reference, Reference::Http("https://example.com/fedora.qcow2"));
///
/// let reference = Reference::try_from("glance://0b38d6e6-2c3b-4e59-9e15-0fbd0b5a4d11").unwrap();
/// assert!(matches!(reference, Reference::Registry(_)));
///
/// assert!(Reference::try_from("usenet://alt.binaries.dvd/image.qcow2").is_err());
/// ```
#[derive(Clone, Debug, PartialEq)]
pub enum Reference<'a> {
    /// Image identifier in the registry.
    Registry(Uuid),

    /// `http://` or `https://` URL.
    Http(&'a str),

    /// `file://` URL.
    File(&'a str),
}

impl<'a> TryFrom<&'a str> for Reference<'a> {
    type Error = ParseError;

    fn try_from(reference: &'a str) -> Result<Self, Self::Error> {
        parser::parse(reference)
    }
}
