//! Classify image references by their scheme.

use super::*;

/// Scheme for references to images in the registry.
const REGISTRY_SCHEME: &str = "glance";

type Result<T> = std::result::Result<T, ParseError>;

pub(super) fn parse(reference: &str) -> Result<Reference<'_>> {
    // Without a scheme, the reference must be an image identifier.
    let Some((scheme, tail)) = split_scheme(reference) else {
        return Uuid::parse_str(reference.trim())
            .map(Reference::Registry)
            .map_err(|_| ParseError::NotAnImageId);
    };

    match scheme.to_ascii_lowercase().as_str() {
        "http" | "https" => Ok(Reference::Http(reference)),

        "file" => Ok(Reference::File(reference)),

        REGISTRY_SCHEME => tail
            .strip_prefix("//")
            .map(|id| id.trim_end_matches('/'))
            .and_then(|id| Uuid::parse_str(id).ok())
            .map(Reference::Registry)
            .ok_or_else(|| ParseError::InvalidImageId(reference.to_owned())),

        _ => Err(ParseError::UnsupportedScheme(scheme.to_owned())),
    }
}

/// Split the scheme (the part before the first `:`) from the reference.
///
/// Return `None` if there is no valid scheme, as defined in
/// [RFC 3986](https://www.rfc-editor.org/rfc/rfc3986#section-3.1).
fn split_scheme(reference: &str) -> Option<(&str, &str)> {
    let (scheme, tail) = reference.split_once(':')?;

    let mut chars = scheme.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));

    valid.then_some((scheme, tail))
}

#[test]
fn classify_valid_references() {
    const ID: &str = "0b38d6e6-2c3b-4e59-9e15-0fbd0b5a4d11";

    let id = Uuid::parse_str(ID).unwrap();

    macro_rules! check {
        ($reference:expr, $expected:expr) => {
            let reference = $reference;
            assert_eq!(
                Reference::try_from(<_ as AsRef<str>>::as_ref(&reference)),
                Ok($expected),
                "{reference}",
            )
        };
    }

    check!(ID, Reference::Registry(id));
    check!(ID.to_uppercase(), Reference::Registry(id));
    check!(format!("glance://{ID}"), Reference::Registry(id));
    check!(format!("GLANCE://{ID}/"), Reference::Registry(id));

    check!(
        "http://127.0.0.1/image.qcow2",
        Reference::Http("http://127.0.0.1/image.qcow2")
    );

    check!(
        "HTTPS://127.0.0.1/image.qcow2",
        Reference::Http("HTTPS://127.0.0.1/image.qcow2")
    );

    check!(
        "file:///home/user/image.qcow2",
        Reference::File("file:///home/user/image.qcow2")
    );
}

#[test]
fn reject_invalid_references() {
    assert_eq!(
        Reference::try_from("usenet://alt.binaries.dvd/image.qcow2"),
        Err(ParseError::UnsupportedScheme("usenet".to_owned()))
    );

    assert_eq!(
        Reference::try_from("no scheme, no uuid"),
        Err(ParseError::NotAnImageId)
    );

    assert_eq!(Reference::try_from(""), Err(ParseError::NotAnImageId));

    assert!(matches!(
        Reference::try_from("glance://not-a-uuid"),
        Err(ParseError::InvalidImageId(_))
    ));

    assert!(matches!(
        Reference::try_from("glance:0b38d6e6-2c3b-4e59-9e15-0fbd0b5a4d11"),
        Err(ParseError::InvalidImageId(_))
    ));
}

#[test]
fn scheme_syntax() {
    assert_eq!(split_scheme("a+b.c-d:x"), Some(("a+b.c-d", "x")));
    assert_eq!(split_scheme("1abc:x"), None);
    assert_eq!(split_scheme("no scheme, no uuid"), None);
    assert_eq!(split_scheme("has space:x"), None);
}
