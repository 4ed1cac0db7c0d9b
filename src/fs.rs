use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use rustix::{
    fs::{linkat, AtFlags, CWD},
    io::Errno,
};

use crate::{EventHandler, ImageError, ImageMetadata, ImageService, NoEventHandler, Validated};

/// Errors from `linkat` that can be solved by copying the file.
const COPY_FALLBACK_ERRORS: &[Errno] = &[
    Errno::XDEV,
    Errno::PERM,
    Errno::ACCESS,
    Errno::NOTSUP,
    Errno::OPNOTSUPP,
    Errno::MLINK,
];

/// Image service for `file://` references.
pub struct FileImageService {
    event_handler: Arc<dyn EventHandler>,
}

impl Default for FileImageService {
    fn default() -> Self {
        FileImageService {
            event_handler: Arc::new(NoEventHandler),
        }
    }
}

impl FileImageService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_handler(mut self, event_handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = event_handler;
        self
    }

    /// Get the path of the reference, and check that it is a regular file.
    ///
    /// Symbolic links are followed.
    pub fn validate_href(&self, reference: &str, secret: bool) -> Result<PathBuf, ImageError> {
        let path = local_path(reference)
            .map_err(|reason| ImageError::validation(reference, secret, reason))?;

        match fs::metadata(&path) {
            Ok(m) if m.is_file() => Ok(path),

            _ => Err(ImageError::validation(
                reference,
                secret,
                format_args!(
                    "Specified image file {} does not exist or is not a regular file.",
                    path.display()
                ),
            )),
        }
    }

    /// Size and modification time of the file.
    ///
    /// Local files are never cached.
    pub fn show(&self, reference: &str) -> Result<ImageMetadata, ImageError> {
        let path = self.validate_href(reference, false)?;

        let failed = |e: io::Error| ImageError::validation(reference, false, e);

        let metadata = fs::metadata(&path).map_err(failed)?;
        let mtime = metadata.modified().map_err(failed)?;

        Ok(ImageMetadata {
            size: metadata.len(),
            updated_at: Some(DateTime::<Utc>::from(mtime).naive_utc()),
            properties: Default::default(),
            no_cache: true,
        })
    }

    /// Make `destination` a hard link to the image.
    ///
    /// If the source is a symbolic link, the link is created to its target.
    /// The file is copied if a hard link is not possible (like when both
    /// paths are in different filesystems).
    pub fn download(&self, reference: &str, destination: &Path) -> Result<(), ImageError> {
        let source = self.validate_href(reference, false)?;

        let source = fs::canonicalize(&source).map_err(|e| {
            ImageError::download(reference, format_args!("{}: {e}", source.display()))
        })?;

        if is_same_path(&source, destination) {
            return Err(ImageError::download(
                reference,
                format_args!("Destination {} is the image itself.", destination.display()),
            ));
        }

        link_or_copy(&source, destination, hard_link, &*self.event_handler).map_err(|e| {
            ImageError::download(
                reference,
                format_args!(
                    "Cannot link or copy {} to {}: {e}",
                    source.display(),
                    destination.display()
                ),
            )
        })?;

        self.event_handler.finished(reference);
        Ok(())
    }

    pub fn get(&self, reference: &str) -> Result<String, ImageError> {
        let path = self.validate_href(reference, false)?;
        fs::read_to_string(path).map_err(|e| ImageError::download(reference, e))
    }
}

impl ImageService for FileImageService {
    fn validate(&self, reference: &str, secret: bool) -> Result<Validated, ImageError> {
        self.validate_href(reference, secret).map(Validated::File)
    }

    fn show(&self, reference: &str) -> Result<ImageMetadata, ImageError> {
        FileImageService::show(self, reference)
    }

    fn download(&self, reference: &str, destination: &Path) -> Result<(), ImageError> {
        FileImageService::download(self, reference, destination)
    }

    fn get(&self, reference: &str) -> Result<String, ImageError> {
        FileImageService::get(self, reference)
    }
}

/// Extract the path from a `file://` URL.
fn local_path(reference: &str) -> Result<PathBuf, String> {
    let url = url::Url::parse(reference).map_err(|e| e.to_string())?;

    if url.scheme() != "file" {
        return Err(format!("Unsupported scheme {:?}.", url.scheme()));
    }

    url.to_file_path()
        .map_err(|()| "Not an absolute path in the local host.".to_owned())
}

/// Check if `destination` is the path of `source`, which must be canonical.
///
/// Symbolic links in the last component of `destination` are not followed,
/// since they are replaced, not written through.
fn is_same_path(source: &Path, destination: &Path) -> bool {
    let Some(name) = destination.file_name() else {
        return false;
    };

    let parent = match destination.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    fs::canonicalize(parent).is_ok_and(|p| p.join(name) == source)
}

fn hard_link(source: &Path, destination: &Path) -> io::Result<()> {
    linkat(CWD, source, CWD, destination, AtFlags::empty())?;
    Ok(())
}

/// Replace `destination` with a link to `source`, or with a copy of it if
/// `link` fails with any of [`COPY_FALLBACK_ERRORS`].
fn link_or_copy<L>(
    source: &Path,
    destination: &Path,
    link: L,
    event_handler: &dyn EventHandler,
) -> io::Result<()>
where
    L: FnOnce(&Path, &Path) -> io::Result<()>,
{
    match fs::remove_file(destination) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => (),
    }

    let err = match link(source, destination) {
        Ok(()) => {
            tracing::debug!(
                source = %source.display(),
                destination = %destination.display(),
                "Image hard-linked"
            );
            return Ok(());
        }

        Err(e) if can_copy_instead(&e) => e,

        Err(e) => return Err(e),
    };

    tracing::warn!(
        source = %source.display(),
        destination = %destination.display(),
        error = %err,
        "Cannot create hard link, copying the image"
    );

    event_handler.copy_fallback(source, &err);

    fs::copy(source, destination)?;
    Ok(())
}

fn can_copy_instead(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::PermissionDenied
        || Errno::from_io_error(error).is_some_and(|e| COPY_FALLBACK_ERRORS.contains(&e))
}

#[cfg(test)]
fn file_url(path: &Path) -> String {
    url::Url::from_file_path(path).unwrap().to_string()
}

#[cfg(test)]
fn inode(path: &Path) -> u64 {
    use std::os::unix::fs::MetadataExt;
    fs::metadata(path).unwrap().ino()
}

#[test]
fn validate_regular_files() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("image.qcow2");
    fs::write(&image, b"abc").unwrap();

    let service = FileImageService::new();

    assert_eq!(service.validate_href(&file_url(&image), false).unwrap(), image);

    for reference in [
        file_url(dir.path()),
        file_url(&dir.path().join("missing.qcow2")),
        "file://remote-host/image.qcow2".to_owned(),
        "https://127.0.0.1/image.qcow2".to_owned(),
    ] {
        assert!(
            matches!(
                service.validate_href(&reference, false),
                Err(ImageError::ValidationFailed { .. })
            ),
            "{reference}"
        );
    }
}

#[test]
fn show_file_metadata() {
    use rustix::fs::{utimensat, Timespec, Timestamps};

    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("image.qcow2");
    fs::write(&image, [0u8; 42]).unwrap();

    let mtime = || Timespec {
        tv_sec: 1431087909,
        tv_nsec: 164_191_200,
    };

    let times = Timestamps {
        last_access: mtime(),
        last_modification: mtime(),
    };

    utimensat(CWD, &image, &times, AtFlags::empty()).unwrap();

    let expected = chrono::NaiveDate::from_ymd_opt(2015, 5, 8)
        .and_then(|d| d.and_hms_nano_opt(12, 25, 9, 164_191_200))
        .unwrap();

    let meta = FileImageService::new().show(&file_url(&image)).unwrap();
    assert_eq!(
        meta,
        ImageMetadata {
            size: 42,
            updated_at: Some(expected),
            properties: Default::default(),
            no_cache: true,
        }
    );
}

#[test]
fn download_as_hard_link() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("image.qcow2");
    let target = dir.path().join("target");

    fs::write(&image, b"image").unwrap();
    fs::write(&target, b"previous content").unwrap();

    FileImageService::new()
        .download(&file_url(&image), &target)
        .unwrap();

    assert_eq!(inode(&image), inode(&target));
    assert_eq!(fs::read(&target).unwrap(), b"image");
}

#[test]
fn download_follows_symlinks() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("image.qcow2");
    let symlink = dir.path().join("latest.qcow2");
    let target = dir.path().join("target");

    fs::write(&image, b"image").unwrap();
    std::os::unix::fs::symlink(&image, &symlink).unwrap();

    FileImageService::new()
        .download(&file_url(&symlink), &target)
        .unwrap();

    assert!(fs::symlink_metadata(&target).unwrap().is_file());
    assert_eq!(inode(&image), inode(&target));
}

#[test]
fn download_to_the_image_itself() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("image.qcow2");
    fs::write(&image, b"image").unwrap();

    let service = FileImageService::new();

    for destination in [image.clone(), dir.path().join(".").join("image.qcow2")] {
        assert!(matches!(
            service.download(&file_url(&image), &destination),
            Err(ImageError::DownloadFailed { .. })
        ));

        assert_eq!(fs::read(&image).unwrap(), b"image");
    }

    // A symlink to the image is replaced.
    let symlink = dir.path().join("latest.qcow2");
    std::os::unix::fs::symlink(&image, &symlink).unwrap();

    service.download(&file_url(&image), &symlink).unwrap();
    assert!(fs::symlink_metadata(&symlink).unwrap().is_file());
    assert_eq!(inode(&image), inode(&symlink));
}

#[test]
fn copy_when_link_is_not_possible() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("image.qcow2");
    let target = dir.path().join("target");

    fs::write(&image, b"image").unwrap();

    for errno in [Errno::XDEV, Errno::PERM, Errno::ACCESS, Errno::MLINK] {
        let _ = fs::remove_file(&target);

        link_or_copy(
            &image,
            &target,
            |_, _| Err(io::Error::from(errno)),
            &NoEventHandler,
        )
        .unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"image");
        assert_ne!(inode(&image), inode(&target));
    }
}

#[test]
fn other_link_errors_are_not_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("image.qcow2");
    let target = dir.path().join("target");

    fs::write(&image, b"image").unwrap();

    let err = link_or_copy(
        &image,
        &target,
        |_, _| Err(io::Error::from(Errno::IO)),
        &NoEventHandler,
    )
    .unwrap_err();

    assert_eq!(Errno::from_io_error(&err), Some(Errno::IO));
    assert!(!target.exists());
}

#[test]
fn fail_when_link_and_copy_fail() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.qcow2");
    let target = dir.path().join("target");

    assert!(link_or_copy(
        &missing,
        &target,
        |_, _| Err(io::Error::from(Errno::PERM)),
        &NoEventHandler,
    )
    .is_err());

    // Public interface, with a target in a missing directory.
    let image = dir.path().join("image.qcow2");
    fs::write(&image, b"image").unwrap();

    assert!(matches!(
        FileImageService::new().download(&file_url(&image), &dir.path().join("x/y")),
        Err(ImageError::DownloadFailed { .. })
    ));
}

#[test]
fn get_file_contents() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("config.json");
    fs::write(&image, "{}").unwrap();

    let service = FileImageService::new();
    assert_eq!(service.get(&file_url(&image)).unwrap(), "{}");

    fs::write(&image, b"\xff\xfe").unwrap();
    assert!(matches!(
        service.get(&file_url(&image)),
        Err(ImageError::DownloadFailed { .. })
    ));
}
