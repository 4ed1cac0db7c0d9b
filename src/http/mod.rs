mod date;
mod tls;

#[cfg(test)]
mod tests;

use std::{
    error::Error as _,
    fmt,
    fs::File,
    io::{self, BufRead, BufReader, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use base64::Engine as _;

use crate::{
    config::{AuthStrategy, RetrievalConfig, Settings},
    EventHandler, ImageError, ImageMetadata, ImageService, NoEventHandler, Validated,
    SECRET_PLACEHOLDER,
};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Size of the chunks to write a downloaded image.
pub const IMAGE_CHUNK_SIZE: usize = 32 * 1024 * 1024;

/// Status codes handled as a redirect by `validate`.
const REDIRECT_CODES: &[u16] = &[301, 302, 303, 307, 308];

/// Errors from the HTTP client.
///
/// The messages never include the URL of the request.
#[derive(thiserror::Error, Debug)]
pub(crate) enum HttpError {
    #[error("{}", describe_client_error(.0))]
    Client(Box<ureq::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS configuration: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Cannot read CA bundle {}: {0}", .1.display())]
    CaBundle(io::Error, PathBuf),

    #[error("No certificates in CA bundle {}.", .0.display())]
    NoCertificates(PathBuf),
}

impl From<ureq::Error> for HttpError {
    fn from(value: ureq::Error) -> Self {
        HttpError::Client(Box::new(value))
    }
}

fn describe_client_error(error: &ureq::Error) -> String {
    match error {
        ureq::Error::Status(code, _) => format!("Got HTTP code {code}"),

        ureq::Error::Transport(transport) => {
            let mut msg = transport.kind().to_string();

            if let Some(detail) = transport.message() {
                msg.push_str(": ");
                msg.push_str(detail);
            }

            if let Some(source) = transport.source() {
                msg.push_str(": ");
                msg.push_str(&source.to_string());
            }

            msg
        }
    }
}

/// Credentials for the `Authorization: Basic` header.
#[derive(Clone, PartialEq)]
pub struct BasicAuth {
    user: String,
    password: String,
}

impl BasicAuth {
    pub fn user(&self) -> &str {
        &self.user
    }

    fn header_value(&self) -> String {
        let credentials = format!("{}:{}", self.user, self.password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(credentials)
        )
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Status and headers of a response to a `HEAD` request.
#[derive(Clone, Debug, PartialEq)]
pub struct HeadResponse {
    status: u16,
    headers: Vec<(String, String)>,
}

impl HeadResponse {
    #[cfg(test)]
    pub(crate) fn new<K, V>(status: u16, headers: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        HeadResponse {
            status,
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Headers sent in multiple lines are joined with `", "`.
    fn from_response(response: &ureq::Response) -> Self {
        let mut headers: Vec<(String, String)> = Vec::new();

        for name in response.headers_names() {
            if headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(&name)) {
                continue;
            }

            let value = response.all(&name).join(", ");
            headers.push((name, value));
        }

        HeadResponse {
            status: response.status(),
            headers,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Value of the header `name`. The name is case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Image service for `http://` and `https://` references.
pub struct HttpImageService {
    settings: Settings,
    event_handler: Arc<dyn EventHandler>,
}

impl HttpImageService {
    pub fn new(settings: impl Into<Settings>) -> Self {
        HttpImageService {
            settings: settings.into(),
            event_handler: Arc::new(NoEventHandler),
        }
    }

    pub fn event_handler(mut self, event_handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = event_handler;
        self
    }

    /// Check that both `user` and `password` are present and not empty.
    pub fn verify_basic_auth_cred_format(
        reference: &str,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Result<(), ImageError> {
        check_credentials(reference, false, user, password)
    }

    /// Build the credentials from the current settings.
    ///
    /// Returns `None` if the authentication strategy is not `http_basic`.
    pub fn gen_auth_from_conf(&self, reference: &str) -> Result<Option<BasicAuth>, ImageError> {
        auth_from_config(&self.settings.snapshot(), reference, false)
    }

    /// Send a `HEAD` request to `reference`.
    ///
    /// Responses with status `200` or `403` are returned to the caller.
    /// A `403` is not an error, since some servers reject `HEAD`
    /// requests but allow `GET` for the same path.
    ///
    /// A redirect is reported as [`ImageError::Redirect`], with the URL in
    /// the `Location` header.
    pub fn validate_href(&self, reference: &str, secret: bool) -> Result<HeadResponse, ImageError> {
        let config = self.settings.snapshot();
        let auth = auth_from_config(&config, reference, secret)?;

        let failed = |e: HttpError| ImageError::validation(reference, secret, e);

        let agent = tls::agent(&config).map_err(failed)?;
        let response = self
            .send(agent.head(reference), auth.as_ref(), secret)
            .map_err(failed)?;

        match response.status() {
            200 | 403 => Ok(HeadResponse::from_response(&response)),

            status if REDIRECT_CODES.contains(&status) => match response.header("location") {
                Some(location) if !location.is_empty() => {
                    Err(ImageError::redirect(reference, secret, location))
                }

                _ => Err(ImageError::validation(
                    reference,
                    secret,
                    format_args!("Got HTTP code {status} with no Location header."),
                )),
            },

            status => Err(ImageError::validation(
                reference,
                secret,
                format_args!("Got HTTP code {status} instead of 200 in response to HEAD request."),
            )),
        }
    }

    /// Download the image to the file `destination`.
    ///
    /// The body of the response is written as received, without any
    /// content decoding.
    pub fn download(&self, reference: &str, destination: &Path) -> Result<(), ImageError> {
        let response = self.get_ok(reference)?;

        let file = File::create(destination).map_err(|e| {
            ImageError::download(reference, format_args!("{}: {e}", destination.display()))
        })?;

        let bytes = self
            .write_chunks(response.into_reader(), file)
            .map_err(|e| ImageError::download(reference, e))?;

        tracing::debug!(bytes, path = %destination.display(), "Image downloaded");
        self.event_handler.finished(reference);

        Ok(())
    }

    /// Get the body of `reference` as text.
    ///
    /// Intended for small documents: bodies larger than 10 MiB are
    /// rejected with [`ImageError::DownloadFailed`].
    pub fn get(&self, reference: &str) -> Result<String, ImageError> {
        self.get_ok(reference)?
            .into_string()
            .map_err(|e| ImageError::download(reference, e))
    }

    /// Send a `GET` request, and check that its status is `200`.
    fn get_ok(&self, reference: &str) -> Result<ureq::Response, ImageError> {
        let config = self.settings.snapshot();
        let auth = auth_from_config(&config, reference, false)?;

        let failed = |e: HttpError| ImageError::download(reference, e);

        let agent = tls::agent(&config).map_err(failed)?;
        let response = self
            .send(agent.get(reference), auth.as_ref(), false)
            .map_err(failed)?;

        match response.status() {
            200 => Ok(response),
            status => Err(ImageError::download(
                reference,
                format_args!("Got HTTP code {status} instead of 200 in response to GET request."),
            )),
        }
    }

    /// Send a request.
    ///
    /// Responses with an error status are returned as regular responses.
    fn send(
        &self,
        request: ureq::Request,
        auth: Option<&BasicAuth>,
        secret: bool,
    ) -> Result<ureq::Response, HttpError> {
        let mut request = request.set("User-Agent", USER_AGENT);
        if let Some(auth) = auth {
            request = request.set("Authorization", &auth.header_value());
        }

        let url = if secret {
            SECRET_PLACEHOLDER
        } else {
            request.url()
        };

        tracing::debug!(method = request.method(), url, "HTTP request");
        self.event_handler.http_request(request.method(), url);

        match request.call() {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(_, response)) => Ok(response),
            Err(e) => Err(e.into()),
        }
    }

    /// Copy `body` to `output`, in chunks of [`IMAGE_CHUNK_SIZE`].
    fn write_chunks(&self, body: impl Read, mut output: impl Write) -> io::Result<u64> {
        let mut reader = BufReader::with_capacity(IMAGE_CHUNK_SIZE, body);
        let mut total = 0;

        loop {
            let chunk = reader.fill_buf()?;
            if chunk.is_empty() {
                break;
            }

            output.write_all(chunk)?;

            let len = chunk.len();
            reader.consume(len);
            total += len as u64;

            self.event_handler.download_progress_bytes(len);
        }

        output.flush()?;
        Ok(total)
    }
}

impl ImageService for HttpImageService {
    fn validate(&self, reference: &str, secret: bool) -> Result<Validated, ImageError> {
        self.validate_href(reference, secret).map(Validated::Http)
    }

    fn show(&self, reference: &str) -> Result<ImageMetadata, ImageError> {
        let response = self.validate_href(reference, false)?;
        metadata(&response).map_err(|reason| ImageError::validation(reference, false, reason))
    }

    fn download(&self, reference: &str, destination: &Path) -> Result<(), ImageError> {
        HttpImageService::download(self, reference, destination)
    }

    fn get(&self, reference: &str) -> Result<String, ImageError> {
        HttpImageService::get(self, reference)
    }
}

fn check_credentials(
    reference: &str,
    secret: bool,
    user: Option<&str>,
    password: Option<&str>,
) -> Result<(), ImageError> {
    match (user, password) {
        (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Ok(()),
        _ => Err(ImageError::validation(
            reference,
            secret,
            "Either user or password is not provided or empty for http_basic authentication.",
        )),
    }
}

fn auth_from_config(
    config: &RetrievalConfig,
    reference: &str,
    secret: bool,
) -> Result<Option<BasicAuth>, ImageError> {
    match config.auth_strategy {
        AuthStrategy::Noauth => Ok(None),

        AuthStrategy::HttpBasic => {
            let user = config.user.as_deref();
            let password = config.password.as_deref();
            check_credentials(reference, secret, user, password)?;

            Ok(Some(BasicAuth {
                user: user.unwrap_or_default().to_owned(),
                password: password.unwrap_or_default().to_owned(),
            }))
        }
    }
}

/// Extract the image metadata from the headers of a `HEAD` response.
fn metadata(response: &HeadResponse) -> Result<ImageMetadata, String> {
    let size = response.header("content-length").ok_or(
        "Cannot determine image size as there is no Content-Length \
         header specified in response to HEAD request.",
    )?;

    let size = size
        .trim()
        .parse()
        .map_err(|_| format!("Invalid Content-Length header: {size:?}"))?;

    let updated_at = response.header("last-modified").and_then(|value| {
        let date = date::parse_http_date(value);
        if date.is_none() {
            tracing::debug!(value, "Ignoring invalid Last-Modified header");
        }
        date
    });

    let no_cache = response
        .header("cache-control")
        .is_some_and(disallows_store);

    Ok(ImageMetadata {
        size,
        updated_at,
        properties: Default::default(),
        no_cache,
    })
}

/// Check if a `Cache-Control` header contains the `no-store` directive.
///
/// `no-cache` is not enough: it only requires a revalidation.
fn disallows_store(cache_control: &str) -> bool {
    cache_control
        .split(',')
        .map(|directive| directive.split_once('=').map_or(directive, |(name, _)| name))
        .any(|name| name.trim().eq_ignore_ascii_case("no-store"))
}
