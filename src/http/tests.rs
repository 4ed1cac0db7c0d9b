use std::{
    fs,
    net::{IpAddr, Ipv4Addr, TcpListener},
    sync::mpsc,
    time::Duration,
};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use tiny_http::{Header, Method, Request, Response, Server, SslConfig};

use crate::{
    config::{RetrievalConfig, TlsVerification},
    ImageError, ImageService, SECRET_PLACEHOLDER,
};

use super::{disallows_store, metadata, HeadResponse, HttpImageService};

/// Start a HTTP server in a random port.
///
/// Request are handled in `handler`. The server is stopped when the
/// function returns `false`
///
/// Returns the port number of the server.
fn http_server<F>(handler: F) -> u16
where
    F: FnMut(Request) -> bool,
    F: Send + 'static,
{
    let server = Server::http("127.0.0.1:0").expect("start HTTP server");
    serve(server, handler)
}

/// Like [`http_server`], with TLS. `certificate` and `private_key` are
/// PEM documents.
fn https_server<F>(certificate: String, private_key: String, handler: F) -> u16
where
    F: FnMut(Request) -> bool,
    F: Send + 'static,
{
    let config = SslConfig {
        certificate: certificate.into_bytes(),
        private_key: private_key.into_bytes(),
    };

    let server = Server::https("127.0.0.1:0", config).expect("start HTTPS server");
    serve(server, handler)
}

fn serve<F>(server: Server, mut handler: F) -> u16
where
    F: FnMut(Request) -> bool,
    F: Send + 'static,
{
    let port = server.server_addr().to_ip().unwrap().port();

    std::thread::spawn(move || {
        let timeout = Duration::from_secs(60);
        while let Ok(Some(request)) = server.recv_timeout(timeout) {
            if !handler(request) {
                break;
            }
        }
    });

    port
}

/// Self-signed CA certificate.
fn certificate_authority(name: &str) -> (Certificate, KeyPair) {
    let key = KeyPair::generate().unwrap();

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.distinguished_name.push(DnType::CommonName, name);

    (params.self_signed(&key).unwrap(), key)
}

/// Certificate for `127.0.0.1`, signed by `ca`.
fn server_certificate(ca: &Certificate, ca_key: &KeyPair) -> (Certificate, KeyPair) {
    let key = KeyPair::generate().unwrap();

    let mut params = CertificateParams::default();
    params.subject_alt_names = vec![SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST))];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.distinguished_name.push(DnType::CommonName, "127.0.0.1");

    (params.signed_by(&key, ca, ca_key).unwrap(), key)
}

/// Method and `Authorization` header of a request.
type Seen = (Method, Option<String>);

/// Start a server that responds every request with `status`, and
/// reports what it received in the returned channel.
fn status_server(status: u16, headers: &'static [(&'static str, &'static str)]) -> (u16, mpsc::Receiver<Seen>) {
    let (tx, rx) = mpsc::channel();

    let port = http_server(move |req| {
        let authorization = req
            .headers()
            .iter()
            .find(|h| h.field.equiv("authorization"))
            .map(|h| h.value.to_string());

        let _ = tx.send((req.method().clone(), authorization));

        let response = headers.iter().fold(
            Response::from_data(vec![0; 100]).with_status_code(status),
            |r, (k, v)| r.with_header(Header::from_bytes(*k, *v).unwrap()),
        );

        req.respond(response).expect("Send response");
        true
    });

    (port, rx)
}

fn service(config: RetrievalConfig) -> HttpImageService {
    HttpImageService::new(config)
}

/// Port where nothing is listening.
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn validate_accepts_ok() {
    let (port, seen) = status_server(200, &[]);
    let url = format!("http://127.0.0.1:{port}/fedora.qcow2");

    let response = service(Default::default())
        .validate_href(&url, false)
        .expect("validate");

    assert_eq!(response.status(), 200);
    assert_eq!(seen.recv().unwrap(), (Method::Head, None));
}

#[test]
fn validate_rejects_other_statuses() {
    for status in [204, 400, 404, 500] {
        let (port, _seen) = status_server(status, &[]);
        let url = format!("http://127.0.0.1:{port}/fedora.qcow2");

        let err = service(Default::default())
            .validate_href(&url, false)
            .unwrap_err();

        assert!(
            matches!(&err, ImageError::ValidationFailed { reason, .. } if reason.contains(&status.to_string())),
            "{status}: {err:?}"
        );
    }
}

#[test]
fn validate_returns_forbidden() {
    let (port, _seen) = status_server(403, &[]);
    let url = format!("http://127.0.0.1:{port}/fedora.qcow2/");

    let response = service(Default::default())
        .validate_href(&url, false)
        .expect("403 is not an error");

    assert_eq!(response.status(), 403);
}

#[test]
fn validate_reports_redirects() {
    let (port, _seen) = status_server(301, &[("Location", "http://new-url")]);
    let url = format!("http://127.0.0.1:{port}/fedora.qcow2/");

    let err = service(Default::default())
        .validate_href(&url, false)
        .unwrap_err();

    assert!(err.is_redirect());
    assert_eq!(err.redirect_location(), Some("http://new-url"));

    // A redirect without a location is a failure.
    let (port, _seen) = status_server(302, &[]);
    let url = format!("http://127.0.0.1:{port}/fedora.qcow2/");

    let err = service(Default::default())
        .validate_href(&url, false)
        .unwrap_err();

    assert!(matches!(err, ImageError::ValidationFailed { .. }));
}

#[test]
fn validate_hides_secret_urls() {
    let (port, _seen) = status_server(204, &[]);
    let url = format!("http://127.0.0.1:{port}/token=abcdef/fedora.qcow2");

    let msg = service(Default::default())
        .validate_href(&url, true)
        .unwrap_err()
        .to_string();

    assert!(msg.contains(SECRET_PLACEHOLDER), "{msg}");
    assert!(!msg.contains(&url), "{msg}");

    let msg = service(Default::default())
        .validate_href(&url, false)
        .unwrap_err()
        .to_string();

    assert!(msg.contains(&url), "{msg}");

    // Transport errors are also redacted.
    let url = format!("http://127.0.0.1:{}/token=abcdef", closed_port());
    let msg = service(Default::default())
        .validate_href(&url, true)
        .unwrap_err()
        .to_string();

    assert!(!msg.contains(&url), "{msg}");
}

#[test]
fn validate_converts_connection_errors() {
    let url = format!("http://127.0.0.1:{}/fedora.qcow2", closed_port());

    let err = service(Default::default())
        .validate_href(&url, false)
        .unwrap_err();

    assert!(matches!(err, ImageError::ValidationFailed { .. }), "{err:?}");
}

#[test]
fn validate_with_timeout() {
    let port = http_server(|req| {
        std::thread::sleep(Duration::from_secs(3));
        let _ = req.respond(Response::empty(200));
        false
    });

    let url = format!("http://127.0.0.1:{port}/slow.qcow2");

    let err = service(RetrievalConfig::default().timeout(1))
        .validate_href(&url, false)
        .unwrap_err();

    assert!(matches!(err, ImageError::ValidationFailed { .. }), "{err:?}");
}

#[test]
fn validate_is_repeatable() {
    let (port, _seen) = status_server(404, &[]);
    let url = format!("http://127.0.0.1:{port}/missing.qcow2");

    let service = service(Default::default());
    for _ in 0..2 {
        assert!(matches!(
            service.validate_href(&url, false),
            Err(ImageError::ValidationFailed { .. })
        ));
    }
}

#[test]
fn validate_with_basic_auth() {
    let (port, seen) = status_server(200, &[]);
    let url = format!("http://127.0.0.1:{port}/fedora.qcow2");

    service(RetrievalConfig::default().basic_auth("test", "test"))
        .validate_href(&url, false)
        .expect("validate");

    // base64("test:test")
    assert_eq!(
        seen.recv().unwrap(),
        (Method::Head, Some("Basic dGVzdDp0ZXN0".to_owned()))
    );
}

#[test]
fn invalid_credentials_fail_before_request() {
    let (port, seen) = status_server(200, &[]);
    let url = format!("http://127.0.0.1:{port}/fedora.qcow2");

    let mut config = RetrievalConfig::default().basic_auth("test", "");
    config.password = None;

    let service = service(config);

    assert!(matches!(
        service.validate_href(&url, false),
        Err(ImageError::ValidationFailed { .. })
    ));

    let target = tempfile::NamedTempFile::new().unwrap();
    assert!(matches!(
        service.download(&url, target.path()),
        Err(ImageError::ValidationFailed { .. })
    ));

    assert!(seen.try_recv().is_err());
}

#[test]
fn verify_basic_auth_cred_format() {
    const URL: &str = "https://127.0.0.1:12345/fedora.qcow2";

    let check = HttpImageService::verify_basic_auth_cred_format;

    assert!(check(URL, Some("SpongeBob"), Some("SquarePants")).is_ok());

    for (user, password) in [
        (Some(""), Some("SquarePants")),
        (Some("SpongeBob"), Some("")),
        (None, Some("SquarePants")),
        (Some("SpongeBob"), None),
        (None, None),
        (Some(""), Some("")),
    ] {
        assert!(
            matches!(
                check(URL, user, password),
                Err(ImageError::ValidationFailed { .. })
            ),
            "{user:?} {password:?}"
        );
    }
}

#[test]
fn gen_auth_from_conf() {
    const URL: &str = "https://127.0.0.1:12345/fedora.qcow2";

    let auth = service(RetrievalConfig::default().basic_auth("SquarePants", "SpongeBob"))
        .gen_auth_from_conf(URL)
        .unwrap()
        .expect("credentials");

    assert_eq!(auth.user(), "SquarePants");
    assert_eq!(auth.header_value(), "Basic U3F1YXJlUGFudHM6U3BvbmdlQm9i");

    let mut config = RetrievalConfig::default().basic_auth("SquarePants", "SpongeBob");
    config.auth_strategy = crate::AuthStrategy::Noauth;
    assert!(service(config).gen_auth_from_conf(URL).unwrap().is_none());
}

#[test]
fn show_image_metadata() {
    let (port, _seen) = status_server(
        200,
        &[
            ("Last-Modified", "Tue, 15 Nov 2014 08:12:31 GMT"),
            ("Cache-Control", "no-store"),
        ],
    );

    let url = format!("http://127.0.0.1:{port}/fedora.qcow2");
    let meta = service(Default::default()).show(&url).expect("show");

    assert_eq!(meta.size, 100);
    assert_eq!(
        meta.updated_at.map(|d| d.to_string()).as_deref(),
        Some("2014-11-15 08:12:31")
    );
    assert!(meta.properties.is_empty());
    assert!(meta.no_cache);
}

#[test]
fn metadata_from_headers() {
    let date = chrono::NaiveDate::from_ymd_opt(2014, 11, 15)
        .and_then(|d| d.and_hms_opt(8, 12, 31))
        .unwrap();

    for mtime in [
        "Tue, 15 Nov 2014 08:12:31 GMT",
        "Tuesday, 15-Nov-14 08:12:31 GMT",
        "Tue Nov 15 08:12:31 2014",
    ] {
        let response = HeadResponse::new(
            200,
            [("Content-Length", "100"), ("Last-Modified", mtime)],
        );

        let meta = metadata(&response).unwrap();
        assert_eq!(meta.size, 100);
        assert_eq!(meta.updated_at, Some(date));
        assert!(meta.properties.is_empty());
        assert!(!meta.no_cache);
    }

    // No Last-Modified.
    let meta = metadata(&HeadResponse::new(200, [("content-length", "7")])).unwrap();
    assert_eq!(meta.size, 7);
    assert_eq!(meta.updated_at, None);

    // No Content-Length.
    let response = HeadResponse::new(200, [("Last-Modified", "Tue, 15 Nov 2014 08:12:31 GMT")]);
    assert!(metadata(&response).is_err());

    // Invalid Content-Length.
    let response = HeadResponse::new(200, [("Content-Length", "-1")]);
    assert!(metadata(&response).is_err());
}

#[test]
fn show_joins_repeated_headers() {
    let (port, _seen) = status_server(
        200,
        &[("Cache-Control", "private"), ("Cache-Control", "no-store")],
    );

    let url = format!("http://127.0.0.1:{port}/fedora.qcow2");

    let response = service(Default::default())
        .validate_href(&url, false)
        .expect("validate");
    assert_eq!(response.header("cache-control"), Some("private, no-store"));

    let meta = service(Default::default()).show(&url).expect("show");
    assert!(meta.no_cache);
}

#[test]
fn cache_control_directives() {
    assert!(disallows_store("no-store"));
    assert!(disallows_store("private, No-Store"));
    assert!(disallows_store("max-age=0, no-store"));
    assert!(!disallows_store("no-cache, private"));
    assert!(!disallows_store("max-age=3600"));
    assert!(!disallows_store(""));

    let response = HeadResponse::new(
        200,
        [("Content-Length", "100"), ("Cache-Control", "no-cache, private")],
    );
    assert!(!metadata(&response).unwrap().no_cache);
}

#[test]
fn download_image() {
    const BODY: &[u8] = b"\x00\x01qcow2 image data\xff";

    let (tx, rx) = mpsc::channel();

    let port = http_server(move |req| {
        let authorization = req
            .headers()
            .iter()
            .find(|h| h.field.equiv("authorization"))
            .map(|h| h.value.to_string());

        let _ = tx.send((req.method().clone(), authorization));

        let response = match req.url() {
            "/fedora.qcow2" => Response::from_data(BODY).with_status_code(200),
            _ => Response::from_data(vec![]).with_status_code(404),
        };

        req.respond(response).expect("Send response");
        true
    });

    let target = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(target.path(), b"previous content, longer than the image").unwrap();

    let service = service(RetrievalConfig::default().basic_auth("test", "test"));

    let url = format!("http://127.0.0.1:{port}/fedora.qcow2");
    service.download(&url, target.path()).expect("download");

    assert_eq!(std::fs::read(target.path()).unwrap(), BODY);
    assert_eq!(
        rx.recv().unwrap(),
        (Method::Get, Some("Basic dGVzdDp0ZXN0".to_owned()))
    );

    // Missing image.
    let url = format!("http://127.0.0.1:{port}/missing.qcow2");
    assert!(matches!(
        service.download(&url, target.path()),
        Err(ImageError::DownloadFailed { .. })
    ));
}

#[test]
fn download_failures() {
    let url = format!("http://127.0.0.1:{}/fedora.qcow2", closed_port());
    let target = tempfile::NamedTempFile::new().unwrap();

    assert!(matches!(
        service(Default::default()).download(&url, target.path()),
        Err(ImageError::DownloadFailed { .. })
    ));

    // Destination can't be created.
    let (port, _seen) = status_server(200, &[]);
    let url = format!("http://127.0.0.1:{port}/fedora.qcow2");
    let dir = tempfile::tempdir().unwrap();

    assert!(matches!(
        service(Default::default()).download(&url, &dir.path().join("a/b/c")),
        Err(ImageError::DownloadFailed { .. })
    ));
}

#[test]
fn get_text() {
    let port = http_server(|req| {
        let response = match req.url() {
            "/config" => Response::from_string("value"),
            _ => Response::from_string("Not Found").with_status_code(404),
        };

        req.respond(response).expect("Send response");
        true
    });

    let service = service(Default::default());

    let text = service.get(&format!("http://127.0.0.1:{port}/config"));
    assert_eq!(text.unwrap(), "value");

    assert!(matches!(
        service.get(&format!("http://127.0.0.1:{port}/other")),
        Err(ImageError::DownloadFailed { .. })
    ));

    assert!(matches!(
        service.get(&format!("http://127.0.0.1:{}/config", closed_port())),
        Err(ImageError::DownloadFailed { .. })
    ));
}

#[test]
fn tls_verification_modes() {
    let (ca, ca_key) = certificate_authority("image-fetch test CA");
    let (other_ca, _) = certificate_authority("unrelated CA");
    let (cert, key) = server_certificate(&ca, &ca_key);

    let port = https_server(cert.pem(), key.serialize_pem(), |req| {
        req.respond(Response::from_string("image data"))
            .expect("Send response");
        true
    });

    let dir = tempfile::tempdir().unwrap();

    let bundle = dir.path().join("ca.pem");
    fs::write(&bundle, ca.pem()).unwrap();

    let other_bundle = dir.path().join("other.pem");
    fs::write(&other_bundle, other_ca.pem()).unwrap();

    let url = format!("https://127.0.0.1:{port}/fedora.qcow2");
    let with_ca = |verify_ca| service(RetrievalConfig::default().verify_ca(verify_ca));

    // Any certificate is accepted if verification is disabled.
    let insecure = with_ca(TlsVerification::Disabled);
    assert_eq!(insecure.validate_href(&url, false).unwrap().status(), 200);
    assert_eq!(insecure.get(&url).unwrap(), "image data");

    let trusted = with_ca(TlsVerification::CaBundle(bundle));
    assert_eq!(trusted.validate_href(&url, false).unwrap().status(), 200);

    // The test CA is not in the system roots, nor in the other bundle.
    for verify_ca in [
        TlsVerification::System,
        TlsVerification::CaBundle(other_bundle),
    ] {
        let result = with_ca(verify_ca.clone()).validate_href(&url, false);
        assert!(
            matches!(result, Err(ImageError::ValidationFailed { .. })),
            "{verify_ca:?}: {result:?}"
        );
    }
}

#[test]
fn get_rejects_large_documents() {
    let port = http_server(|req| {
        let body = vec![b'a'; 11 * 1024 * 1024];
        // The client closes the connection before the end of the body.
        let _ = req.respond(Response::from_data(body));
        false
    });

    let url = format!("http://127.0.0.1:{port}/large.json");
    assert!(matches!(
        service(Default::default()).get(&url),
        Err(ImageError::DownloadFailed { .. })
    ));
}
