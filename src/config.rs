use std::{
    fmt,
    path::PathBuf,
    str::FromStr,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

/// Default timeout, in seconds, for connections to the image server.
pub const DEFAULT_TIMEOUT: u64 = 60;

/// How to verify the certificate of HTTPS servers.
///
/// It can be parsed from the string form used by configuration files:
/// boolean-like values enable or disable the verification, and anything
/// else is a path to a CA bundle.
///
/// # Examples
///
/// ```
/// # use image_fetch::*;
/// assert_eq!("True".parse(), Ok(TlsVerification::System));
/// assert_eq!("off".parse(), Ok(TlsVerification::Disabled));
/// assert_eq!(
///     "/etc/ssl/ca.pem".parse(),
///     Ok(TlsVerification::CaBundle("/etc/ssl/ca.pem".into())),
/// );
/// ```
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(try_from = "String")]
pub enum TlsVerification {
    /// Verify with the default root certificates.
    #[default]
    System,

    /// Accept any certificate.
    Disabled,

    /// Verify with the certificates in a PEM file.
    CaBundle(PathBuf),
}

/// Errors from [`TlsVerification::from_str`].
#[derive(thiserror::Error, Debug, PartialEq)]
#[error("Empty value for the CA verification mode.")]
pub struct EmptyVerifyCa;

impl FromStr for TlsVerification {
    type Err = EmptyVerifyCa;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();

        match value.to_ascii_lowercase().as_str() {
            "" => Err(EmptyVerifyCa),
            "true" | "yes" | "on" | "1" => Ok(TlsVerification::System),
            "false" | "no" | "off" | "0" => Ok(TlsVerification::Disabled),
            _ => Ok(TlsVerification::CaBundle(PathBuf::from(value))),
        }
    }
}

impl TryFrom<String> for TlsVerification {
    type Error = EmptyVerifyCa;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Authentication used for requests to the image server.
#[derive(Copy, Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStrategy {
    #[default]
    #[serde(alias = "none")]
    Noauth,

    HttpBasic,
}

/// Settings for the retrieval strategies.
///
/// Instances are immutable snapshots. To change the settings while
/// services are in use, share them through [`Settings`].
#[derive(Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Certificate verification for HTTPS.
    pub verify_ca: TlsVerification,

    /// Timeout, in seconds, to connect and to read from the server.
    pub connection_timeout: u64,

    pub auth_strategy: AuthStrategy,

    /// User for `http_basic` authentication.
    pub user: Option<String>,

    /// Password for `http_basic` authentication.
    pub password: Option<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        RetrievalConfig {
            verify_ca: TlsVerification::System,
            connection_timeout: DEFAULT_TIMEOUT,
            auth_strategy: AuthStrategy::Noauth,
            user: None,
            password: None,
        }
    }
}

impl RetrievalConfig {
    pub fn verify_ca(mut self, verify_ca: TlsVerification) -> Self {
        self.verify_ca = verify_ca;
        self
    }

    /// Timeout, in seconds.
    pub fn timeout(mut self, seconds: u64) -> Self {
        self.connection_timeout = seconds;
        self
    }

    /// Enable `http_basic` authentication.
    ///
    /// The credentials are not validated here. Every request checks that
    /// both values are present and not empty.
    pub fn basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth_strategy = AuthStrategy::HttpBasic;
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub(crate) fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }
}

impl fmt::Debug for RetrievalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrievalConfig")
            .field("verify_ca", &self.verify_ca)
            .field("connection_timeout", &self.connection_timeout)
            .field("auth_strategy", &self.auth_strategy)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Shared handle to a [`RetrievalConfig`].
///
/// Services read a full snapshot when an operation starts, so a
/// [`replace`](Self::replace) during a call is only visible to the
/// next calls.
#[derive(Clone, Debug, Default)]
pub struct Settings(Arc<RwLock<RetrievalConfig>>);

impl Settings {
    pub fn new(config: RetrievalConfig) -> Self {
        Settings(Arc::new(RwLock::new(config)))
    }

    /// Copy of the current configuration.
    pub fn snapshot(&self) -> RetrievalConfig {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install a new configuration.
    pub fn replace(&self, config: RetrievalConfig) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = config;
    }
}

impl From<RetrievalConfig> for Settings {
    fn from(config: RetrievalConfig) -> Self {
        Settings::new(config)
    }
}

#[test]
fn parse_verify_ca_values() {
    for value in ["True", "true", " yes ", "1", "ON"] {
        assert_eq!(value.parse(), Ok(TlsVerification::System), "{value:?}");
    }

    for value in ["False", "no", "0", "Off"] {
        assert_eq!(value.parse(), Ok(TlsVerification::Disabled), "{value:?}");
    }

    assert_eq!(
        "/some/path".parse(),
        Ok(TlsVerification::CaBundle("/some/path".into()))
    );

    assert_eq!("  ".parse::<TlsVerification>(), Err(EmptyVerifyCa));
}

#[test]
fn config_from_json() {
    let config: RetrievalConfig = serde_json::from_str(
        r#"{
            "verify_ca": "/some/path",
            "auth_strategy": "http_basic",
            "user": "test",
            "password": "test"
        }"#,
    )
    .unwrap();

    assert_eq!(config.verify_ca, TlsVerification::CaBundle("/some/path".into()));
    assert_eq!(config.connection_timeout, DEFAULT_TIMEOUT);
    assert_eq!(config.auth_strategy, AuthStrategy::HttpBasic);
    assert_eq!(config.user.as_deref(), Some("test"));

    let config: RetrievalConfig = serde_json::from_str(r#"{"auth_strategy": "noauth"}"#).unwrap();
    assert_eq!(config, RetrievalConfig::default());

    assert!(serde_json::from_str::<RetrievalConfig>(r#"{"verify_ca": ""}"#).is_err());
}

#[test]
fn debug_hides_password() {
    let config = RetrievalConfig::default().basic_auth("user", "SquarePants");
    let debug = format!("{config:?}");
    assert!(debug.contains("user"));
    assert!(!debug.contains("SquarePants"));
}

#[test]
fn settings_snapshot_is_isolated() {
    let settings = Settings::new(RetrievalConfig::default().timeout(15));
    let before = settings.snapshot();

    settings.replace(RetrievalConfig::default().verify_ca(TlsVerification::Disabled));

    assert_eq!(before.connection_timeout, 15);
    assert_eq!(before.verify_ca, TlsVerification::System);

    let after = settings.snapshot();
    assert_eq!(after.connection_timeout, DEFAULT_TIMEOUT);
    assert_eq!(after.verify_ca, TlsVerification::Disabled);
}
