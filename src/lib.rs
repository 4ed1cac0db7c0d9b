mod config;
mod fs;
mod http;
mod reference;
mod resolver;
mod service;

pub use config::{
    AuthStrategy, EmptyVerifyCa, RetrievalConfig, Settings, TlsVerification, DEFAULT_TIMEOUT,
};
pub use fs::FileImageService;
pub use http::{BasicAuth, HeadResponse, HttpImageService, IMAGE_CHUNK_SIZE};
pub use reference::{ParseError, Reference};
pub use resolver::Resolver;
pub use service::{
    EventHandler, ImageError, ImageMetadata, ImageService, ImageSource, NoEventHandler,
    RegistryConnector, RequestContext, Validated, SECRET_PLACEHOLDER,
};
