use std::{fmt::Display, path::Path, path::PathBuf};

use clap::Parser;
use image_fetch::{EventHandler, ImageService, Resolver, RetrievalConfig, TlsVerification};

#[derive(Parser, Debug)]
struct Args {
    /// Accept any TLS certificate.
    #[arg(short = 'k', long, conflicts_with = "ca")]
    insecure: bool,

    /// PEM file with the CA certificates to trust.
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Connection timeout, in seconds.
    #[arg(short, long, default_value_t = image_fetch::DEFAULT_TIMEOUT)]
    timeout: u64,

    /// User for HTTP basic authentication.
    #[arg(short, long, requires = "password")]
    user: Option<String>,

    /// Password for HTTP basic authentication.
    #[arg(short, long, requires = "user")]
    password: Option<String>,

    /// Hide the reference in messages.
    #[arg(short, long)]
    secret: bool,

    /// Image reference.
    image: String,

    /// File to write the image.
    target: PathBuf,
}

struct Logger;

impl EventHandler for Logger {
    fn http_request(&self, method: &str, url: &str) {
        println!("{method} {url}");
    }

    fn copy_fallback(&self, source: &Path, cause: &dyn Display) {
        println!("COPY {} ({cause})", source.display());
    }

    fn finished(&self, _: &str) {
        println!("DONE");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = RetrievalConfig::default().timeout(args.timeout);

    if args.insecure {
        config = config.verify_ca(TlsVerification::Disabled);
    } else if let Some(ca) = args.ca {
        config = config.verify_ca(TlsVerification::CaBundle(ca));
    }

    if let (Some(user), Some(password)) = (args.user, args.password) {
        config = config.basic_auth(user, password);
    }

    let source = Resolver::new(config)
        .event_handler(Logger)
        .resolve(&args.image, None)?;

    source.validate(&args.image, args.secret)?;

    let metadata = source.show(&args.image)?;
    println!("{}", serde_json::to_string_pretty(&metadata)?);

    source.download(&args.image, &args.target)?;

    Ok(())
}
