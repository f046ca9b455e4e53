//! Inspect the content stores an image mirror serves from.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use eyre::{eyre, WrapErr};
use futures::StreamExt;
use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use oci_driver::Platform;
use oci_store::{
    Image, PlatformMatcher, Store, StoreConfig, Walker, DEFAULT_ADDRESS, DEFAULT_NAMESPACE,
};

#[derive(Debug, Parser)]
#[command(name = "oci-mirror", version)]
struct Args {
    /// TOML file with a `[store]` table.
    #[arg(long, conflicts_with_all = ["local", "runtime"])]
    config: Option<Utf8PathBuf>,

    /// Serve from an image layout directory.
    #[arg(long, conflicts_with = "runtime")]
    local: Option<Utf8PathBuf>,

    /// Serve from the containerd daemon listening on this socket.
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_ADDRESS)]
    runtime: Option<Utf8PathBuf>,

    /// With `--runtime`, read content from this directory instead of the
    /// daemon's content service.
    #[arg(long, requires = "runtime")]
    content_path: Option<Utf8PathBuf>,

    /// Runtime namespace, with `--runtime`.
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Only walk index entries for these platforms (`os/arch[/variant]`).
    #[arg(long = "platform", value_parser = parse_platform)]
    platforms: Vec<Platform>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check that the store can serve.
    Verify,

    /// List images and their digests.
    List,

    /// List every digest held.
    Contents,

    /// Print the digests an image is made of.
    Walk {
        /// `registry/repository:tag` or `...@digest`.
        reference: String,
    },

    /// Print content events as they happen.
    Watch,
}

#[derive(Debug, Deserialize)]
struct Config {
    store: StoreConfig,
}

fn parse_platform(value: &str) -> Result<Platform, String> {
    let mut parts = value.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(os), Some(arch), variant, None) if !os.is_empty() && !arch.is_empty() => {
            let platform = Platform::new(os, arch);
            Ok(match variant {
                Some(variant) => platform.with_variant(variant),
                None => platform,
            })
        }
        _ => Err(format!("expected os/arch[/variant], got {value:?}")),
    }
}

impl Args {
    fn store_config(&self) -> eyre::Result<StoreConfig> {
        if let Some(path) = &self.config {
            let text = std::fs::read_to_string(path).wrap_err_with(|| format!("reading {path}"))?;
            let config: Config = toml_edit::de::from_str(&text).wrap_err_with(|| format!("parsing {path}"))?;
            return Ok(config.store);
        }

        if let Some(path) = &self.local {
            return Ok(StoreConfig::Local { path: path.clone() });
        }

        if let Some(address) = &self.runtime {
            return Ok(StoreConfig::Runtime {
                address: address.clone(),
                content_path: self.content_path.clone(),
                namespace: self.namespace.clone(),
                poll_interval_secs: oci_store::DEFAULT_POLL_INTERVAL.as_secs(),
            });
        }

        Err(eyre!("one of --config, --local or --runtime is required"))
    }

    fn walker(&self) -> Walker {
        if self.platforms.is_empty() {
            Walker::default()
        } else {
            Walker::new(PlatformMatcher::Only(self.platforms.clone()))
        }
    }
}

async fn walk(store: &Store, reference: &str) -> eyre::Result<()> {
    let image = Image::parse(reference)?;
    let image = match (&image.digest, image.tag_name()) {
        (Some(_), _) => image,
        (None, Some(tag_name)) => {
            let digest = store.resolve(&tag_name).await?;
            Image::parse_require_digest(reference, digest)?
        }
        (None, None) => return Err(eyre!("{reference} has neither a tag nor a digest")),
    };

    for digest in store.walk(&image).await? {
        println!("{digest}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_error::ErrorLayer::default())
        .init();

    let args = Args::parse();
    let store = args.store_config()?.build().await?.with_walker(args.walker());
    tracing::debug!(store = store.name(), "Store ready");

    match &args.command {
        Command::Verify => {
            store.verify().await?;
            println!("{} store is ready", store.name());
        }
        Command::List => {
            for image in store.list_images().await? {
                println!("{image}");
            }
        }
        Command::Contents => {
            for content in store.list_contents().await? {
                println!("{}", content.digest);
            }
        }
        Command::Walk { reference } => walk(&store, reference).await?,
        Command::Watch => {
            let Some(mut events) = store.subscribe().await? else {
                return Err(eyre!("the {} store has no live updates", store.name()));
            };
            while let Some(event) = events.next().await {
                println!("{event}");
            }
        }
    }

    Ok(())
}
