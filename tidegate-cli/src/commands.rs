//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Subcommand};
use tidegate_core::config::CacheBackend;
use tidegate_core::upload::{UploadFile, UploadJob};
use tidegate_core::{Gateway, GatewayConfig};
use tokio_util::sync::CancellationToken;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP gateway
    Serve(ServeArgs),
    /// Create a torrent from local files and store its pieces
    Import(ImportArgs),
}

/// Settings shared by every command. Unset flags keep the
/// `TIDEGATE_*` environment value or the built-in default.
#[derive(Args, Debug, Default)]
pub struct GatewayArgs {
    /// Metainfo cache directory
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
    /// Metainfo cache backend
    #[arg(long, value_enum)]
    pub cache_backend: Option<CacheBackend>,
    /// Piece storage directory
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,
    /// Keep pieces in memory only
    #[arg(long)]
    pub in_memory: bool,
    /// Tracker added to new sessions and uploads; repeatable
    #[arg(long = "implicit-tracker")]
    pub implicit_trackers: Vec<String>,
    /// Replace cached and posted trackers with the implicit ones
    #[arg(long)]
    pub override_trackers: bool,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Listen address
    #[arg(long)]
    pub addr: Option<String>,
    /// Seconds an unused session stays alive
    #[arg(long)]
    pub grace_secs: Option<u64>,
    /// Keep idle torrents in the engine after their grace period
    #[arg(long)]
    pub keep_torrents: bool,
    /// Delete stored pieces of dropped torrents
    #[arg(long)]
    pub cleanup_storage: bool,
    /// Peer gateway answering `/bep44`; repeatable
    #[arg(long = "lookup-backend")]
    pub lookup_backends: Vec<String>,

    #[command(flatten)]
    pub gateway: GatewayArgs,
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Torrent name
    #[arg(long)]
    pub name: String,
    /// Files to include, in order
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
    /// Write the metainfo here
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub gateway: GatewayArgs,
}

impl GatewayArgs {
    fn apply(&self, config: &mut GatewayConfig) {
        if let Some(dir) = &self.cache_dir {
            config.cache.dir = dir.clone();
        }
        if let Some(backend) = self.cache_backend {
            config.cache.backend = backend;
        }
        if let Some(dir) = &self.storage_dir {
            config.storage.dir = dir.clone();
        }
        if self.in_memory {
            config.storage.in_memory = true;
        }
        if !self.implicit_trackers.is_empty() {
            config.trackers.implicit = self.implicit_trackers.clone();
        }
        if self.override_trackers {
            config.trackers.override_existing = true;
        }
    }
}

impl ServeArgs {
    /// Environment config with these flags applied on top.
    pub fn config(&self) -> GatewayConfig {
        let mut config = GatewayConfig::from_env();
        self.gateway.apply(&mut config);
        if let Some(addr) = &self.addr {
            config.http.addr = addr.clone();
        }
        if let Some(secs) = self.grace_secs {
            config.sessions.grace = Duration::from_secs(secs);
        }
        if self.keep_torrents {
            config.sessions.expire_torrents = false;
        }
        if self.cleanup_storage {
            config.sessions.cleanup_storage_on_drop = true;
        }
        if !self.lookup_backends.is_empty() {
            config.lookup.backends = self.lookup_backends.clone();
        }
        config
    }
}

/// Handle the CLI command
///
/// # Errors
/// Returns the failing command's error with context attached
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve(args) => serve(args).await,
        Commands::Import(args) => import(args).await,
    }
}

/// Runs the gateway until Ctrl-C.
///
/// # Errors
/// - Gateway could not be built from the configuration
/// - Server could not bind or failed while running
pub async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = args.config();
    let gateway = Arc::new(Gateway::from_config(config).context("building gateway")?);

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown requested"),
            Err(e) => tracing::error!("Listening for Ctrl-C failed: {}", e),
        }
        on_signal.cancel();
    });

    tidegate_web::run_server(gateway, shutdown).await?;
    Ok(())
}

/// Hashes and stores local files as a new torrent.
///
/// # Errors
/// - A file could not be opened or read
/// - Storing pieces or writing the metainfo failed
pub async fn import(args: ImportArgs) -> anyhow::Result<()> {
    let mut config = GatewayConfig::from_env();
    args.gateway.apply(&mut config);
    let gateway = Gateway::from_config(config).context("building gateway")?;

    let mut files = Vec::with_capacity(args.files.len());
    for path in &args.files {
        files.push(open_upload_file(path).await?);
    }
    let metainfo = gateway
        .upload(UploadJob::new(args.name, files))
        .await
        .context("importing files")?;

    if let Some(output) = &args.output {
        tokio::fs::write(output, metainfo.to_bytes())
            .await
            .with_context(|| format!("writing {}", output.display()))?;
    }
    println!("{}", metainfo.info_hash());
    Ok(())
}

async fn open_upload_file(path: &Path) -> anyhow::Result<UploadFile> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let length = file
        .metadata()
        .await
        .with_context(|| format!("reading metadata of {}", path.display()))?
        .len();
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?;
    Ok(UploadFile::new(vec![name.to_string()], length, file))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(subcommand)]
        command: Commands,
    }

    #[test]
    fn test_serve_flags_override_config() {
        let cli = TestCli::parse_from([
            "tidegate",
            "serve",
            "--addr",
            "127.0.0.1:0",
            "--grace-secs",
            "3",
            "--keep-torrents",
            "--implicit-tracker",
            "udp://a:1",
            "--implicit-tracker",
            "udp://b:2",
            "--cache-backend",
            "memory",
        ]);
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.config();
        assert_eq!(config.http.addr, "127.0.0.1:0");
        assert_eq!(config.sessions.grace, Duration::from_secs(3));
        assert!(!config.sessions.expire_torrents);
        assert_eq!(config.trackers.implicit, vec!["udp://a:1", "udp://b:2"]);
        assert_eq!(config.cache.backend, CacheBackend::Memory);
    }

    #[tokio::test]
    async fn test_import_writes_metainfo() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("clip.bin");
        std::fs::write(&source, vec![7u8; 40_000]).unwrap();
        let output = dir.path().join("clip.torrent");

        import(ImportArgs {
            name: "clip".to_string(),
            files: vec![source],
            output: Some(output.clone()),
            gateway: GatewayArgs {
                cache_dir: Some(dir.path().join("torrents")),
                storage_dir: Some(dir.path().join("pieces")),
                ..GatewayArgs::default()
            },
        })
        .await
        .unwrap();

        let written = std::fs::read(&output).unwrap();
        let metainfo = tidegate_core::torrent::MetaInfo::from_bytes(&written).unwrap();
        let info = metainfo.parse_info().unwrap();
        assert_eq!(info.name, "clip");
        assert_eq!(info.total_length(), 40_000);
        let cached = dir
            .path()
            .join("torrents")
            .join(format!("{}.torrent", metainfo.info_hash().to_hex()));
        assert!(cached.exists());
    }
}
