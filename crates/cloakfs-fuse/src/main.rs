//! cloakmount — mount a plaintext view over a ciphertext tree.

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cloakfs_core::{KeyServiceConfig, KeySource};
use cloakfs_fuse::{oslib, CloakFs};

#[derive(Parser)]
#[command(
    name = "cloakmount",
    version,
    about = "Transparent encrypted view over a backing directory"
)]
struct Cli {
    /// Where the decrypted view is mounted.
    mount_point: PathBuf,

    /// Directory holding the ciphertext tree.
    backing_dir: PathBuf,

    /// Fetch the file key from this key service instead of the built-in
    /// static key.
    #[arg(long, value_name = "URL")]
    key_url: Option<url::Url>,

    /// Number of dispatch threads for the FUSE session.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Extra options forwarded verbatim to the FUSE multiplexer
    /// (e.g. `-o allow_other`).
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    fuse_args: Vec<OsString>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let backing = cli.backing_dir.canonicalize().with_context(|| {
        format!(
            "resolving backing directory {}",
            cli.backing_dir.display()
        )
    })?;

    // Creation modes from clients are honored verbatim.
    oslib::umask(0);

    let source = match cli.key_url {
        Some(url) => KeySource::Remote(KeyServiceConfig::new(url)),
        None => KeySource::Static,
    };
    let key = source.resolve().context("acquiring file key")?;

    let fs = CloakFs::new(backing, key);
    let fuse_args: Vec<&OsStr> = cli.fuse_args.iter().map(OsString::as_os_str).collect();

    info!(
        mount = %cli.mount_point.display(),
        root = %fs.backing_root().display(),
        "mounting"
    );
    fuse_mt::mount(
        fuse_mt::FuseMT::new(fs, cli.threads),
        &cli.mount_point,
        &fuse_args,
    )
    .context("FUSE session failed")?;

    Ok(())
}
