use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use hako_crawler::base_system::{format_filename, logging};
use hako_crawler::book_parser::epub_deconstructor::{EpubDeconstructor, UnpackOptions};
use hako_crawler::book_parser::epub_generator::{EpubPackager, PackagerOptions};
use hako_crawler::book_parser::parser::CatalogParser;
use hako_crawler::download::downloader::NovelDownloader;
use hako_crawler::network::{FabricConfig, NetworkFabric, ProxyDescriptor, ProxyPool};

const DATA_DIR: &str = "data";
const RESULT_DIR: &str = "result";

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "hako-crawler")]
#[command(about = "Hako light novel downloader and EPUB packager")]
struct Cli {
    /// Novel URL to download, or an .epub file to deconstruct
    target: Option<String>,

    /// Comma-separated proxy URLs (http://, https:// or socks5://)
    #[arg(short = 'p', long = "proxy", value_delimiter = ',')]
    proxy: Vec<String>,

    /// Enable debug output
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// Print version and exit
    #[arg(long, default_value_t = false)]
    version: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("hako-crawler v{VERSION}");
        return Ok(());
    }

    let _guard = match logging::init(cli.verbose) {
        Ok(guard) => Some(guard),
        Err(logging::LogError::AlreadyInitialized) => None,
        Err(err) => return Err(err.into()),
    };

    let pool = build_pool(&cli)?;
    let fabric = match pool {
        Some(pool) => NetworkFabric::with_pool(FabricConfig::default(), pool)?,
        None => NetworkFabric::new(FabricConfig::default())?,
    };

    let Some(target) = cli.target.as_deref() else {
        println!("usage: hako-crawler [OPTIONS] <NOVEL_URL | EPUB_FILE>");
        return Ok(());
    };

    if target.ends_with(".epub") {
        let deconstructor =
            EpubDeconstructor::new(Path::new(target), UnpackOptions::default())?;
        let base = deconstructor.deconstruct()?;
        println!("deconstructed into {}", base.display());
        return Ok(());
    }

    run_pipeline(&fabric, target)
}

fn build_pool(cli: &Cli) -> Result<Option<ProxyPool>> {
    if cli.proxy.is_empty() {
        return Ok(None);
    }
    for url in &cli.proxy {
        if !ProxyDescriptor::validate(url) {
            bail!(
                "invalid proxy url: {}",
                ProxyDescriptor::sanitize_for_display(url)
            );
        }
    }
    let pool = ProxyPool::new(&cli.proxy)?;
    if cli.verbose {
        for descriptor in pool.all() {
            info!(
                "proxy: {}",
                ProxyDescriptor::sanitize_for_display(&descriptor.reconstruct())
            );
        }
    }
    Ok(Some(pool))
}

/// Full acquisition: catalog, every volume, then a merged EPUB.
fn run_pipeline(fabric: &NetworkFabric, url: &str) -> Result<()> {
    let novel = CatalogParser::parse(fabric, url)?;
    let base_dir = PathBuf::from(DATA_DIR).join(format_filename(&novel.name));

    let downloader = NovelDownloader::new(novel, &base_dir, fabric)
        .with_context(|| format!("prepare {}", base_dir.display()))?;
    downloader.create_metadata_file()?;

    let volumes = downloader.novel().volumes.clone();
    for volume in &volumes {
        downloader.download_volume(volume, None)?;
    }

    let mut packager = EpubPackager::new(
        &base_dir,
        PackagerOptions {
            compress_images: false,
            output_dir: PathBuf::from(RESULT_DIR),
        },
    );
    let volume_files: Vec<String> = packager
        .meta()
        .volumes
        .iter()
        .map(|v| v.filename.clone())
        .collect();
    if volume_files.is_empty() {
        bail!("no volume records found under {}", base_dir.display());
    }
    let out = packager.build_merged(&volume_files)?;
    println!("created {}", out.display());
    Ok(())
}
