//! bmapcopy CLI - create bmap manifests and copy sparse images with them.

use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use flate2::read::MultiGzDecoder;
use tracing::{debug, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use bmapcopy::{
    validate_block_size, BmapError, ChecksumType, Config, Copier, Creator, Destination,
    ImageInput, ManifestInput, ManifestOutput, Source,
};

/// bmapcopy - sparse disk image copying guided by block maps
#[derive(Parser)]
#[command(name = "bmapcopy")]
#[command(version)]
#[command(about = "Create block maps and copy sparse disk images with them")]
#[command(long_about = None)]
struct Cli {
    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a bmap manifest for an image
    Create {
        /// Image file
        #[arg(required = true)]
        image: PathBuf,

        /// Output manifest (default: <image>.bmap)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Block size (512-1048576, power of 2; default: filesystem block size)
        #[arg(short, long, value_parser = parse_block_size)]
        block_size: Option<u64>,

        /// Checksum algorithm (sha256, sha512, blake3, md5)
        #[arg(short, long, default_value = "sha256")]
        checksum: ChecksumType,
    },

    /// Copy an image, skipping and recreating holes
    Copy {
        /// Source image; `.gz` files are decompressed on the fly
        #[arg(required = true)]
        source: PathBuf,

        /// Destination file or block device
        #[arg(required = true)]
        dest: PathBuf,

        /// Manifest to use (default: <source>.bmap if it exists)
        #[arg(long, conflicts_with = "nobmap")]
        bmap: Option<PathBuf>,

        /// Copy without a manifest
        #[arg(long)]
        nobmap: bool,

        /// Skip checksum verification
        #[arg(long)]
        no_verify: bool,

        /// Write zeros instead of leaving holes
        #[arg(long)]
        no_holes: bool,

        /// Do not flush the destination to stable storage
        #[arg(long)]
        no_sync: bool,

        /// Block size when copying without a manifest
        #[arg(short, long, value_parser = parse_block_size)]
        block_size: Option<u64>,
    },
}

fn parse_block_size(s: &str) -> Result<u64, String> {
    let size: u64 = s.parse().map_err(|e| format!("{e}"))?;
    validate_block_size(size).map_err(|e| e.to_string())?;
    Ok(size)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(exit_status(&e))
        }
    }
}

fn init_logging(cli: &Cli) {
    let level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::WARN
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();

    // A subscriber can only be missing if something else installed one first
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Integrity failures get their own status so scripts can tell a bad image
/// from an I/O problem.
fn exit_status(err: &BmapError) -> u8 {
    match err {
        e if e.is_integrity() => 2,
        BmapError::ManifestFormat(_) => 3,
        _ => 1,
    }
}

fn run(cli: Cli) -> bmapcopy::Result<()> {
    match cli.command {
        Commands::Create {
            image,
            output,
            block_size,
            checksum,
        } => run_create(image, output, block_size, checksum),
        Commands::Copy {
            source,
            dest,
            bmap,
            nobmap,
            no_verify,
            no_holes,
            no_sync,
            block_size,
        } => {
            let manifest = if nobmap {
                None
            } else {
                bmap.or_else(|| default_bmap(&source))
            };
            run_copy(CopyArgs {
                source,
                dest,
                manifest,
                verify: !no_verify,
                create_holes: !no_holes,
                sync: !no_sync,
                block_size,
            })
        }
    }
}

fn run_create(
    image: PathBuf,
    output: Option<PathBuf>,
    block_size: Option<u64>,
    checksum_type: ChecksumType,
) -> bmapcopy::Result<()> {
    let output = output.unwrap_or_else(|| with_suffix(&image, ".bmap"));
    let config = Config {
        block_size,
        checksum_type,
        ..Config::default()
    };

    let mut creator = Creator::with_config(
        ImageInput::Path(image.clone()),
        ManifestOutput::Path(output.clone()),
        config,
    );
    let manifest = creator.generate()?;

    println!(
        "{}: {} of {} blocks mapped ({} byte blocks, {} ranges)",
        image.display(),
        manifest.mapped_blocks_count(),
        manifest.blocks_count(),
        manifest.block_size(),
        manifest.ranges().len()
    );
    println!("Manifest written to {}", output.display());
    Ok(())
}

struct CopyArgs {
    source: PathBuf,
    dest: PathBuf,
    manifest: Option<PathBuf>,
    verify: bool,
    create_holes: bool,
    sync: bool,
    block_size: Option<u64>,
}

fn run_copy(args: CopyArgs) -> bmapcopy::Result<()> {
    let source = if is_gzip(&args.source) {
        let file = File::open(&args.source).map_err(|e| BmapError::SourceUnreadable {
            what: format!("source {}", args.source.display()),
            source: e,
        })?;
        Source::stream(MultiGzDecoder::new(file))
    } else {
        Source::Path(args.source.clone())
    };

    match &args.manifest {
        Some(path) => debug!(manifest = %path.display(), "Using manifest"),
        None => debug!("Copying without a manifest"),
    }

    let config = Config {
        block_size: args.block_size,
        ..Config::default()
    };
    let mut copier = Copier::with_config(
        source,
        Destination::Path(args.dest.clone()),
        args.manifest.map(ManifestInput::Path),
        config,
    )?;

    let stats = copier.copy(args.create_holes, args.verify)?;
    if args.sync {
        copier.sync()?;
    }

    println!(
        "Copied {} of {} bytes from {} to {} ({} ranges, {} holes)",
        stats.bytes_copied,
        stats.image_size,
        args.source.display(),
        args.dest.display(),
        stats.ranges_copied,
        stats.holes
    );
    if stats.verified {
        println!("All checksums verified");
    }
    if let Some(digest) = stats.image_digest {
        println!("Image checksum: {digest}");
    }
    Ok(())
}

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

/// `<source>.bmap`, or `<source without .gz>.bmap` for compressed sources,
/// whichever exists first.
fn default_bmap(source: &Path) -> Option<PathBuf> {
    let mut candidates = vec![with_suffix(source, ".bmap")];
    if is_gzip(source) {
        candidates.push(with_suffix(&source.with_extension(""), ".bmap"));
    }
    candidates.into_iter().find(|p| p.is_file())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
