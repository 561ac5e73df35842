use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;

use backfs::counters;
use backfs::ui;

/// Maintenance tools for backfs cache directories.
///
/// These operate on an *unmounted* cache; the cache assumes it has its
/// directory to itself.
#[derive(Debug, Parser)]
#[clap(version, verbatim_doc_comment)]
struct Args {
    /// Verbosity (-v, -vv, -vvv, etc.)
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Prepend timestamps to all trace messages (from --verbose).
    #[clap(short, long)]
    timestamps: bool,

    /// The cache directory to operate on.
    #[clap(short, long)]
    cache: Utf8PathBuf,

    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    Init(ui::init::Args),
    Usage(ui::usage::Args),
    Invalidate(ui::invalidate::Args),
    Orphans,
    Check,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.verbose, args.timestamps);

    let result = match args.subcommand {
        Subcommand::Init(i) => ui::init::run(&args.cache, i),
        Subcommand::Usage(u) => ui::usage::run(&args.cache, u),
        Subcommand::Invalidate(i) => ui::invalidate::run(&args.cache, i),
        Subcommand::Orphans => ui::orphans::run(&args.cache),
        Subcommand::Check => ui::check::run(&args.cache),
    };
    counters::log_counts();
    result
}

/// Set up tracing to spit messages to stderr.
fn init_logger(verbosity: u8, timestamps: bool) {
    use tracing::level_filters::LevelFilter;

    let level = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false);
    if timestamps {
        builder.init();
    } else {
        builder.without_time().init();
    }
}
