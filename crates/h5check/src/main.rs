//! h5check command line.

use std::env::VarError;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use h5check::{parse_address, CheckOptions, CompatLevel, Verbosity, Verdict};
use h5check_format::Session;

/// Environment variable holding the `:`-separated external link search path.
const EXT_PREFIX_VAR: &str = "HDF5_EXT_PREFIX";

#[derive(Parser, Debug)]
#[command(author, version, about = "Check an HDF5 file for conformance with the file format")]
struct Args {
    /// Verbosity: 0 terse, 1 normal, 2 debug
    #[arg(short = 'v', long = "verbose", default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
    verbosity: u8,

    /// Validate the files named by external links
    #[arg(short = 'e', long = "external")]
    external: bool,

    /// Format rules to check against: 16 or 18
    #[arg(short = 'f', long = "format", default_value = "18", value_parser = parse_compat)]
    format: CompatLevel,

    /// Check only the object header at this address (decimal or 0x-hex)
    #[arg(short = 'o', long = "object", value_parser = parse_address)]
    object: Option<u64>,

    /// File to check; `%d` in the name selects the family driver
    file: PathBuf,
}

fn parse_compat(text: &str) -> Result<CompatLevel, String> {
    text.parse::<u32>()
        .ok()
        .and_then(CompatLevel::from_code)
        .ok_or_else(|| format!("unsupported format level {text:?}, expected 16 or 18"))
}

fn verbosity(level: u8) -> Verbosity {
    match level {
        0 => Verbosity::Terse,
        1 => Verbosity::Normal,
        _ => Verbosity::Debug,
    }
}

fn init_tracing(verbosity: Verbosity) {
    let default = match verbosity {
        Verbosity::Terse => "off",
        Verbosity::Normal => "info",
        Verbosity::Debug => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    let verbosity = verbosity(args.verbosity);
    init_tracing(verbosity);

    let mut options = CheckOptions::new()
        .with_compat(args.format)
        .with_verbosity(verbosity)
        .with_external_links(args.external)
        .with_object_address(args.object)
        .with_retain(false);
    match std::env::var(EXT_PREFIX_VAR) {
        Ok(search) => options = options.with_ext_search_path(&search),
        Err(VarError::NotPresent) => {}
        Err(e) => return Err(e).with_context(|| format!("reading {EXT_PREFIX_VAR}")),
    }

    let mut session = Session::new(options);
    let verdict = session.check_path(&args.file);
    let stats = session.stats();
    tracing::info!(
        files = stats.files,
        headers = stats.headers,
        external_links = stats.external_links,
        complaints = session.report().total(),
        "check finished"
    );

    let name = args.file.display();
    match verdict {
        Verdict::Compliant => println!("No non-compliance errors found in {name}"),
        Verdict::NonCompliant => println!("Non-compliance errors found in {name}"),
        Verdict::Incomplete => {
            for e in session.fatal_errors() {
                eprintln!("h5check: {e}");
            }
            println!("Validation of {name} did not complete");
        }
    }
    std::process::exit(verdict.exit_code());
}
