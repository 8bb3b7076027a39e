//! bindery - ebook production pipeline

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use bindery::build::check_source;
use bindery::{build, BuildOptions, Toolbox};

#[derive(Parser)]
#[command(name = "bindery")]
#[command(version, about = "Build distributable ebooks from an EPUB 3 source tree", long_about = None)]
#[command(after_help = "EXAMPLES:
    bindery                          Build the tree in the current directory
    bindery --kobo --kindle my-book  Build every format
    bindery --check my-book          Validate without writing artifacts")]
struct Cli {
    /// Source directory (a container layout with META-INF/container.xml)
    #[arg(value_name = "SOURCE", default_value = ".")]
    source: PathBuf,

    /// Also build a Kobo .kepub.epub
    #[arg(long)]
    kobo: bool,

    /// Also build a Kindle .azw3 (requires ebook-convert)
    #[arg(long)]
    kindle: bool,

    /// Validate the compatible build without writing any artifacts
    #[arg(long)]
    check: bool,

    /// Where to place finished artifacts
    #[arg(long, value_name = "DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = BuildOptions {
        source_dir: cli.source,
        output_dir: cli.output_dir,
        kobo: cli.kobo,
        kindle: cli.kindle,
        check_only: cli.check,
    };

    if let Err(e) = check_source(&options.source_dir) {
        eprintln!("error: {e}");
        return ExitCode::from(e.exit_code());
    }

    let tools = match Toolbox::detect(options.kindle) {
        Ok(tools) => tools,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match build(&options, &tools) {
        Ok(outcome) => {
            if outcome.messages.is_empty() {
                ExitCode::SUCCESS
            } else {
                for message in &outcome.messages {
                    eprintln!("{message}");
                }
                let err = bindery::Error::ValidationFailed {
                    count: outcome.messages.len(),
                };
                eprintln!("error: {err}");
                ExitCode::from(err.exit_code())
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}
