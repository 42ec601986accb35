use std::path::PathBuf;
use std::process::exit;

use clap::error::ErrorKind;
use clap::Parser;
use risa_drv::{run_file, run_repl, EXIT_USAGE};

/// The Risa interpreter: run a script file, or start a REPL.
#[derive(Parser)]
#[command(name = "risa")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "The Risa scripting language", long_about = None)]
struct Args {
    /// Script to execute; omit to start the REPL.
    file: Option<PathBuf>,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => error.exit(),
            _ => {
                let _ = error.print();
                exit(EXIT_USAGE);
            }
        },
    };

    match args.file {
        Some(path) => exit(run_file(&path)),
        None => {
            if let Err(error) = run_repl() {
                eprintln!("error: {}", error);
                exit(1);
            }
        }
    }
}
