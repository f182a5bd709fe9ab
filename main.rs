use std::env;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, exit};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;
use zcopy::Config;
use zcopy::config::{LOG_VAR, THRESHOLD_VAR};

const USAGE: &str = "usage: zcopy [--threshold BYTES] [--preload PATH] -- <program> [arguments...]";

/// Name of the interposer library built next to this binary.
const LIBRARY: &str = "libzcopy.so";

#[derive(Debug, PartialEq)]
struct Opts {
    /// Threshold handed to the interposer, validated.
    threshold: Option<usize>,

    /// Interposer library to preload.
    preload: Option<PathBuf>,

    /// The program to run.
    program: String,

    /// The arguments to pass to the program.
    program_args: Vec<String>,
}

fn main() {
    setup_logging();

    let args: Vec<String> = env::args().collect();
    let opts = match parse_opts(&args) {
        Ok(opts) => opts,
        Err(msg) => {
            eprintln!("zcopy: {msg}");
            eprintln!("{USAGE}");
            exit(1);
        }
    };

    let preload = match opts.preload.clone().map_or_else(default_preload, Ok) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("zcopy: cannot locate {LIBRARY}: {err}");
            exit(1);
        }
    };

    let mut command = Command::new(&opts.program);
    command
        .args(&opts.program_args)
        .env("LD_PRELOAD", preload_list(&preload, env::var("LD_PRELOAD").ok()));
    if let Some(threshold) = opts.threshold {
        command.env(THRESHOLD_VAR, threshold.to_string());
    }
    debug!(program = %opts.program, preload = %preload.display(), "exec");

    let err = command.exec();
    error!(%err, program = %opts.program, "exec failed");
    exit(127);
}

fn setup_logging() {
    let filter = EnvFilter::try_from_env(LOG_VAR).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn default_preload() -> std::io::Result<PathBuf> {
    Ok(env::current_exe()?.with_file_name(LIBRARY))
}

/// Put our library in front of whatever the caller already preloads.
fn preload_list(library: &std::path::Path, existing: Option<String>) -> String {
    match existing.filter(|list| !list.is_empty()) {
        Some(list) => format!("{}:{list}", library.display()),
        None => library.display().to_string(),
    }
}

fn parse_opts(args: &[String]) -> Result<Opts, String> {
    let mut threshold = None;
    let mut preload = None;
    let mut i = 1; // Skip program name
    while i < args.len() {
        match args[i].as_str() {
            "--threshold" => {
                let value = args.get(i + 1).ok_or("--threshold needs a value")?;
                let config = Config::from_lookup(|_| Some(value.clone())).map_err(|err| err.to_string())?;
                threshold = Some(config.threshold);
                i += 2;
            }
            "--preload" => {
                let value = args.get(i + 1).ok_or("--preload needs a value")?;
                preload = Some(PathBuf::from(value));
                i += 2;
            }
            "--" => {
                i += 1;
                break;
            }
            arg if arg.starts_with("--") => return Err(format!("unknown option {arg}")),
            _ => break,
        }
    }
    let program = args.get(i).cloned().ok_or("no program given")?;
    Ok(Opts {
        threshold,
        preload,
        program,
        program_args: args[i + 1..].to_vec(),
    })
}
