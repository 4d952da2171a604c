//! memwatch — log every access to a named global in a launched target
//!
//! Launches the executable under a debug attachment, resolves the variable
//! through the target's symbol information, arms a hardware watchpoint on
//! it and prints one line per access to stdout:
//!
//! ```text
//! <symbol> read <value>
//! <symbol> write <old> -> <new>
//! ```
//!
//! Exit codes: the target's own exit code on a completed run, 1 on any
//! runtime failure, 2 on argument errors.

use clap::Parser;
use memwatch_common::{init_logging, LaunchConfig, LogConfig};

#[derive(Parser, Debug)]
#[command(name = "memwatch")]
#[command(about = "Launch an executable and log every access to a named global variable")]
#[command(version)]
struct Args {
    /// Global variable to watch; also accepts the module!name form
    #[arg(short = 'v', long = "var")]
    var: String,

    /// Path to the executable to run
    #[arg(short = 'e', long = "exec")]
    exec: String,

    /// Working directory for the target (inherited if omitted)
    #[arg(long)]
    workdir: Option<String>,

    /// Give the target its own console window
    #[arg(long)]
    new_console: bool,

    /// Follow child processes with the debug attachment
    #[arg(long)]
    debug_children: bool,

    /// Diagnostic log level on stderr (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Arguments for the target, after `--`
    #[arg(last = true)]
    target_args: Vec<String>,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // Help and version print to stdout and exit 0; anything else
            // is an argument error
            let code = if err.use_stderr() { 2 } else { 0 };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    init_logging(&LogConfig::default().with_level(&args.log_level));

    std::process::exit(run(args));
}

#[cfg(windows)]
fn run(args: Args) -> i32 {
    use memwatch_core::WatchSession;

    let mut config = LaunchConfig::new(&args.exec)
        .with_args(args.target_args.clone())
        .with_new_console(args.new_console)
        .with_debug_children(args.debug_children);
    if let Some(dir) = &args.workdir {
        config = config.with_working_dir(dir);
    }

    match WatchSession::new(config, args.var).run() {
        Ok(exit_code) => exit_code as i32,
        Err(err) => {
            eprintln!("{err}");
            1
        }
    }
}

#[cfg(not(windows))]
fn run(args: Args) -> i32 {
    // Keep the launch configuration path exercised even where the debug
    // engine is unavailable
    let _ = LaunchConfig::new(&args.exec).with_args(args.target_args);
    eprintln!("memwatch currently supports Windows targets only.");
    1
}
