use std::io::IsTerminal;
use std::process;

use clap::Parser;

use code_scanner::error::exit_code;
use code_scanner::git::DEFAULT_POLL_INTERVAL;
use code_scanner::supervisor::{self, RunOptions};

mod cli;

use cli::Cli;

fn main() {
    let cli = Cli::parse();

    init_logging(&cli);

    let options = RunOptions {
        directory: cli.directory.clone(),
        config_path: cli
            .config
            .as_ref()
            .map(|path| {
                std::path::PathBuf::from(
                    shellexpand::tilde(&path.to_string_lossy()).into_owned(),
                )
            })
            .unwrap_or_else(supervisor::default_config_path),
        base_commit: cli.commit.clone(),
        poll_interval: DEFAULT_POLL_INTERVAL,
    };

    if let Err(e) = supervisor::run(options) {
        eprintln!("{e:#}");
        // 1 = configuration error, 2 = runtime fatal. Anything without an
        // explicit mapping died at runtime.
        process::exit(exit_code(&e).unwrap_or(2));
    }
}

fn init_logging(cli: &Cli) {
    use std::io::Write;

    let default_filter = if cli.verbose { "debug" } else { "info" };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter));
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{:<5}] {}",
            chrono::Local::now().format("%H:%M:%S"),
            record.level(),
            record.args()
        )
    });

    // Detached (no terminal on stderr): log into the target directory so
    // a service-managed daemon still leaves a trace.
    if !std::io::stderr().is_terminal()
        && let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(supervisor::log_file_path(&cli.directory))
    {
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
}
