use clap::Parser;
use std::io::Write;

mod cli;
mod commands;
mod exit_codes;
mod output;

use cli::Cli;

/// `-v` picks the level; without it `RUST_LOG` applies, falling back to warnings.
fn init_logging(verbose: u8) {
    let mut builder = env_logger::Builder::new();
    match verbose {
        0 => builder.filter_level(log::LevelFilter::Warn).parse_default_env(),
        1 => builder.filter_level(log::LevelFilter::Info),
        2 => builder.filter_level(log::LevelFilter::Debug),
        _ => builder.filter_level(log::LevelFilter::Trace),
    };

    // Every node of an array runs on its own named thread
    builder.format(|buf, record| {
        let thread = std::thread::current();
        writeln!(
            buf,
            "{} {:<5} [{}] {}",
            buf.timestamp_millis(),
            record.level(),
            thread.name().unwrap_or("main"),
            record.args()
        )
    });
    builder.init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let exit_code = match cli.command {
        cli::Command::Run(args) => commands::run::execute(args).await,
        cli::Command::Background(args) => commands::background::execute(args).await,
        cli::Command::Detect(args) => commands::detect::execute(args),
        cli::Command::Validate(args) => commands::validate::execute(args),
    };

    std::process::exit(exit_code);
}
