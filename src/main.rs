use clap::Parser;
use ocirun::cli::{self, Options};

fn main() {
    let options = Options::parse();

    let level = if options.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();

    std::process::exit(cli::run(options));
}
