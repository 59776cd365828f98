use clap::Parser;
use env_logger::Builder;
use log::{debug, error, info, LevelFilter};

use bgps::{config, handler};

#[derive(Parser)]
#[clap(name = "bgps", version, about = "BGP speaker and route injection utility")]
struct Args {
    /// Path to the speaker config file
    config_path: String,

    /// Check the configuration and exit
    #[clap(long)]
    validate: bool,

    /// Sets the level of logging verbosity
    #[clap(short = 'v', long, parse(from_occurrences))]
    verbose: u64,
}

fn main() {
    let args = Args::parse();

    let (bgps_level, other_level) = match args.verbose {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };
    Builder::new()
        .filter(Some("bgps"), bgps_level)
        .filter(None, other_level)
        .init();
    info!("Logging at levels {}/{}", bgps_level, other_level);

    let config = match config::from_file(&args.config_path) {
        Ok(config) => config,
        Err(err) => {
            error!("cannot load {}: {}", args.config_path, err);
            std::process::exit(1);
        }
    };
    debug!(
        "Found {} peers in {}",
        config.peers.len(),
        args.config_path
    );
    if args.validate {
        info!("configuration is valid");
        return;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("cannot start the runtime: {}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = runtime.block_on(handler::serve(args.config_path.clone(), config)) {
        error!("fatal: {}", err);
        std::process::exit(1);
    }
}
