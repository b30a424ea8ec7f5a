use clap::{App, Arg, SubCommand};
use waymark::{Result, Storage, StorageConfig, StoreError};

fn main() -> Result<()> {
    env_logger::init();

    let matches = App::new("waymark")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Shared-memory dataset publisher for routing engines")
        .subcommand(
            SubCommand::with_name("publish")
                .about("Load a dataset into shared memory and swap it in")
                .arg(
                    Arg::with_name("dataset")
                        .short("d")
                        .long("dataset")
                        .value_name("NAME")
                        .help("Dataset name readers look up in the region register")
                        .required(true)
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("base")
                        .short("b")
                        .long("base")
                        .value_name("PATH")
                        .help("Base artifact path, e.g. /data/berlin.osrm")
                        .required(true)
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("max_wait")
                        .short("w")
                        .long("max-wait")
                        .value_name("SECONDS")
                        .help("Max seconds to wait for the region lock (negative = forever)")
                        .default_value("-1")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("info")
                .about("Show version and build information"),
        )
        .get_matches();

    match matches.subcommand() {
        ("publish", Some(publish_matches)) => handle_publish(publish_matches),
        ("info", Some(_)) => show_info(),
        _ => {
            println!("Use --help for usage information");
            Ok(())
        }
    }
}

fn handle_publish(matches: &clap::ArgMatches) -> Result<()> {
    let dataset = matches.value_of("dataset").unwrap();
    let base = matches.value_of("base").unwrap();
    let max_wait: i64 = matches
        .value_of("max_wait")
        .unwrap()
        .parse()
        .map_err(|_| StoreError::invalid_config("Invalid max-wait value"))?;

    let config = StorageConfig::new(base);
    let storage = Storage::new(config);
    storage.run(max_wait, dataset)?;

    println!("Dataset '{}' published", dataset);
    Ok(())
}

fn show_info() -> Result<()> {
    println!("Waymark Shared-Memory Dataset Publisher");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));

    println!("\nCapabilities:");
    println!("  - Self-describing shared memory regions");
    println!("  - Atomic dataset hand-over with versioned register entries");
    println!("  - Deferred retirement of regions still held by readers");
    println!("  - Host-wide publisher serialization via file lock");

    Ok(())
}
