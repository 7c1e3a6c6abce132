use clap::*;
use clap_num::maybe_hex;
use exhume_vmdk::{VmdkOptions, VMDK};
use log::{debug, error, info, LevelFilter};
use std::{
    io::{Read, Seek, SeekFrom},
    path::Path,
    process::exit,
};

fn load_options(matches: &ArgMatches) -> VmdkOptions {
    let mut options = match matches.get_one::<String>("config") {
        Some(config) => match VmdkOptions::from_json_file(Path::new(config)) {
            Ok(options) => options,
            Err(err) => {
                error!("Could not load configuration '{}': {}", config, err);
                exit(1);
            }
        },
        None => VmdkOptions::default(),
    };
    if let Some(bytes) = matches.get_one::<usize>("grain_cache_bytes") {
        options.grain_cache_bytes = *bytes;
    }
    if let Some(entries) = matches.get_one::<usize>("sector_cache_entries") {
        options.sector_cache_entries = *entries;
    }
    debug!("Cache configuration: {:?}", options);
    options
}

fn process_file(file_path: &str, options: &VmdkOptions, matches: &ArgMatches) {
    info!("Processing the file '{}' in 'vmdk' format...", file_path);
    let mut reader = match VMDK::open_with_options(file_path, options) {
        Ok(vmdk) => vmdk,
        Err(err) => {
            error!("Could not open '{}': {}", file_path, err);
            exit(1);
        }
    };

    if matches.get_flag("json") {
        match serde_json::to_string_pretty(&reader.info()) {
            Ok(json) => println!("{}", json),
            Err(err) => {
                error!("Could not serialize disk information: {}", err);
                exit(1);
            }
        }
        return;
    }

    debug!("------------------------------------------------------------");
    reader.print_info();
    debug!("------------------------------------------------------------");

    let Some(size) = matches.get_one::<u64>("size") else {
        return;
    };
    let offset = matches.get_one::<u64>("offset").unwrap_or(&0);
    if let Err(err) = reader.seek(SeekFrom::Start(*offset)) {
        error!("Could not seek to offset {:#x}: {}", offset, err);
        exit(1);
    }

    let mut bytes = vec![0u8; *size as usize];
    match reader.read(&mut bytes) {
        Ok(read) => {
            bytes.truncate(read);
            let result = String::from_utf8_lossy(&bytes);
            println!("{}", result);
        }
        Err(err) => {
            error!("Read failed at offset {:#x}: {}", offset, err);
            exit(1);
        }
    }
}

fn main() {
    let matches = Command::new("exhume_vmdk")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Read sectors out of VMware VMDK virtual disks.")
        .arg(
            Arg::new("body")
                .short('b')
                .long("body")
                .value_parser(value_parser!(String))
                .required(true)
                .help("The path to the VMDK descriptor or monolithic sparse file."),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .value_parser(maybe_hex::<u64>)
                .required(false)
                .help("The size (in bytes) to read."),
        )
        .arg(
            Arg::new("offset")
                .short('o')
                .long("offset")
                .value_parser(maybe_hex::<u64>)
                .required(false)
                .help("Read at a specific offset."),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Print the disk information as JSON and exit."),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_parser(value_parser!(String))
                .required(false)
                .help("JSON file holding the cache configuration."),
        )
        .arg(
            Arg::new("grain_cache_bytes")
                .long("grain-cache-bytes")
                .value_parser(maybe_hex::<usize>)
                .required(false)
                .help("Memory budget (in bytes) of the grain cache."),
        )
        .arg(
            Arg::new("sector_cache_entries")
                .long("sector-cache-entries")
                .value_parser(maybe_hex::<usize>)
                .required(false)
                .help("Maximum number of sectors kept in the sector cache."),
        )
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("log-level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info")
                .help("Set the log verbosity level"),
        )
        .get_matches();

    let log_level_str = matches
        .get_one::<String>("log_level")
        .map(String::as_str)
        .unwrap_or("info");
    let level_filter = match log_level_str {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    env_logger::Builder::new().filter_level(level_filter).init();

    let Some(file_path) = matches.get_one::<String>("body") else {
        error!("Missing --body argument");
        exit(1);
    };
    let options = load_options(&matches);

    process_file(file_path, &options, &matches);
}
