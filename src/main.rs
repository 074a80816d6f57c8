use clap::{Arg, ArgAction, Command, value_parser};
use clap_num::maybe_hex;
use exhume_bitlocker::metadata::entries_to_string;
use exhume_bitlocker::{BitlockerError, BitlockerParser, BitlockerVolume};
use exhume_body::{Body, BodySlice};
use log::{debug, error, info};
use serde_json::{Value, json};
use std::fs::File;
use std::io::{self, BufWriter};

fn print_json(value: &Value, what: &str) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => error!("Error serializing {} to JSON: {}", what, e),
    }
}

fn main() {
    let matches = Command::new("exhume_bitlocker")
        .version("0.1.0")
        .author("ForensicXlab")
        .about("Unlock and decrypt a BitLocker protected volume.")
        .arg(
            Arg::new("body")
                .short('b')
                .long("body")
                .value_parser(value_parser!(String))
                .required(true)
                .help("The path to the body to exhume."),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_parser(value_parser!(String))
                .required(false)
                .help("The format of the file, either 'raw' or 'ewf'."),
        )
        .arg(
            Arg::new("offset")
                .short('o')
                .long("offset")
                .value_parser(maybe_hex::<u64>)
                .required(true)
                .help("The BitLocker volume starts at address (decimal or hex)."),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .value_parser(maybe_hex::<u64>)
                .required(true)
                .help("The size of the BitLocker volume in sectors (decimal or hex)."),
        )
        .arg(
            Arg::new("password")
                .short('p')
                .long("password")
                .value_parser(value_parser!(String))
                .help("User password or 48-digit recovery password."),
        )
        .arg(
            Arg::new("header")
                .long("header")
                .action(ArgAction::SetTrue)
                .help("Display the volume header and the FVE metadata headers."),
        )
        .arg(
            Arg::new("metadata")
                .long("metadata")
                .action(ArgAction::SetTrue)
                .help("Display the FVE metadata entries."),
        )
        .arg(
            Arg::new("info")
                .long("info")
                .action(ArgAction::SetTrue)
                .help("Display the unlock status and the encryption parameters."),
        )
        .arg(
            Arg::new("dump")
                .long("dump")
                .value_parser(value_parser!(String))
                .help("Write the decrypted volume to this file."),
        )
        .arg(
            Arg::new("json")
                .short('j')
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Output certain structures (header, metadata, info) in JSON format."),
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

    // Initialize logger.
    let log_level_str = matches
        .get_one::<String>("log_level")
        .map(String::as_str)
        .unwrap_or("info");
    let level_filter = match log_level_str {
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "info" => log::LevelFilter::Info,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::new().filter_level(level_filter).init();

    let (Some(file_path), Some(offset), Some(size)) = (
        matches.get_one::<String>("body"),
        matches.get_one::<u64>("offset"),
        matches.get_one::<u64>("size"),
    ) else {
        error!("--body, --offset and --size are required");
        return;
    };
    let auto = String::from("auto");
    let format = matches.get_one::<String>("format").unwrap_or(&auto);
    let password = matches.get_one::<String>("password").map(String::as_str);
    let show_header = matches.get_flag("header");
    let show_metadata = matches.get_flag("metadata");
    let show_info = matches.get_flag("info");
    let json_output = matches.get_flag("json");
    let dump_path = matches.get_one::<String>("dump");

    let mut body = Body::new(file_path.to_owned(), format);
    debug!("Created Body from '{}'", file_path);

    let volume_size = *size * body.get_sector_size() as u64;
    let mut slice = match BodySlice::new(&mut body, *offset, volume_size) {
        Ok(sl) => sl,
        Err(e) => {
            error!("Could not create BodySlice: {}", e);
            return;
        }
    };

    let mut parser = BitlockerParser::new();
    let unlocked = parser.initialize(&mut slice, 0, password);
    match &unlocked {
        Ok(()) => info!(
            "Volume unlocked: {} with {} byte sectors",
            parser.encryption_type(),
            parser.sector_size()
        ),
        Err(BitlockerError::NotBitlocker) => {
            error!("No BitLocker volume found at offset 0x{:X}", offset);
            return;
        }
        Err(e) => error!("Could not unlock the volume ({}): {}", e.status(), e),
    }

    if show_header {
        if json_output {
            let headers = json!({
                "volume_header": parser.volume_header().map(|h| h.to_json()),
                "block_header": parser.block_header().map(|h| h.to_json()),
                "metadata_header": parser.metadata_header().map(|h| h.to_json()),
            });
            print_json(&headers, "headers");
        } else {
            if let Some(h) = parser.volume_header() {
                println!("{}", h.to_string());
            }
            if let Some(h) = parser.block_header() {
                println!("{}", h.to_string());
            }
            if let Some(h) = parser.metadata_header() {
                println!("{}", h.to_string());
            }
        }
    }

    if show_metadata {
        if json_output {
            let arr: Vec<Value> = parser
                .metadata_entries()
                .iter()
                .map(|e| e.to_json())
                .collect();
            print_json(&json!({ "metadata_entries": arr }), "metadata entries");
        } else {
            println!("{}", entries_to_string(parser.metadata_entries()));
        }
    }

    if show_info {
        if json_output {
            print_json(&parser.to_json(), "volume information");
        } else {
            println!("{}", parser.to_string());
        }
    }

    if let Some(path) = dump_path {
        if unlocked.is_err() {
            error!("Cannot dump a locked volume");
            return;
        }
        let mut volume = match BitlockerVolume::new(&mut slice, parser, Some(volume_size)) {
            Ok(v) => v,
            Err(e) => {
                error!("Could not open the decrypted volume: {}", e);
                return;
            }
        };
        let mut out = match File::create(path) {
            Ok(f) => BufWriter::new(f),
            Err(e) => {
                error!("Cannot create {}: {}", path, e);
                return;
            }
        };
        match io::copy(&mut volume, &mut out) {
            Ok(n) => println!("Dumped {} bytes to {}", n, path),
            Err(e) => error!("Dump failed: {}", e),
        }
    }
}
