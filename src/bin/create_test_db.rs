use std::path::Path;

use chrono::{Duration, Utc};
use power_outage_monitor::adapters::db::{
    insert_closed_outage, open_connection, run_migrations, schema_version,
};

fn main() {
    if let Err(error) = run() {
        eprintln!("failed to create test db: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut path = if cfg!(windows) {
        ".\\data\\power_cuts_test.db".to_string()
    } else {
        "./data/power_cuts_test.db".to_string()
    };
    let mut force = false;
    let mut seed = 0_u32;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "--path" => {
                let Some(value) = args.get(index + 1) else {
                    return Err("--path requires a value".to_string());
                };
                path = value.clone();
                index += 2;
            }
            "--seed" => {
                let Some(value) = args.get(index + 1) else {
                    return Err("--seed requires a value".to_string());
                };
                seed = value
                    .parse()
                    .map_err(|_| format!("--seed expects a count, got '{value}'"))?;
                index += 2;
            }
            "--force" => {
                force = true;
                index += 1;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                return Err(format!("unknown argument: {other}"));
            }
        }
    }

    let path_ref = Path::new(&path);
    if let Some(parent) = path_ref.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|error| format!("failed to create parent directory: {error}"))?;
    }

    if force && path_ref.exists() {
        std::fs::remove_file(path_ref)
            .map_err(|error| format!("failed to remove existing db file: {error}"))?;
    }

    let mut connection = open_connection(&path).map_err(|error| error.to_string())?;
    run_migrations(&mut connection).map_err(|error| error.to_string())?;
    let version = schema_version(&connection).map_err(|error| error.to_string())?;

    // One outage every 7 hours, lengths cycling from 1 to 45 minutes.
    let now = Utc::now();
    for index in 0..i64::from(seed) {
        let started_at = now - Duration::hours(7 * (index + 1));
        let ended_at = started_at + Duration::minutes(1 + (index * 11) % 45);
        insert_closed_outage(&connection, started_at, ended_at)
            .map_err(|error| error.to_string())?;
    }

    println!("created/updated test db at: {path}");
    println!("schema version: {version}");
    if seed > 0 {
        println!("seeded closed outages: {seed}");
    }
    Ok(())
}

fn print_help() {
    println!("create_test_db");
    println!();
    println!("Usage:");
    println!("  cargo run --bin create_test_db -- [--path <file>] [--force] [--seed <count>]");
    println!();
    println!("Options:");
    println!("  --path <file>    target sqlite file (default: ./data/power_cuts_test.db)");
    println!("  --force          delete existing file before creating");
    println!("  --seed <count>   insert <count> closed outages spread over the past days");
}
