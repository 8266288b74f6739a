use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use std::path::PathBuf;

use layerstore::config::Config;
use layerstore::{
    export_to_archive, import_from_archive, logging, Column, MeasurementFilter, MeasurementRecord,
    MeasurementStore, SortOrder,
};

enum Command {
    List {
        filter: MeasurementFilter,
        order: SortOrder,
        page: usize,
        page_size: Option<usize>,
    },
    Count(MeasurementFilter),
    Show(i64),
    Delete(i64),
    Distinct(Column),
    Export {
        filter: MeasurementFilter,
        out: Option<PathBuf>,
    },
    Import(PathBuf),
}

struct Cli {
    config_path: Option<PathBuf>,
    command: Command,
}

fn parse_args() -> Result<Cli> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config_path = None;
    let mut rest = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("layerstore {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                config_path = Some(PathBuf::from(value_of(&args, i)?));
                i += 1;
            }
            _ => rest.push(args[i].clone()),
        }
        i += 1;
    }

    let Some((name, options)) = rest.split_first() else {
        print_help();
        std::process::exit(1);
    };

    let command = match name.as_str() {
        "list" => {
            let mut order_by = String::new();
            let mut order_dir = String::new();
            let mut page: usize = 1;
            let mut page_size: Option<usize> = None;
            let filter = parse_filter(options, |flag, value| {
                match flag {
                    "--sort" => order_by = value.to_string(),
                    "--dir" => order_dir = value.to_string(),
                    "--page-num" => page = value.parse().context("--page-num expects a number")?,
                    "--page-size" => {
                        page_size = Some(value.parse().context("--page-size expects a number")?)
                    }
                    _ => return Ok(false),
                }
                Ok(true)
            })?;
            Command::List {
                filter,
                order: SortOrder::parse(&order_by, &order_dir),
                page,
                page_size,
            }
        }
        "count" => Command::Count(parse_filter(options, |_, _| Ok(false))?),
        "show" => Command::Show(parse_id(options)?),
        "delete" => Command::Delete(parse_id(options)?),
        "distinct" => {
            let column = options.first().context("distinct requires a column name")?;
            match Column::from_name(column) {
                Some(column) => Command::Distinct(column),
                None => bail!("Unknown column: {column}"),
            }
        }
        "export" => {
            let mut out = None;
            let filter = parse_filter(options, |flag, value| {
                if flag == "--out" {
                    out = Some(PathBuf::from(value));
                    return Ok(true);
                }
                Ok(false)
            })?;
            Command::Export { filter, out }
        }
        "import" => {
            let path = options.first().context("import requires an archive path")?;
            Command::Import(PathBuf::from(path))
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    };

    Ok(Cli {
        config_path,
        command,
    })
}

fn value_of(args: &[String], i: usize) -> Result<&str> {
    match args.get(i + 1) {
        Some(value) => Ok(value),
        None => bail!("{} requires a value", args[i]),
    }
}

/// Parse filter flags, handing any other `--flag value` pair to `extra`,
/// which returns whether it consumed it.
fn parse_filter(
    args: &[String],
    mut extra: impl FnMut(&str, &str) -> Result<bool>,
) -> Result<MeasurementFilter> {
    let mut filter = MeasurementFilter::default();
    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        let value = value_of(args, i)?;
        match flag {
            "--name" => filter.name = Some(value.to_string()),
            "--note" => filter.note = Some(value.to_string()),
            "--shelf" => filter.shelf = Some(value.to_string()),
            "--book" => filter.book = Some(value.to_string()),
            "--page" => filter.page = Some(value.to_string()),
            "--from" => filter.start_date = Some(parse_date(value)?),
            "--to" => filter.end_date = Some(parse_date(value)?),
            _ => {
                if !extra(flag, value)? {
                    bail!("Unknown option: {flag}");
                }
            }
        }
        i += 2;
    }
    Ok(filter)
}

fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid date {value:?}, expected YYYY-MM-DD"))
}

fn parse_id(args: &[String]) -> Result<i64> {
    let id = args.first().context("a measurement id is required")?;
    id.parse().with_context(|| format!("Invalid id: {id}"))
}

fn print_help() {
    println!(
        r#"layerstore - layer thickness measurement store

USAGE:
    layerstore [--config PATH] <COMMAND> [ARGS]

COMMANDS:
    list [FILTERS] [--sort COLUMN] [--dir asc|desc] [--page-num N] [--page-size N]
    count [FILTERS]
    show ID
    delete ID
    distinct COLUMN
    export [FILTERS] [--out DIR]
    import ARCHIVE

FILTERS:
    --name TEXT       Name contains TEXT (case-insensitive)
    --note TEXT       Note contains TEXT (case-insensitive)
    --shelf SHELF     Material shelf
    --book BOOK       Material book
    --page PAGE       Material page
    --from DATE       On or after DATE (YYYY-MM-DD)
    --to DATE         On or before DATE (YYYY-MM-DD)

COLUMNS:
    id, Date, Name, Layer, Wavelength, Shelf, Book, Page, Note

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    LAYERSTORE_LOG      Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/layerstore/config.toml"#
    );
}

fn print_record(record: &MeasurementRecord) {
    println!(
        "{}\t{}\t{}\t{:.2} nm\t{}\t{}/{}/{}\t{}",
        record.id,
        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
        record.name.as_deref().unwrap_or("-"),
        record.thickness,
        record
            .wavelength
            .map(|w| format!("{w} nm"))
            .unwrap_or_else(|| "-".to_string()),
        record.shelf,
        record.book,
        record.page,
        record.note.as_deref().unwrap_or(""),
    );
}

fn main() -> Result<()> {
    let cli = parse_args()?;

    let _log_guard = match logging::init(Some(Config::config_dir().join("logs"))) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Logging disabled: {e:#}");
            None
        }
    };

    let config = match &cli.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let store = MeasurementStore::open(config.db_path())
        .with_context(|| format!("Failed to open database {}", config.db_path().display()))?;

    match cli.command {
        Command::List {
            filter,
            order,
            page,
            page_size,
        } => {
            let page_size = page_size.unwrap_or(config.history.page_size);
            let total = store.count(&filter);
            for record in store.query(&filter, order, page, page_size) {
                print_record(&record);
            }
            let pages = (total as usize).div_ceil(page_size.max(1));
            println!("page {} of {} ({} measurements)", page.max(1), pages.max(1), total);
        }
        Command::Count(filter) => println!("{}", store.count(&filter)),
        Command::Show(id) => match store.get(id) {
            Some(record) => {
                print_record(&record);
                println!("reference image: {}", record.ref_image);
                println!("material image:  {}", record.mat_image);
            }
            None => bail!("No measurement with id {id}"),
        },
        Command::Delete(id) => {
            if !store.delete(id) {
                bail!("No measurement with id {id}");
            }
            println!("Deleted measurement {id}");
        }
        Command::Distinct(column) => {
            for value in store.distinct(column) {
                println!("{value}");
            }
        }
        Command::Export { filter, out } => {
            let target = out.unwrap_or_else(|| config.export.directory.clone());
            match export_to_archive(&store, &filter, &target)? {
                Some(path) => println!("Exported to {}", path.display()),
                None => println!("No measurements match; nothing exported"),
            }
        }
        Command::Import(path) => {
            let summary = import_from_archive(&store, &path);
            for failure in &summary.failures {
                eprintln!("line {}: {}", failure.line, failure.reason);
            }
            println!(
                "Imported {} measurements, {} failed",
                summary.succeeded, summary.failed
            );
        }
    }

    Ok(())
}
