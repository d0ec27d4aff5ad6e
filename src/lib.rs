pub mod cell;
pub mod cli;
pub mod columns;
pub mod error;
pub mod hooks;
pub mod identity;
pub mod importer;
pub mod mapping;
pub mod progress;
pub mod reconcile;
pub mod sheet;
pub mod store;
pub mod table;
pub mod template;
pub mod terms;

use std::{
    env,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use anyhow::{Context, Result};
use clap::Parser;
use itertools::Itertools;
use log::{LevelFilter, debug, info};

use crate::{
    cli::{Cli, ColumnsArgs, Commands, HistoryArgs, ImportArgs, ProgressArgs, TargetArgs},
    columns::ColumnRefs,
    hooks::{CellAddress, FilterHooks},
    identity::FileIdentityIndex,
    importer::{Importer, ProcessingOverrides},
    mapping::Mapping,
    progress::{FileTransientStore, Outcome, ProgressLog},
    sheet::{SheetReader, resolve_encoding},
    store::JsonRecordStore,
    table::Table,
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("sheet_importer", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Import(args) => handle_import(&args),
        Commands::Progress(args) => handle_progress(&args),
        Commands::History(args) => handle_history(&args),
        Commands::Columns(args) => handle_columns(&args),
    }
}

struct StatePaths {
    records: PathBuf,
    identities: PathBuf,
    progress: PathBuf,
    uploads: PathBuf,
}

impl StatePaths {
    fn new(dir: &Path) -> Self {
        Self {
            records: dir.join("records.json"),
            identities: dir.join("identities.bin"),
            progress: dir.join("progress"),
            uploads: dir.join("uploads"),
        }
    }
}

fn open_importer(
    target: &TargetArgs,
    mapping: Mapping,
) -> Result<Importer<JsonRecordStore, FileIdentityIndex>> {
    let paths = StatePaths::new(&target.state_dir);
    let store = JsonRecordStore::open(&paths.records)
        .with_context(|| format!("Opening record store {:?}", paths.records))?;
    let identities = FileIdentityIndex::open(&paths.identities)
        .with_context(|| format!("Opening identity index {:?}", paths.identities))?;
    let progress = Arc::new(FileTransientStore::new(paths.progress));
    let mut importer = Importer::new(mapping, store, identities, progress, paths.uploads)
        .with_slug(&target.slug)
        .with_principal(target.principal.clone());
    if let Some(kind) = &target.kind {
        importer = importer.with_kind(kind.clone());
    }
    Ok(importer)
}

fn build_hooks(args: &ImportArgs) -> Result<FilterHooks> {
    let mut hooks = FilterHooks::new();
    for raw in &args.cell_filters {
        let (address, expression) =
            cli::split_cell_filter(raw).map_err(|message| anyhow::anyhow!(message))?;
        let address = CellAddress::parse(address);
        debug!("Cell filter on {address}: {expression}");
        hooks.on_cell_expression(address, expression);
    }
    if let Some(guard) = &args.row_guard {
        hooks.on_row_guard(guard);
    }
    Ok(hooks)
}

fn handle_import(args: &ImportArgs) -> Result<()> {
    let mapping = Mapping::load(&args.mapping)
        .with_context(|| format!("Loading mapping from {:?}", args.mapping))?;
    let encoding = resolve_encoding(args.input_encoding.as_deref())?;
    let mut importer = open_importer(&args.target, mapping)?
        .with_hooks(build_hooks(args)?)
        .with_structured_fields(args.structured_fields)
        .with_delimiter(args.delimiter)
        .with_encoding(encoding);
    for name in &args.classifications {
        importer
            .store_mut()
            .register_classification(name.clone())
            .with_context(|| format!("Registering classification '{name}'"))?;
    }

    let overrides = ProcessingOverrides {
        header_row: args.header_row,
        force_publish: args.force_publish.then_some(true),
        append_terms: args.append_terms.then_some(true),
    };
    info!(
        "Importing '{}' with mapping '{}'",
        args.input.display(),
        args.mapping.display()
    );
    let log = importer
        .run(Some(&args.input), &overrides)
        .with_context(|| format!("Importing {:?}", args.input))?;
    print_summary(&log);
    Ok(())
}

fn handle_progress(args: &ProgressArgs) -> Result<()> {
    let importer = open_importer(&args.target, Mapping::new())?;
    let log = importer.read_progress().context("Reading progress log")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&log)?);
    } else {
        print_summary(&log);
    }
    Ok(())
}

fn handle_history(args: &HistoryArgs) -> Result<()> {
    let importer = open_importer(&args.target, Mapping::new())?;
    let uploads = importer.history();
    if uploads.is_empty() {
        info!("No uploads recorded for {}", importer.tag());
        return Ok(());
    }
    let mut table = Table::new(["Date", "File", "Status", "Inserted", "Updated"]);
    for upload in &uploads {
        table.push([
            upload.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            upload.file_name.clone(),
            status_label(&upload.log),
            upload.log.count(Outcome::Inserted).to_string(),
            upload.log.count(Outcome::Updated).to_string(),
        ]);
    }
    table.print();

    if args.detailed {
        for upload in &uploads {
            println!();
            println!("{} ({})", upload.file_name, upload.id);
            if let Some(message) = &upload.log.error_message {
                println!("  error: {message}");
            }
            for (id, outcome) in &upload.log.posts {
                println!("  record {id}: {outcome}");
            }
        }
    }
    Ok(())
}

fn handle_columns(args: &ColumnsArgs) -> Result<()> {
    let encoding = resolve_encoding(args.input_encoding.as_deref())?;
    let reader = SheetReader::open(&args.input, args.delimiter, encoding)
        .with_context(|| format!("Opening {:?}", args.input))?;
    let header_index = args.header_row.max(1) - 1;
    let header = reader
        .row_at(header_index)?
        .with_context(|| format!("Row {} not found in {:?}", args.header_row, args.input))?;
    let refs = ColumnRefs::from_header(&header);

    let mut table = Table::new(["#", "Code", "Slug", "Header"]);
    for (index, cell) in header.iter().enumerate() {
        table.push([
            (index + 1).to_string(),
            refs.code(index).unwrap_or_default().to_string(),
            refs.slug(index).unwrap_or_default().to_string(),
            cell.to_string(),
        ]);
    }
    table.print();
    Ok(())
}

fn status_label(log: &ProgressLog) -> String {
    log.status
        .map_or_else(|| "none".to_string(), |status| status.to_string())
}

fn print_summary(log: &ProgressLog) {
    println!("status: {}", status_label(log));
    println!("processed: {}/{}", log.processed, log.total);
    if !log.posts.is_empty() {
        let outcomes = log
            .posts
            .iter()
            .map(|(id, outcome)| format!("{id}={outcome}"))
            .join(", ");
        println!("records: {outcomes}");
    }
    if let Some(path) = &log.stored_path {
        println!("stored: {path}");
    }
    if let Some(message) = &log.error_message {
        println!("error: {message}");
    }
}
