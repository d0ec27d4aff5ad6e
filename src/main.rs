fn main() {
    if let Err(err) = sheet_importer::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
