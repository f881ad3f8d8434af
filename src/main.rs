fn main() {
    if let Err(err) = taxi_ingest::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
