//! quadrille entry point.

#[cfg(feature = "cli")]
fn main() {
    env_logger::init();
    if let Err(e) = quadrille::cli::run_cli() {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("quadrille was built without the 'cli' feature");
}
