fn main() {
    if let Err(e) = carecall_lib::run() {
        log::error!("carecall failed: {e}");
        eprintln!("carecall failed: {e}");
        std::process::exit(1);
    }
}
