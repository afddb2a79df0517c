fn main() {
    if let Err(err) = power_outage_monitor::app::run_api() {
        eprintln!("api startup failed: {err}");
        std::process::exit(1);
    }
}
