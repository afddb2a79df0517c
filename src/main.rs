fn main() {
    if let Err(err) = power_outage_monitor::app::run() {
        eprintln!("application startup failed: {err}");
        std::process::exit(1);
    }
}
