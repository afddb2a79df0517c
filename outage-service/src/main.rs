fn main() {
    if let Err(err) = power_outage_monitor::app::run_service() {
        eprintln!("service startup failed: {err}");
        std::process::exit(1);
    }
}
