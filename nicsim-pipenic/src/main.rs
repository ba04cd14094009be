use nicsim_core::multi::run_devices;
use nicsim_pipenic::PipeNic;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = run_devices(&argv, PipeNic::new) {
        error!(error = %e, "simulation failed");
        std::process::exit(1);
    }
}
