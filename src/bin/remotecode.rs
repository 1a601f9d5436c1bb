//! Daemon entry point.

use remotecode::config::Config;

fn main() {
    let code = run();
    std::process::exit(i32::from(code));
}

fn run() -> u8 {
    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("remotecode: {err}");
            eprintln!("Create ~/.remotecode/config with TELEGRAM_BOT_TOKEN and REMOTECODE_ALLOWED_USERS.");
            return remotecode::daemon::EXIT_SETUP;
        }
    };

    if let Err(err) = remotecode::observability::init(config.log_file(), config.verbose) {
        eprintln!("remotecode: log setup failed ({err}), logging to stderr");
        remotecode::observability::init_stderr(config.verbose);
    }

    tracing::info!(version = remotecode::VERSION, "starting remotecode");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("remotecode: runtime setup failed: {err}");
            return remotecode::daemon::EXIT_SETUP;
        }
    };

    runtime.block_on(remotecode::daemon::run(config))
}
