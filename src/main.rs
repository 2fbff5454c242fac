//! joinsim
//!
//! Console entry point: loads config.json next to the executable, checks the
//! captured templates and runs one auto-join session.

use anyhow::Result;
use log::LevelFilter;
use std::io::BufRead;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use joinsim::automation::{AppConfig, JoinState, Session};
use joinsim::{logger, paths};

fn main() -> Result<ExitCode> {
    let logs_dir = paths::logs_dir();
    logger::install_panic_hook(&logs_dir);

    // Ensure output directories exist
    paths::ensure_directories()?;
    logger::init(&logs_dir, LevelFilter::Info);

    let config = AppConfig::load(&paths::config_path());
    log::info!(
        "joinsim {} (window '{}', threshold {:.2})",
        env!("CARGO_PKG_VERSION"),
        config.window_title,
        config.detection_threshold
    );

    let mut session = Session::new(config)?;
    if let Err(e) = session.preflight() {
        log::error!("Setup incomplete: {}", e);
        log::error!(
            "Capture the required templates into {} first.",
            session.config().templates_dir().display()
        );
        return Ok(ExitCode::FAILURE);
    }

    // Enter on the console stops the session
    let stop = Arc::new(AtomicBool::new(false));
    let stop_on_enter = Arc::clone(&stop);
    thread::spawn(move || {
        let mut line = String::new();
        // EOF means no console, keep running
        if matches!(std::io::stdin().lock().read_line(&mut line), Ok(n) if n > 0) {
            stop_on_enter.store(true, Ordering::SeqCst);
        }
    });

    log::info!("Auto-join started (press Enter to stop)");
    let info = session.run(stop);
    if let Some(err) = &info.last_error {
        log::info!("Last error: {}", err);
    }

    Ok(if info.state == JoinState::Success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
