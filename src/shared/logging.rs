use std::path::Path;
use tracing::{error, info};
use tracing_appender::non_blocking;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize full logging for the server (file + console).
///
/// Returns `Ok(false)` when a global subscriber was already installed, in
/// which case the existing one keeps receiving events.
pub fn init_service_logging(log_dir: &str, service_name: &str) -> Result<bool, anyhow::Error> {
    // Set up environment filter (can be controlled via RUST_LOG env var)
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Check if we can write to the log directory
    let can_write_logs = std::fs::create_dir_all(log_dir)
        .and_then(|_| std::fs::File::create(format!("{log_dir}/.test_write")))
        .map(|_| std::fs::remove_file(format!("{log_dir}/.test_write")))
        .is_ok();

    if can_write_logs {
        use tracing_appender::rolling;

        let _ = rotate_logs_on_startup(log_dir, service_name);

        // Set up file appender with daily rotation
        let file_appender = rolling::daily(log_dir, format!("{service_name}.log"));
        let (non_blocking_file, guard_file) = non_blocking(file_appender);

        let file_layer = fmt::layer()
            .with_writer(non_blocking_file)
            .with_ansi(false) // No colors in file logs
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true);

        let console_layer = fmt::layer()
            .with_ansi(true) // Colors for console
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(false);

        let installed = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init()
            .is_ok();

        if !installed {
            return Ok(false);
        }

        // Keep the writer alive for the entire program duration
        std::mem::forget(guard_file);

        info!("Logging initialized - logs will be written to {log_dir}/{service_name}.log");
    } else {
        let console_layer = fmt::layer()
            .with_ansi(true)
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(false);

        let installed = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init()
            .is_ok();

        if !installed {
            return Ok(false);
        }

        info!("Logging initialized - console output only (could not create log directory)");
    }

    Ok(true)
}

pub fn rotate_logs_on_startup(log_dir: &str, service_name: &str) -> Result<(), anyhow::Error> {
    let log_file = format!("{log_dir}/{service_name}.log");
    let log_path = Path::new(&log_file);

    if log_path.exists() {
        // Create backup with timestamp
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup_file = format!("{log_dir}/{service_name}.{timestamp}.log");

        std::fs::rename(&log_file, &backup_file)?;
        info!("Previous log file backed up to: {backup_file}");
    }

    Ok(())
}

/// Emit the single fatal entry for an error that escaped to the top.
pub fn log_fatal(err: &anyhow::Error) {
    error!(severity = "FATAL", error = ?err, "Unhandled failure, terminating: {:#}", err);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_moves_previous_log_aside() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().to_str().unwrap();
        std::fs::write(dir.path().join("svc.log"), "old").unwrap();

        rotate_logs_on_startup(log_dir, "svc").unwrap();

        assert!(!dir.path().join("svc.log").exists());
        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with("svc.") && name.ends_with(".log"))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn test_rotate_without_existing_log_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        rotate_logs_on_startup(dir.path().to_str().unwrap(), "svc").unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
