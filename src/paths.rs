use std::path::PathBuf;
use std::sync::OnceLock;

static EXE_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the directory containing the executable.
pub fn exe_dir() -> &'static PathBuf {
    EXE_DIR.get_or_init(|| {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."))
    })
}

/// Returns the logs directory: `<exe_dir>/logs/`
pub fn logs_dir() -> PathBuf {
    exe_dir().join("logs")
}

/// Returns the default template directory: `<exe_dir>/templates/`
pub fn templates_dir() -> PathBuf {
    exe_dir().join("templates")
}

/// Returns the config file path: `<exe_dir>/config.json`
pub fn config_path() -> PathBuf {
    exe_dir().join("config.json")
}

/// Ensures the log and template directories exist. Call at startup.
pub fn ensure_directories() -> std::io::Result<()> {
    std::fs::create_dir_all(logs_dir())?;
    std::fs::create_dir_all(templates_dir())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_share_exe_dir() {
        let base = exe_dir();
        assert_eq!(logs_dir(), base.join("logs"));
        assert_eq!(templates_dir().parent(), Some(base.as_path()));
        assert_eq!(config_path().file_name().and_then(|n| n.to_str()), Some("config.json"));
    }
}
