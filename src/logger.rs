use tracing_subscriber::fmt;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::PkpdError;
use crate::settings::LogSettings;

/// Setup logging for the library
///
/// Installs a global `tracing` subscriber. The log level comes from [LogSettings] and defaults
/// to `info`. If `file` is set, messages are also written (without colours) to that file.
///
/// Calling this twice is not an error: the second call leaves the first subscriber in place.
pub fn setup_log(settings: &LogSettings) -> Result<(), PkpdError> {
    let env_filter = EnvFilter::new(settings.level.to_lowercase());

    let file_layer = match &settings.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)?;
            Some(
                fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    let stdout_layer = if settings.stdout {
        Some(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(true)
                .with_target(false),
        )
    } else {
        None
    };

    let result = Registry::default()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init();

    if result.is_err() {
        tracing::debug!("A global subscriber was already installed, keeping it");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_is_created() {
        let path = std::env::temp_dir().join("pkpdinfer_setup_log.txt");
        let settings = LogSettings {
            level: "DEBUG".to_string(),
            file: Some(path.to_string_lossy().into_owned()),
            stdout: false,
        };
        setup_log(&settings).unwrap();
        assert!(path.exists());
        // A second subscriber is silently ignored
        setup_log(&LogSettings::default()).unwrap();
        std::fs::remove_file(&path).unwrap();
    }
}
