//!
//! Console logger for the command-line runner
//!

use env_logger::{Builder, Env};
use log::Log;

/// Filter used when neither `RUST_LOG` nor a configured filter is present
pub const DEFAULT_FILTER: &str = "info";

/// [log::Log] implementation wrapping [env_logger]
///
/// `RUST_LOG` takes priority over the filter given to [Logger::with_filter], so a configured
/// filter can be overridden for one run without editing the config file.
#[derive(Debug)]
pub struct Logger {
    logger: env_logger::Logger,
}
impl Logger {
    pub fn new() -> Self {
        Self::with_filter(DEFAULT_FILTER)
    }

    /// Filter events using the familiar [env_logger syntax]
    ///
    /// [env_logger syntax]: https://docs.rs/env_logger/latest/env_logger/index.html#enabling-logging
    pub fn with_filter(filter: impl AsRef<str>) -> Self {
        let env = Env::new().filter_or("RUST_LOG", filter.as_ref());
        Self {
            logger: Builder::from_env(env).format_timestamp_millis().build(),
        }
    }

    /// Most verbose level this logger lets through
    pub fn max_level(&self) -> log::LevelFilter {
        self.logger.filter()
    }

    /// Sets the [Logger] as global logger
    pub fn init(self) -> Result<(), log::SetLoggerError> {
        log::set_max_level(self.max_level());
        log::set_boxed_logger(Box::new(self))
    }
}
impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}
impl Log for Logger {
    #[inline]
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        self.logger.enabled(metadata)
    }

    #[inline]
    fn log(&self, record: &log::Record<'_>) {
        if self.logger.matches(record) {
            self.logger.log(record);
        }
    }

    #[inline]
    fn flush(&self) {
        self.logger.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_sets_the_ceiling() {
        // RUST_LOG overrides the configured filter
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }

        assert_eq!(Logger::with_filter("warn").max_level(), log::LevelFilter::Warn);
        assert_eq!(
            Logger::with_filter("info,inference_helper=trace").max_level(),
            log::LevelFilter::Trace
        );
        assert_eq!(Logger::new().max_level(), log::LevelFilter::Info);
    }
}
