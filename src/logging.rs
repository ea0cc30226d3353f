use anyhow::anyhow;
use tracing::Subscriber;
use tracing_subscriber::{filter::LevelFilter, fmt::MakeWriter};

use crate::config::{Config, LogFormat};

/// Level and format after applying the CLI override on top of the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Json,
        }
    }
}

impl LogSettings {
    /// CLI override first, then `[logging]`, then info-level JSON.
    pub fn resolve(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let logging = config.logging.as_ref();

        let raw_level =
            cli_level_override.or_else(|| logging.and_then(|logging| logging.level.as_deref()));
        let level = match raw_level {
            Some(raw) => raw
                .trim()
                .to_ascii_lowercase()
                .parse::<LevelFilter>()
                .map_err(|_| {
                    anyhow!(
                        "invalid log level `{raw}`; expected trace, debug, info, warn, error or off"
                    )
                })?,
            None => defaults.level,
        };
        let format = logging
            .and_then(|logging| logging.format)
            .unwrap_or(defaults.format);

        Ok(Self { level, format })
    }

    /// A subscriber writing storage events to `writer` in the configured format.
    pub fn subscriber<W>(self, writer: W) -> Box<dyn Subscriber + Send + Sync>
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let builder = tracing_subscriber::fmt()
            .with_max_level(self.level)
            .with_target(true)
            .with_writer(writer);
        match self.format {
            LogFormat::Json => Box::new(builder.json().finish()),
            LogFormat::Pretty => Box::new(builder.pretty().finish()),
        }
    }
}

/// Installs the global subscriber. Logs go to stderr; stdout belongs to command output.
pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let settings = LogSettings::resolve(config, cli_level_override)?;
    tracing::subscriber::set_global_default(settings.subscriber(std::io::stderr))
        .map_err(|err| anyhow!("initialize logging subscriber: {err}"))
}
