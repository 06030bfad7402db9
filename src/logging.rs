use std::io::IsTerminal as _;

use anyhow::anyhow;
use tracing::Dispatch;
use tracing_subscriber::{filter::LevelFilter, fmt::MakeWriter, util::SubscriberInitExt as _};

use crate::config::{Config, LogFormat};

const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::INFO;

/// Resolved log output: the CLI level wins over `[logging]`, which wins over
/// the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
    pub ansi: bool,
}

impl LogSettings {
    pub fn resolve(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<Self> {
        let logging = config.logging.as_ref();
        let level = match cli_level_override.or_else(|| logging?.level.as_deref()) {
            Some(raw) => parse_level(raw)?,
            None => DEFAULT_LOG_LEVEL,
        };
        let format = logging
            .and_then(|logging| logging.format)
            .unwrap_or(LogFormat::Compact);

        Ok(Self {
            level,
            format,
            ansi: format != LogFormat::Json && std::io::stdout().is_terminal(),
        })
    }

    /// Builds the subscriber for these settings, writing through `writer`.
    pub fn dispatch<W>(&self, writer: W) -> Dispatch
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let builder = tracing_subscriber::fmt()
            .with_max_level(self.level)
            .with_ansi(self.ansi)
            .with_writer(writer);

        match self.format {
            LogFormat::Json => Dispatch::new(builder.json().finish()),
            LogFormat::Pretty => Dispatch::new(builder.pretty().finish()),
            LogFormat::Compact => Dispatch::new(builder.compact().with_target(false).finish()),
        }
    }
}

/// Installs the process-wide subscriber. Replay progress goes to stdout next
/// to the final summary.
pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    LogSettings::resolve(config, cli_level_override)?
        .dispatch(std::io::stdout)
        .try_init()
        .map_err(|err| anyhow!("install log subscriber: {err}"))
}

fn parse_level(raw: &str) -> anyhow::Result<LevelFilter> {
    raw.trim()
        .to_ascii_lowercase()
        .parse()
        .map_err(|_| anyhow!("unknown log level `{raw}` (use trace, debug, info, warn, error or off)"))
}
