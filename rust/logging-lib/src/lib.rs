use clap::{Parser, ValueEnum};
use is_terminal::IsTerminal;
use tracing::{Dispatch, dispatcher};
use tracing_log::AsLog;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
pub struct LoggingOpts {
    #[clap(long, env = "PARCELPORT_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    #[clap(long, env = "PARCELPORT_LOG_COLOR", default_value = "auto")]
    pub log_color: LogColor,

    /// Extra directives in the RUST_LOG format, e.g. `parcelport_lib=debug`.
    /// RUST_LOG wins when both set a level for the same target.
    #[clap(long)]
    pub log_directives: Option<String>,
}

impl Default for LoggingOpts {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Text,
            log_color: LogColor::Auto,
            log_directives: None,
        }
    }
}

fn build_dispatch(opts: &LoggingOpts) -> Result<Dispatch, anyhow::Error> {
    let color = match opts.log_color {
        LogColor::Auto => std::io::stderr().is_terminal(),
        LogColor::Always => true,
        LogColor::Never => false,
    };

    let mut log_filter_builder = EnvFilter::builder();
    if let Some(directives) = &opts.log_directives {
        log_filter_builder =
            log_filter_builder.with_default_directive(directives.parse()?);
    }
    let log_filter = log_filter_builder.from_env_lossy();
    let builder = tracing_subscriber::fmt().with_env_filter(log_filter);

    #[cfg(test)]
    let builder = builder.with_test_writer();

    #[cfg(not(test))]
    let builder = builder.with_writer(std::io::stderr);

    let dispatch: Dispatch = match opts.log_format {
        LogFormat::Text => builder.with_ansi(color).finish().into(),
        LogFormat::Json => builder.json().finish().into(),
    };
    Ok(dispatch)
}

pub fn init(opts: &LoggingOpts) -> Result<(), anyhow::Error> {
    dispatcher::set_global_default(build_dispatch(opts)?)?;

    // Must run after the global default is set to pick up its max level hint.
    tracing_log::LogTracer::builder()
        .with_max_level(tracing_core::LevelFilter::current().as_log())
        .init()?;
    Ok(())
}

/// Installs a text subscriber for tests. Repeated calls are no-ops.
pub fn init_for_tests() {
    let opts = LoggingOpts { log_color: LogColor::Never, ..Default::default() };
    if let Ok(dispatch) = build_dispatch(&opts) {
        let _ = dispatcher::set_global_default(dispatch);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogColor {
    Auto,
    Always,
    Never,
}
