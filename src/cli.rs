use clap::Parser;

/// Log verbosity, mapped onto a tracing env-filter directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "kioskd", about = "Digital-signage playback agent driving mpv")]
pub struct Cli {
    /// Path to the JSON config file
    #[arg(short = 'c', long, default_value = "config.json")]
    pub config: String,

    /// Log verbosity (RUST_LOG overrides this)
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Validate the config file and exit
    #[arg(long)]
    pub check_config: bool,
}
