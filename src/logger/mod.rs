// Import local time formatting tools from chrono
use chrono::Local;

// Set the global log level (e.g., Debug, Info, Warn, Error)
use log::LevelFilter;

// Set up the dispatch builder for combining logger outputs, and level colors for the console
use fern::Dispatch;
use fern::colors::{Color, ColoredLevelConfig};

// JSON handling for structured file output
use serde_json::Value as JsonValue;

// Standard I/O and filesystem operations (stdout, file creation)
use std::{fs, io};

// Used to initialize a static value only once in a thread-safe way
use std::sync::OnceLock;

// All user settings for logging
use crate::config::LoggerConfig;

/// A simple Logger struct that wraps logging functions.
/// Clonable to allow use across multiple threads/tasks.
#[derive(Clone, Debug, Default)]
pub struct Logger;

impl Logger {
    /// Logs a message at DEBUG level
    pub fn debug(&self, msg: &str) {
        log::debug!("{}", msg);
    }

    /// Logs a message at INFO level
    pub fn info(&self, msg: &str) {
        log::info!("{}", msg);
    }

    /// Logs a message at WARN level
    pub fn warn(&self, msg: &str) {
        log::warn!("{}", msg);
    }

    /// Logs a message at ERROR level
    pub fn error(&self, msg: &str) {
        log::error!("{}", msg);
    }
}

/// Static global LOGGER instance, initialized once
static LOGGER: OnceLock<Logger> = OnceLock::new();

/// `<dir>/<name>.log`, with dots in the name replaced so it stays one file name.
pub fn log_file_name(name: &str, dir: &str) -> String {
    let stem = name.replace('.', "_");
    if dir.is_empty() {
        format!("{}.log", stem)
    } else {
        format!("{}/{}.log", dir.trim_end_matches('/'), stem)
    }
}

/// Initialize the global logger exactly once, according to the provided settings.
/// After this call, all calls to `log::debug!(), info!(), warn!(), error!()` (and your
/// `Logger` methods) will go through the configured fern dispatcher.
pub fn init_logger(name: &str, cfg: &LoggerConfig) -> Logger {
    LOGGER
        .get_or_init(|| {
            // ────────────────────────────────────────────────────────────────
            // 1) Parse the configured level string into a log::LevelFilter
            //    If parsing fails, we default to Info.
            // ────────────────────────────────────────────────────────────────
            let level = cfg
                .log_level
                .parse::<LevelFilter>()
                .unwrap_or(LevelFilter::Info);

            // ────────────────────────────────────────────────────────────────
            // 2) Build the base fern::Dispatch with the global minimum level
            // ────────────────────────────────────────────────────────────────
            let mut base = Dispatch::new().level(level);

            // ────────────────────────────────────────────────────────────────
            // 3) Console branch: timestamp, name, colored level, message
            // ────────────────────────────────────────────────────────────────
            if cfg.enable_console_log {
                let nm = name.to_string();
                let datefmt = cfg.date_format.clone();
                let colors = ColoredLevelConfig::new()
                    .info(Color::Green)
                    .warn(Color::Yellow)
                    .error(Color::Red)
                    .debug(Color::Blue)
                    .trace(Color::Magenta);

                let log_format_console = move |out: fern::FormatCallback, message: &std::fmt::Arguments, record: &log::Record| {
                    out.finish(format_args!(
                        "\x1b[92m{}\x1b[0m - \x1b[94m{}\x1b[0m - {} - {}",
                        Local::now().format(&datefmt),
                        nm,
                        colors.color(record.level()),
                        message
                    ))
                };

                base = base.chain(
                    Dispatch::new()
                        .format(log_format_console)
                        .chain(io::stdout()),
                );
            }

            // ────────────────────────────────────────────────────────────────
            // 4) File branch: structured JSON or plain text lines
            //    written to "<log_file_path>/<name>.log"
            // ────────────────────────────────────────────────────────────────
            if cfg.enable_file_log {
                // Ensure the directory exists (no-op if empty or already present)
                if !cfg.log_file_path.is_empty() {
                    let _ = fs::create_dir_all(&cfg.log_file_path);
                }

                let nm = name.to_string();
                let datefmt = cfg.date_format.clone();
                let enable_json = cfg.enable_json_log;
                let filepath = log_file_name(name, &cfg.log_file_path);

                let log_format_file = move |out: fern::FormatCallback, message: &std::fmt::Arguments, record: &log::Record| {
                    if enable_json {
                        // Messages that are already JSON are embedded as objects
                        let raw = message.to_string();
                        let message_json: JsonValue =
                            serde_json::from_str(&raw).unwrap_or(JsonValue::String(raw));

                        let envelope = serde_json::json!({
                            "timestamp": Local::now().format(&datefmt).to_string(),
                            "name":      nm,
                            "level":     record.level().to_string(),
                            "target":    record.target(),
                            "message":   message_json
                        });

                        out.finish(format_args!("{}", envelope))
                    } else {
                        out.finish(format_args!(
                            "{} - {} - {} - {}",
                            Local::now().format(&datefmt),
                            nm,
                            record.level(),
                            message
                        ))
                    }
                };

                // Attempt to open the logfile, but don't panic: fall back to a sink on error
                let file_output: Box<dyn io::Write + Send> = match fern::log_file(&filepath) {
                    Ok(fh) => Box::new(fh),
                    Err(err) => {
                        eprintln!("Warning: could not open log file {}: {}", filepath, err);
                        Box::new(io::sink())
                    }
                };

                base = base.chain(
                    Dispatch::new()
                        .format(log_format_file)
                        .chain(file_output),
                );
            }

            // ────────────────────────────────────────────────────────────────
            // 5) Apply the composed dispatcher as the global logger.
            //    If something else already installed one, keep going with it.
            // ────────────────────────────────────────────────────────────────
            if let Err(err) = base.apply() {
                eprintln!("Warning: logger already initialized: {}", err);
            }

            Logger
        })
        .clone()
}
