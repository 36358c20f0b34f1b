use std::io;
use std::sync::Once;

use tracing::Level;
use tracing_appender::rolling;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::MakeWriterExt;

static INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub enum OutputType {
    Stdout,

    /// Daily rolling file under `log_dir`, mirrored to stdout.
    File,
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub level: Level,
    pub output: OutputType,
    pub log_dir: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            level: Level::INFO,
            output: OutputType::Stdout,
            log_dir: "/tmp/maxbridge/logs".to_string(),
        }
    }
}

/// Install the global tracing subscriber. Safe to call more than once, only
/// the first call has an effect.
pub fn init_log(debug: bool) {
    let mut opts = LogOptions::default();
    if debug {
        opts.level = Level::DEBUG;
    }

    init_log_with_options(opts);
}

pub fn init_log_with_options(opts: LogOptions) {
    INIT.call_once(move || {
        let format = fmt::format()
            .with_file(true)
            .with_line_number(false)
            .with_target(false)
            .with_thread_ids(true)
            .with_thread_names(true)
            .compact();

        match opts.output {
            OutputType::Stdout => {
                let _ = tracing_subscriber::fmt()
                    .with_max_level(opts.level)
                    .event_format(format)
                    .try_init();
            }
            OutputType::File => {
                let file_appender = rolling::daily(opts.log_dir.as_str(), "maxbridge.log");
                let merge = file_appender.and(io::stdout);

                let _ = tracing_subscriber::fmt()
                    .with_max_level(opts.level)
                    .event_format(format)
                    .with_writer(merge)
                    .try_init();
            }
        }
    });
}
