use log::{Level, LevelFilter, Log, Metadata, Record};

/// Minimal `log` backend writing to stderr. Library consumers that bring
/// their own logger simply never call `init()`.
pub struct Logger {
    level: Level,
}

impl Logger {
    pub fn init(level: Level) {
        let res = log::set_boxed_logger(Box::new(Self { level }));
        match res {
            Ok(_) => log::set_max_level(LevelFilter::Trace),
            Err(_) => log::trace!("logger already initialized"),
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn flush(&self) {}

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "{:8} {}:{} {}",
                record.metadata().level(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            );
        }
    }
}
