//! `log` crate backend.

use log::{LevelFilter, Metadata, Record};

static LOGGER: ExoLogger = ExoLogger;

/// Routes `log` records to the calling thread's log handle.
///
/// Records are formatted as `[LEVEL target] message` followed by a newline.
#[derive(Debug)]
pub struct ExoLogger;

impl log::Log for ExoLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Dropping the error: a truncated record is still written with its marker.
        let _ = crate::print(format_args!(
            "[{} {}] {}\n",
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {
        let _ = crate::flush();
    }
}

/// Installs [`ExoLogger`] as the process logger and sets the maximum level.
///
/// Can be called more than once; later calls only change the level.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
