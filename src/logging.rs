use flexi_logger::{
    detailed_format, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming,
};
use std::path::Path;

use crate::config::LoggingConfig;
use crate::error::ScError;

const LOG_BASENAME: &str = "livesc";
const ROTATE_BYTES: u64 = 10 * 1024 * 1024;
const KEEP_LOG_FILES: usize = 7;

/// Start logging to rotating files under `log_dir`, with warnings and errors
/// also going to stderr. The handle must be kept alive for the process lifetime.
pub fn init_logging(config: &LoggingConfig, log_dir: &Path) -> Result<LoggerHandle, ScError> {
    let handle = Logger::try_with_str(config.log_spec())?
        .log_to_file(
            FileSpec::default()
                .directory(log_dir)
                .basename(LOG_BASENAME),
        )
        .format_for_files(detailed_format)
        .duplicate_to_stderr(Duplicate::Warn)
        .rotate(
            Criterion::Size(ROTATE_BYTES),
            Naming::Timestamps,
            Cleanup::KeepLogFiles(KEEP_LOG_FILES),
        )
        .start()?;
    Ok(handle)
}
