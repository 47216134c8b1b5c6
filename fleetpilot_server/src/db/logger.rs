use flexi_logger::{Age, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};

/// Initialize file logging with daily rotation. Level comes from `FLEET_LOG`.
pub fn init_logger() -> anyhow::Result<LoggerHandle> {
    let spec = std::env::var("FLEET_LOG").unwrap_or_else(|_| "info".to_string());

    let handle = Logger::try_with_str(&spec)?
        .log_to_file(
            FileSpec::default()
                .directory("logs")
                .basename("fleetpilot_server"),
        )
        .rotate(
            Criterion::Age(Age::Day),
            Naming::Numbers,
            Cleanup::KeepLogFiles(7),
        )
        .duplicate_to_stderr(Duplicate::Warn)
        .start()?;

    Ok(handle)
}
