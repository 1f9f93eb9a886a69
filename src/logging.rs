use log::LevelFilter;

/// Initialize env_logger, honouring `RUST_LOG` when set.
pub fn init_logger() {
    env_logger::Builder::from_default_env().init();
}

/// Initialize with an explicit verbosity, for the command line flags.
pub fn init_logger_with_level(level: LevelFilter) {
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}
