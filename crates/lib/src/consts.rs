/// Application name used for default directory names.
pub const APP_NAME: &str = "cellar";

/// Environment variable overriding the orchestrator root directory.
pub const ROOT_ENV: &str = "CELLAR_ROOT";

/// Subdirectory of a keg holding staged private resources.
pub const VENDOR_DIR: &str = "libexec/vendor";

/// `SOURCE_DATE_EPOCH` exported to every build step.
/// 315532800 = January 1, 1980 00:00:00 UTC (ZIP epoch).
pub const SOURCE_DATE_EPOCH: &str = "315532800";

/// Version of the on-disk ledger record format.
pub const LEDGER_FORMAT_VERSION: u32 = 1;
