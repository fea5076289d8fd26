//! Build metadata generated by the build script

include!(concat!(env!("OUT_DIR"), "/version.rs"));

/// Version of the stream entry field schema this build reads and writes
pub fn wire_schema_version() -> u32 {
    WIRE_SCHEMA_VERSION.parse().unwrap_or(20250727)
}

/// Build time string from the build script (UTC)
pub fn build_time() -> &'static str {
    BUILD_TIME
}

/// Short git hash captured by the build script
pub fn git_hash() -> &'static str {
    GIT_HASH
}

/// One-line version banner used by `--version` and the startup log
pub fn version_banner() -> String {
    format!(
        "{} {} (schema {}, {} built {})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        wire_schema_version(),
        git_hash(),
        build_time()
    )
}
