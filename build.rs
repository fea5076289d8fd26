use chrono::Utc;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

// Emits $OUT_DIR/version.rs with the wire schema version, build time and git hash
fn main() {
    let out_dir = PathBuf::from(env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo"));
    let manifest_dir =
        PathBuf::from(env::var_os("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR is set by cargo"));

    let schema = wire_schema_version(&manifest_dir.join("Cargo.toml"));
    let built = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let hash = git_short_hash().unwrap_or_else(|| "unknown".to_string());

    let generated = format!(
        "pub const WIRE_SCHEMA_VERSION: &str = {schema:?};\n\
         pub const BUILD_TIME: &str = {built:?};\n\
         pub const GIT_HASH: &str = {hash:?};\n"
    );
    fs::write(out_dir.join("version.rs"), generated).expect("write version.rs");

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-changed=.git/HEAD");
}

// [package.metadata] wire_schema_version
fn wire_schema_version(cargo_toml: &Path) -> String {
    fs::read_to_string(cargo_toml)
        .ok()
        .and_then(|text| text.parse::<toml::Table>().ok())
        .and_then(|manifest| {
            manifest
                .get("package")?
                .get("metadata")?
                .get("wire_schema_version")?
                .as_integer()
        })
        .map(|version| version.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn git_short_hash() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let hash = String::from_utf8(output.stdout).ok()?;
    Some(hash.trim().to_string())
}
