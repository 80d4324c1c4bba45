//! Version stamping for `avscan --version`

use std::env;
use std::process::Command;

/// `git describe` of the source tree, suffixed `-dirty` with uncommitted edits
fn source_revision() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--always", "--dirty", "--abbrev=10"])
        .current_dir(env::var_os("CARGO_MANIFEST_DIR")?)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let revision = String::from_utf8(output.stdout).ok()?;
    let revision = revision.trim();
    (!revision.is_empty()).then(|| revision.to_string())
}

fn stamp(key: &str, value: &str) {
    println!("cargo:rustc-env=AVSCAN_{key}={value}");
}

fn main() {
    let revision = source_revision().unwrap_or_else(|| "unreleased".to_string());
    let target = env::var("TARGET").unwrap_or_default();
    let profile = env::var("PROFILE").unwrap_or_default();

    stamp("REVISION", &revision);
    stamp("BUILD_TARGET", &format!("{target} {profile}"));
    stamp("BUILD_DATE", &chrono::Utc::now().format("%Y-%m-%d").to_string());

    // New commits, checkouts and staged edits change the revision
    for watched in ["../.git/HEAD", "../.git/index", "build.rs"] {
        println!("cargo:rerun-if-changed={watched}");
    }
}
