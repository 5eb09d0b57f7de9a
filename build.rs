// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Result;
use std::process::Command;

fn main() -> Result<()> {
    // Compiled-rule images are only shared between processes of the same
    // build. The commit hash distinguishes builds of one version.
    let version = std::env::var("CARGO_PKG_VERSION")?;
    let commit = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let build_id = match commit.is_empty() {
        true => version,
        false => format!("{version}+{commit}"),
    };
    println!("cargo:rustc-env=RULEBASE_BUILD_ID={build_id}");
    println!("cargo:rerun-if-changed=.git/HEAD");

    Ok(())
}
