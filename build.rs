//! Build script for taskfold.
//!
//! Captures the compiler version so the worker can report it in its
//! version probe.

use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let version = Command::new(rustc)
        .arg("--version")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| {
            // "rustc 1.82.0 (f6e511eec 2024-10-15)"
            String::from_utf8_lossy(&o.stdout)
                .split_whitespace()
                .nth(1)
                .map(|v| v.split('-').next().unwrap_or(v).to_string())
        })
        .unwrap_or_else(|| "0.0.0".to_string());

    println!("cargo:rustc-env=TASKFOLD_RUSTC_VERSION={version}");
}
