use std::process::Command;

fn main() {
    // Docker builds pass the version in explicitly
    let version = std::env::var("GIT_VERSION").unwrap_or_else(|_| {
        Command::new("git")
            .args(["describe", "--tags", "--always", "--dirty"])
            .output()
            .ok()
            .and_then(|output| {
                if output.status.success() {
                    String::from_utf8(output.stdout).ok()
                } else {
                    None
                }
            })
            .map_or_else(
                || env!("CARGO_PKG_VERSION").to_string(),
                |s| s.trim().to_string(),
            )
    });

    println!("cargo:rustc-env=GIT_VERSION={version}");

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/tags");
    println!("cargo:rerun-if-env-changed=GIT_VERSION");
}
