use std::process::Command;

fn main() {
    // version string for `voxtask --version` logs; builds outside git fall back to "unknown"
    let git_hash = Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|hash| hash.trim().to_string())
        .filter(|hash| !hash.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=GIT_HASH={}", git_hash);
    println!("cargo:rerun-if-changed=build.rs");

    for (tool, arg) in [("ffmpeg", "-version"), ("yt-dlp", "--version")] {
        let found = Command::new(tool)
            .arg(arg)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false);
        if !found {
            println!("cargo:warning={} not found in PATH, related task types will be unavailable", tool);
        }
    }
}
