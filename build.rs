use std::process::Command;

fn git(args: &[&str]) -> Option<std::process::Output> {
    Command::new("git").args(args).output().ok()
}

fn git_text(args: &[&str]) -> String {
    git(args)
        .filter(|output| output.status.success())
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    let build_time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=BUILD_TIME={}", build_time);
    println!(
        "cargo:rustc-env=GIT_COMMIT_HASH={}",
        git_text(&["rev-parse", "--short", "HEAD"])
    );
    println!(
        "cargo:rustc-env=GIT_BRANCH={}",
        git_text(&["rev-parse", "--abbrev-ref", "HEAD"])
    );
    let dirty = match git(&["diff", "--quiet", "--ignore-submodules"]) {
        Some(output) => match output.status.code() {
            Some(0) => "clean",
            Some(1) => "dirty",
            _ => "unknown",
        },
        None => "unknown",
    };
    println!("cargo:rustc-env=GIT_DIRTY={}", dirty);

    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
}
