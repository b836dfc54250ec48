// Rejects lint-suppression attributes in stackup sources and tests.
// Set CHECK_NO_ALLOW=0 to skip the scan locally.

use std::env;
use std::fs;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-env-changed=CHECK_NO_ALLOW");
    if env::var("CHECK_NO_ALLOW").is_ok_and(|value| value == "0") {
        return;
    }

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("manifest dir"));
    let mut pending: Vec<PathBuf> = ["src", "tests"]
        .iter()
        .map(|relative| manifest_dir.join(relative))
        .filter(|path| path.exists())
        .collect();

    let suppression = ["#[", "allow"].concat();
    let inner_suppression = ["#![", "allow"].concat();
    let mut offenders = Vec::new();

    while let Some(path) = pending.pop() {
        if path.is_dir() {
            println!("cargo:rerun-if-changed={}", path.display());
            for entry in fs::read_dir(&path).expect("read dir") {
                pending.push(entry.expect("dir entry").path());
            }
            continue;
        }

        if path.extension().is_none_or(|ext| ext != "rs") {
            continue;
        }

        let Ok(content) = fs::read_to_string(&path) else {
            continue;
        };
        for (index, line) in content.lines().enumerate() {
            if line.contains(&suppression) || line.contains(&inner_suppression) {
                offenders.push(format!("{}:{}: {}", path.display(), index + 1, line.trim()));
            }
        }
    }

    if offenders.is_empty() {
        return;
    }

    eprintln!("ERROR: lint suppression attributes found in stackup:");
    for offender in &offenders {
        eprintln!("  {offender}");
    }
    panic!("lint suppression attributes are forbidden");
}
