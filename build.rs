use std::env;
use std::fs;
use std::path::{Path, PathBuf};

fn main() {
    // Copy templates and config to the target directory
    copy_templates();
    copy_config();
}

/// Returns target/release (or target/debug) from OUT_DIR.
fn target_dir() -> Option<PathBuf> {
    let out_dir = env::var("OUT_DIR").ok()?;
    // OUT_DIR is something like target/release/build/joinsim-xxx/out
    Path::new(&out_dir).ancestors().nth(3).map(Path::to_path_buf)
}

/// Copies the templates folder so the executable finds captured references.
fn copy_templates() {
    let Some(target_dir) = target_dir() else {
        return;
    };
    let template_src = Path::new("templates");
    if template_src.exists() {
        copy_dir_recursive(template_src, &target_dir.join("templates"));
        println!("cargo:rerun-if-changed=templates/");
    }
}

/// Recursively copies a directory and its contents.
fn copy_dir_recursive(src: &Path, dst: &Path) {
    let _ = fs::create_dir_all(dst);

    if let Ok(entries) = fs::read_dir(src) {
        for entry in entries.flatten() {
            let src_path = entry.path();
            let dst_path = dst.join(entry.file_name());

            if src_path.is_dir() {
                copy_dir_recursive(&src_path, &dst_path);
            } else {
                let _ = fs::copy(&src_path, &dst_path);
            }
        }
    }
}

/// Copies config.json next to the executable.
fn copy_config() {
    let Some(target_dir) = target_dir() else {
        return;
    };
    let config_src = Path::new("config.json");
    if config_src.exists() {
        let _ = fs::copy(config_src, target_dir.join("config.json"));
        println!("cargo:rerun-if-changed=config.json");
    }
}
