use chrono::Utc;

fn main() {
    // Appended to the `--version` string.
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    println!("cargo:rustc-env=BUILD_TIMESTAMP={stamp}");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src/");
}
