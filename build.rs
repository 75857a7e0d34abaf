/// Build script for unispeech
///
/// Only the Vosk backend (`vosk` feature, Linux) needs link configuration:
/// sets RPATH to $ORIGIN so the binary finds libvosk.so next to it, and adds
/// `VOSK_LIB_PATH` or a `vosk-lib/` directory to the library search path.
/// The Apple and Windows backends link system frameworks through their crates.

fn main() {
    // Re-run if these change
    println!("cargo:rerun-if-env-changed=VOSK_LIB_PATH");

    let vosk_enabled = std::env::var_os("CARGO_FEATURE_VOSK").is_some();
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if !vosk_enabled || target_os != "linux" {
        return;
    }

    println!("cargo:rustc-link-arg=-Wl,-rpath,$ORIGIN");

    if let Ok(vosk_path) = std::env::var("VOSK_LIB_PATH") {
        println!("cargo:rustc-link-search=native={}", vosk_path);
    }

    // Also check for vosk-lib directory in project root (default fetch location)
    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        let vosk_lib_dir = std::path::Path::new(&manifest_dir).join("vosk-lib");
        if vosk_lib_dir.exists() {
            println!("cargo:rustc-link-search=native={}", vosk_lib_dir.display());
        }
    }
}
