fn main() {
    println!("cargo:rerun-if-changed=linker-aarch64.ld");

    // The linker script only applies to the bare-metal target; host builds
    // (unit tests) link normally.
    let target = std::env::var("TARGET").unwrap_or_default();
    if target.starts_with("aarch64") && target.ends_with("none") {
        let dir = std::env::current_dir().unwrap();
        println!("cargo:rustc-link-search={}", dir.display());
        println!("cargo:rustc-link-arg=-Tlinker-aarch64.ld");
    }
}
