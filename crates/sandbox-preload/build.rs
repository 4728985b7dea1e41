// The preload image is started by execveat with no libc and no dynamic
// linker of its own, and must stay clear of wherever ld-linux later maps
// the real program.
fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    if os != "linux" || arch != "x86_64" {
        return;
    }

    for arg in [
        "-nostartfiles",
        "-nostdlib",
        "-static",
        "-no-pie",
        "-Wl,--build-id=none",
        "-Wl,-z,noexecstack",
        "-Wl,-Ttext-segment=0x600000000000",
    ] {
        println!("cargo:rustc-link-arg-bins={arg}");
    }
}
