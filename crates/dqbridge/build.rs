// Cargo build script for the native engine shim
//
// When the "dqlite" feature is enabled, compile csrc/shim.c, which adapts
// the engine's variadic logger hook and its connect hook to the trampolines
// exported by this crate. Without the feature nothing native is built and
// the bridge runs against any `NativeEngine` implementation (e.g. the twin).

fn main() {
    #[cfg(feature = "dqlite")]
    build_shim();

    println!("cargo:rerun-if-changed=csrc/");
    println!("cargo:rerun-if-changed=csrc/shim.c");
}

#[cfg(feature = "dqlite")]
fn build_shim() {
    cc::Build::new()
        .file("csrc/shim.c")
        .warnings(true)
        .compile("dqbridge_shim");

    println!("cargo:rustc-link-lib=dqlite");
    println!("cargo:rustc-link-lib=sqlite3");
}
