use std::env;

fn main() {
    let target = env::var("TARGET").unwrap_or_default();
    if target.contains("windows") {
        panic!("weavert targets unix hosts (linux/macos); windows is not supported");
    }
    let mut build = cc::Build::new();
    if target.contains("apple") {
        if target.contains("aarch64") || target.contains("arm64") {
            build.file("weavectx_arm64_macos.asm");
        } else {
            build.file("weavectx_x86_64_macos.asm");
        }
    } else if target.contains("aarch64") || target.contains("arm64") {
        build.file("weavectx_arm64.asm");
    } else {
        build.file("weavectx_x86_64_sysv.asm");
    }
    build.flag("-x").flag("assembler");
    build.flag_if_supported("-Qunused-arguments");
    build.compile("weavectx");
}
