// 构建脚本: 链接FFmpeg依赖库
fn main() {
    // 仅在启用 ffmpeg 特性且目标为 Windows MSVC 时添加FFmpeg相关库
    let ffmpeg = std::env::var_os("CARGO_FEATURE_FFMPEG").is_some();
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let target_env = std::env::var("CARGO_CFG_TARGET_ENV").unwrap_or_default();

    if ffmpeg && target_os == "windows" && target_env == "msvc" {
        // Intel QSV (Quick Sync Video) 硬件加速
        println!("cargo:rustc-link-lib=dylib=libmfx");

        // OLE 自动化和VFW (dshow 摄像头)
        println!("cargo:rustc-link-lib=dylib=oleaut32");
        println!("cargo:rustc-link-lib=dylib=vfw32");

        // Secure Channel (TLS/SSL)
        println!("cargo:rustc-link-lib=dylib=secur32");
    }
    println!("cargo:rerun-if-changed=build.rs");
}
