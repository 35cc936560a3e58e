/// 工具模块
/// Utility modules
pub mod affine_transform;
pub mod crop;

/// 文件名用的本地时间戳
pub fn gen_time_string() -> String {
    chrono::Local::now().format("%Y%m%d-%H%M%S").to_string()
}
