/// 检测系统 (Detection System)
///
/// 纯函数: 帧 → (单只蜜蜂, 蜂群斑块)
/// - blob:        显著性 → 模糊 → 二值化 → 轮廓 → 椭圆
/// - ellipse_fit: 轮廓二阶矩椭圆拟合
/// - merge:       近邻椭圆合并
pub mod blob;
pub mod ellipse_fit;
pub mod merge;
pub mod types;

pub use blob::{detect_bees, DetectionParams};
pub use types::{BlobDetections, Ellipse};
