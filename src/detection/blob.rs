//! 蜜蜂斑块检测 (detect_bees)
//!
//! 帧 → (单只蜜蜂, 蜂群斑块):
//! 1. 显著性通道: 255 - (G - V), 8位回绕减法, V 为HSV明度
//! 2. 高斯模糊抑制纹理
//! 3. 二值化后取反得到前景掩码
//! 4. 提取外轮廓, ≥5点的轮廓拟合椭圆
//! 5. 按面积区间分类并缩放到跟踪坐标, 最后合并近邻的单只蜜蜂

use image::{GrayImage, Luma, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::filter::separable_filter_equal;

use crate::config::{MergeStrategy, PipelineConfig};

use super::ellipse_fit::fit_ellipse;
use super::merge::merge_nearby;
use super::types::BlobDetections;

/// 轴长下限 (完整轴长, 缩放前)
pub const MIN_AXIS_LENGTH: f32 = 8.0;

/// 检测参数
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionParams {
    pub threshold: u8,
    pub threshold_max: u8,
    pub blur_kernel_size: usize,
    pub blur_sigma: f32,
    /// 单只蜜蜂面积区间 [min, max)
    pub bee_area: (f32, f32),
    /// 蜂群面积区间 [min, max)
    pub group_area: (f32, f32),
    pub merge_distance: f32,
    pub merge_strategy: MergeStrategy,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for DetectionParams {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            threshold: config.binary_threshold_value,
            threshold_max: config.binary_threshold_max,
            blur_kernel_size: config.blur_kernel_size,
            blur_sigma: config.blur_sigma,
            bee_area: (
                config.detect_ellipse_area_min_size,
                config.detect_ellipse_area_max_size,
            ),
            group_area: (
                config.detect_group_area_min_size,
                config.detect_group_area_max_size,
            ),
            merge_distance: config.merge_distance,
            merge_strategy: config.merge_strategy,
        }
    }
}

/// 椭圆分类结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobKind {
    Bee,
    Group,
}

impl DetectionParams {
    /// 面积 → 类别, 两个区间之外返回 None
    pub fn classify(&self, area: f32) -> Option<BlobKind> {
        if area >= self.bee_area.0 && area < self.bee_area.1 {
            Some(BlobKind::Bee)
        } else if area >= self.group_area.0 && area < self.group_area.1 {
            Some(BlobKind::Group)
        } else {
            None
        }
    }
}

pub fn detect_bees(frame: &RgbImage, scale: f32, params: &DetectionParams) -> BlobDetections {
    let mask = foreground_mask(frame, params);

    let mut detections = Vec::new();
    let mut groups = Vec::new();

    for contour in find_contours::<i32>(&mask) {
        // 只保留最外层轮廓
        if contour.border_type != BorderType::Outer || contour.parent.is_some() {
            continue;
        }
        let Some(ellipse) = fit_ellipse(&contour.points) else {
            continue;
        };
        if ellipse.a * 2.0 < MIN_AXIS_LENGTH || ellipse.b * 2.0 < MIN_AXIS_LENGTH {
            continue;
        }
        match params.classify(ellipse.area()) {
            Some(BlobKind::Bee) => detections.push(ellipse.scaled(scale)),
            Some(BlobKind::Group) => groups.push(ellipse.scaled(scale)),
            None => {}
        }
    }

    BlobDetections {
        detections: merge_nearby(&detections, params.merge_distance, params.merge_strategy),
        groups,
    }
}

/// 前景掩码: 非零像素为候选蜜蜂
pub fn foreground_mask(frame: &RgbImage, params: &DetectionParams) -> GrayImage {
    let saliency = saliency(frame);
    let kernel = gaussian_kernel(params.blur_kernel_size, params.blur_sigma);
    let mut blurred = separable_filter_equal(&saliency, &kernel);

    for pixel in blurred.pixels_mut() {
        let value = if pixel[0] > params.threshold {
            params.threshold_max
        } else {
            0
        };
        pixel[0] = 255 - value;
    }
    blurred
}

/// 255 - (G - max(R, G, B)), 8位回绕
pub fn saliency(frame: &RgbImage) -> GrayImage {
    let mut out = GrayImage::new(frame.width(), frame.height());
    for (x, y, pixel) in frame.enumerate_pixels() {
        let [r, g, b] = pixel.0;
        let v = r.max(g).max(b);
        out.put_pixel(x, y, Luma([255 - g.wrapping_sub(v)]));
    }
    out
}

/// 归一化一维高斯核
fn gaussian_kernel(size: usize, sigma: f32) -> Vec<f32> {
    let size = size.max(1);
    let half = (size / 2) as f32;
    let sigma = if sigma > 0.0 {
        sigma
    } else {
        // 与常见实现一致: 由核大小推导
        0.3 * ((size as f32 - 1.0) * 0.5 - 1.0) + 0.8
    };
    let mut kernel: Vec<f32> = (0..size)
        .map(|i| {
            let d = i as f32 - half;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}
