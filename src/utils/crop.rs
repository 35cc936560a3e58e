/// 蜜蜂截图工具
/// 按椭圆位置和方向从大图中截取分类器尺寸的图像, 并计算清晰度
use image::{imageops, RgbImage};
use imageproc::filter::laplacian_filter;

use crate::detection::Ellipse;

use super::affine_transform::{warp_affine_rgb, AffineMatrix};

/// 截取旋转窗口: 中心 = 位置 × scale, 长轴竖直
///
/// 窗口任一角落在图像外时返回 None
pub fn extract_bee_image(
    frame: &RgbImage,
    position: &Ellipse,
    scale: f32,
    size: (u32, u32),
) -> Option<RgbImage> {
    let (width, height) = (size.0 as f32, size.1 as f32);
    let matrix = AffineMatrix::oriented_window(
        position.cx * scale,
        position.cy * scale,
        position.angle,
        width,
        height,
    );

    let (frame_w, frame_h) = (frame.width() as f32, frame.height() as f32);
    let corners = [(0.0, 0.0), (width, 0.0), (0.0, height), (width, height)];
    for (u, v) in corners {
        let (x, y) = matrix.transform_point(u, v);
        if x < 0.0 || y < 0.0 || x > frame_w || y > frame_h {
            return None;
        }
    }

    Some(warp_affine_rgb(frame, &matrix, size))
}

/// 清晰度: 亮度拉普拉斯响应的方差
pub fn sharpness(image: &RgbImage) -> f64 {
    let luma = imageops::grayscale(image);
    let laplacian = laplacian_filter(&luma);

    let n = (laplacian.width() * laplacian.height()) as usize;
    if n == 0 {
        return 0.0;
    }
    let values: Vec<f64> = laplacian.pixels().map(|p| p[0] as f64).collect();
    let mean = values.iter().sum::<f64>() / n as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64
}

/// 截图 + 清晰度
pub fn crop_with_sharpness(
    frame: &RgbImage,
    position: &Ellipse,
    scale: f32,
    size: (u32, u32),
) -> (Option<RgbImage>, f64) {
    match extract_bee_image(frame, position, scale, size) {
        Some(crop) => {
            let score = sharpness(&crop);
            (Some(crop), score)
        }
        None => (None, 0.0),
    }
}
