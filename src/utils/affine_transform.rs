/// 仿射变换工具模块
/// 实现类似于 cv2::warpAffine 的功能 (RGB图像, 双线性插值)
use image::{Rgb, RgbImage};

/// 仿射变换矩阵 (2x3)
/// | a11 a12 b1 |
/// | a21 a22 b2 |
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineMatrix {
    pub a11: f32,
    pub a12: f32,
    pub b1: f32,
    pub a21: f32,
    pub a22: f32,
    pub b2: f32,
}

impl AffineMatrix {
    /// 应用仿射变换到点 (x, y)
    pub fn transform_point(&self, x: f32, y: f32) -> (f32, f32) {
        let new_x = self.a11 * x + self.a12 * y + self.b1;
        let new_y = self.a21 * x + self.a22 * y + self.b2;
        (new_x, new_y)
    }

    /// 创建平移矩阵
    pub fn translation(dx: f32, dy: f32) -> Self {
        Self {
            a11: 1.0,
            a12: 0.0,
            b1: dx,
            a21: 0.0,
            a22: 1.0,
            b2: dy,
        }
    }

    /// 创建旋转矩阵 (角度制)
    pub fn rotation(angle_degrees: f32) -> Self {
        let angle_rad = angle_degrees.to_radians();
        let cos_a = angle_rad.cos();
        let sin_a = angle_rad.sin();
        Self {
            a11: cos_a,
            a12: -sin_a,
            b1: 0.0,
            a21: sin_a,
            a22: cos_a,
            b2: 0.0,
        }
    }

    /// 矩阵组合 (self * other): 先应用 other, 再应用 self
    pub fn compose(&self, other: &Self) -> Self {
        Self {
            a11: self.a11 * other.a11 + self.a12 * other.a21,
            a12: self.a11 * other.a12 + self.a12 * other.a22,
            b1: self.a11 * other.b1 + self.a12 * other.b2 + self.b1,
            a21: self.a21 * other.a11 + self.a22 * other.a21,
            a22: self.a21 * other.a12 + self.a22 * other.a22,
            b2: self.a21 * other.b1 + self.a22 * other.b2 + self.b2,
        }
    }

    /// 目标窗口 → 源图像的映射: 窗口中心落在 (cx, cy), 窗口竖直方向对齐 `angle_degrees`
    pub fn oriented_window(cx: f32, cy: f32, angle_degrees: f32, width: f32, height: f32) -> Self {
        let to_center = Self::translation(cx, cy);
        let rotate = Self::rotation(angle_degrees - 90.0);
        let from_corner = Self::translation(-width / 2.0, -height / 2.0);
        to_center.compose(&rotate.compose(&from_corner))
    }
}

/// 仿射变换 (RGB图像, 双线性插值, 边缘复制)
///
/// `dst_to_src` 把目标像素坐标映射到源图像坐标 (即 cv2 的 WARP_INVERSE_MAP)
pub fn warp_affine_rgb(src: &RgbImage, dst_to_src: &AffineMatrix, dst_size: (u32, u32)) -> RgbImage {
    let (dst_width, dst_height) = dst_size;
    let mut dst = RgbImage::new(dst_width, dst_height);

    for dst_y in 0..dst_height {
        for dst_x in 0..dst_width {
            // 反向映射到源图像坐标 (像素中心)
            let (src_x, src_y) =
                dst_to_src.transform_point(dst_x as f32 + 0.5, dst_y as f32 + 0.5);
            dst.put_pixel(dst_x, dst_y, bilinear(src, src_x - 0.5, src_y - 0.5));
        }
    }

    dst
}

/// 双线性插值 (RGB)
fn bilinear(src: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = replicate(src, x0, y0);
    let p01 = replicate(src, x0, y0 + 1);
    let p10 = replicate(src, x0 + 1, y0);
    let p11 = replicate(src, x0 + 1, y0 + 1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let v0 = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let v1 = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (v0 * (1.0 - fy) + v1 * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// 边界处理 (边缘复制)
fn replicate(src: &RgbImage, x: i32, y: i32) -> [u8; 3] {
    let bx = x.clamp(0, src.width() as i32 - 1) as u32;
    let by = y.clamp(0, src.height() as i32 - 1) as u32;
    src.get_pixel(bx, by).0
}
