/// 检测系统数据结构定义
/// Data structures for blob detection

// ========== 数据结构 ==========

/// 椭圆 (中心 + 半轴 + 长轴方向)
///
/// `a` 为长半轴, `b` 为短半轴, `angle` 为长轴相对x轴的角度 (角度制, 图像坐标系y轴向下)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ellipse {
    pub cx: f32,
    pub cy: f32,
    pub a: f32,
    pub b: f32,
    pub angle: f32,
}

impl Ellipse {
    pub fn new(cx: f32, cy: f32, a: f32, b: f32, angle: f32) -> Self {
        Self { cx, cy, a, b, angle }
    }

    /// 圆 (测试和绘制用)
    pub fn circle(cx: f32, cy: f32, radius: f32) -> Self {
        Self::new(cx, cy, radius, radius, 0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.cx, self.cy)
    }

    /// π · a · b
    pub fn area(&self) -> f32 {
        std::f32::consts::PI * self.a * self.b
    }

    /// 中心点距离
    pub fn distance(&self, other: &Ellipse) -> f32 {
        ((self.cx - other.cx).powi(2) + (self.cy - other.cy).powi(2)).sqrt()
    }

    /// 中心与半轴同比缩放, 角度不变
    pub fn scaled(&self, scale: f32) -> Self {
        Self {
            cx: self.cx * scale,
            cy: self.cy * scale,
            a: self.a * scale,
            b: self.b * scale,
            angle: self.angle,
        }
    }
}

/// 单帧检测结果
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BlobDetections {
    /// 单只蜜蜂 (已合并近邻)
    pub detections: Vec<Ellipse>,
    /// 无法拆分的蜂群斑块, 原样传递
    pub groups: Vec<Ellipse>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_area_and_scale() {
        let e = Ellipse::new(10.0, 20.0, 4.0, 2.0, 30.0);
        assert!((e.area() - std::f32::consts::PI * 8.0).abs() < 1e-4);

        let s = e.scaled(3.0);
        assert_eq!(s.center(), (30.0, 60.0));
        assert_eq!((s.a, s.b, s.angle), (12.0, 6.0, 30.0));
    }

    #[test]
    fn test_distance() {
        let a = Ellipse::circle(0.0, 0.0, 1.0);
        let b = Ellipse::circle(3.0, 4.0, 1.0);
        assert_eq!(a.distance(&b), 5.0);
    }
}
