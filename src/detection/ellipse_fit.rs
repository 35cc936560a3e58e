//! 轮廓椭圆拟合
//!
//! 用轮廓多边形围成区域的二阶矩 (格林公式) 求等效椭圆:
//! 均匀填充椭圆沿长轴的方差为 a²/4, 因此半轴 = 2·√λ。
//! 面积过小 (退化轮廓) 时退回到轮廓点的协方差。

use imageproc::point::Point;

use super::types::Ellipse;

/// 面积低于该值视为退化多边形
const DEGENERATE_AREA: f64 = 1.0;

pub fn fit_ellipse(points: &[Point<i32>]) -> Option<Ellipse> {
    if points.len() < 5 {
        return None;
    }
    polygon_moments(points)
        .or_else(|| point_moments(points))
        .map(|(cx, cy, mu20, mu02, mu11)| from_moments(cx, cy, mu20, mu02, mu11))
}

/// 多边形区域的中心与二阶中心矩
fn polygon_moments(points: &[Point<i32>]) -> Option<(f64, f64, f64, f64, f64)> {
    let n = points.len();
    let (mut m00, mut m10, mut m01) = (0.0f64, 0.0f64, 0.0f64);
    let (mut m20, mut m02, mut m11) = (0.0f64, 0.0f64, 0.0f64);

    for i in 0..n {
        let p = points[i];
        let q = points[(i + 1) % n];
        let (x0, y0) = (p.x as f64, p.y as f64);
        let (x1, y1) = (q.x as f64, q.y as f64);
        let cross = x0 * y1 - x1 * y0;

        m00 += cross;
        m10 += (x0 + x1) * cross;
        m01 += (y0 + y1) * cross;
        m20 += (x0 * x0 + x0 * x1 + x1 * x1) * cross;
        m02 += (y0 * y0 + y0 * y1 + y1 * y1) * cross;
        m11 += (x0 * y1 + 2.0 * x0 * y0 + 2.0 * x1 * y1 + x1 * y0) * cross;
    }

    let area = m00 / 2.0;
    if area.abs() < DEGENERATE_AREA {
        return None;
    }

    // 方向 (顺/逆时针) 的符号在除以面积时抵消
    let cx = m10 / (6.0 * area);
    let cy = m01 / (6.0 * area);
    let mu20 = m20 / (12.0 * area) - cx * cx;
    let mu02 = m02 / (12.0 * area) - cy * cy;
    let mu11 = m11 / (24.0 * area) - cx * cy;

    if mu20 < 0.0 || mu02 < 0.0 {
        return None;
    }
    Some((cx, cy, mu20, mu02, mu11))
}

/// 轮廓点的协方差
fn point_moments(points: &[Point<i32>]) -> Option<(f64, f64, f64, f64, f64)> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x as f64).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y as f64).sum::<f64>() / n;

    let (mut mu20, mut mu02, mut mu11) = (0.0, 0.0, 0.0);
    for p in points {
        let dx = p.x as f64 - cx;
        let dy = p.y as f64 - cy;
        mu20 += dx * dx;
        mu02 += dy * dy;
        mu11 += dx * dy;
    }
    Some((cx, cy, mu20 / n, mu02 / n, mu11 / n))
}

fn from_moments(cx: f64, cy: f64, mu20: f64, mu02: f64, mu11: f64) -> Ellipse {
    let mean = (mu20 + mu02) / 2.0;
    let spread = (((mu20 - mu02) / 2.0).powi(2) + mu11 * mu11).sqrt();
    let major = (mean + spread).max(0.0);
    let minor = (mean - spread).max(0.0);
    let angle = 0.5 * (2.0 * mu11).atan2(mu20 - mu02);

    Ellipse::new(
        cx as f32,
        cy as f32,
        (2.0 * major.sqrt()) as f32,
        (2.0 * minor.sqrt()) as f32,
        angle.to_degrees() as f32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rectangle(x0: i32, y0: i32, x1: i32, y1: i32) -> Vec<Point<i32>> {
        let mut points = Vec::new();
        for x in x0..x1 {
            points.push(Point::new(x, y0));
        }
        for y in y0..y1 {
            points.push(Point::new(x1, y));
        }
        for x in (x0 + 1..=x1).rev() {
            points.push(Point::new(x, y1));
        }
        for y in (y0 + 1..=y1).rev() {
            points.push(Point::new(x0, y));
        }
        points
    }

    #[test]
    fn test_wide_rectangle_is_horizontal() {
        let points = rectangle(0, 0, 40, 10);
        let e = fit_ellipse(&points).unwrap();
        assert!((e.cx - 20.0).abs() < 1e-3);
        assert!((e.cy - 5.0).abs() < 1e-3);
        assert!(e.a > e.b);
        assert!(e.angle.abs() < 1e-3);
        // 矩形方差 w²/12 → 半轴 w/√3
        assert!((e.a - 40.0 / 3f32.sqrt()).abs() < 1e-2);
    }

    #[test]
    fn test_tall_rectangle_is_vertical() {
        let points = rectangle(0, 0, 10, 40);
        let e = fit_ellipse(&points).unwrap();
        assert!((e.angle.abs() - 90.0).abs() < 1e-3);
    }

    #[test]
    fn test_orientation_does_not_matter() {
        let mut points = rectangle(5, 5, 25, 15);
        let forward = fit_ellipse(&points).unwrap();
        points.reverse();
        let backward = fit_ellipse(&points).unwrap();
        assert!((forward.a - backward.a).abs() < 1e-4);
        assert!((forward.b - backward.b).abs() < 1e-4);
    }

    #[test]
    fn test_degenerate_line_falls_back_to_point_spread() {
        let points: Vec<_> = (0..20).map(|x| Point::new(x, 3)).collect();
        let e = fit_ellipse(&points).unwrap();
        assert!(e.b < 1e-3);
        assert!(e.a > 8.0);
    }

    #[test]
    fn test_too_few_points() {
        let points = vec![Point::new(0, 0), Point::new(1, 0), Point::new(1, 1)];
        assert!(fit_ellipse(&points).is_none());
    }
}
