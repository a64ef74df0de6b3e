use std::fmt;
use std::ops::{Add, Mul, Sub};

/// 3次元位置を表す構造体
///
/// z は高度（上向き正、地表 = 0）。バックエンドが返す位置は各機体の
/// ローカル座標系（スポーン地点が原点）で表されます。
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position3D {
    pub x: f64, // m
    pub y: f64, // m
    pub z: f64, // m (altitude)
}

impl Position3D {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// 原点（未観測時の既定値）
    pub fn origin() -> Self {
        Self::default()
    }

    /// 水平座標を保ったまま高度だけを置き換える
    pub fn with_altitude(&self, altitude: f64) -> Self {
        Self::new(self.x, self.y, altitude)
    }

    /// 3次元距離を計算
    pub fn distance_3d(&self, other: &Position3D) -> f64 {
        (*self - *other).magnitude()
    }

    /// ベクトルの長さ（原点からの距離）
    pub fn magnitude(&self) -> f64 {
        (self.x.powi(2) + self.y.powi(2) + self.z.powi(2)).sqrt()
    }

    /// 線形補間
    ///
    /// `fraction` = 0 で `self`、1 で `target` を返します。
    pub fn lerp(&self, target: &Position3D, fraction: f64) -> Self {
        *self + (*target - *self) * fraction
    }

    /// `target` に向かって最大 `max_step` だけ進んだ位置
    ///
    /// 残り距離が `max_step` 以下なら `target` そのものを返します。
    pub fn step_towards(&self, target: &Position3D, max_step: f64) -> Self {
        let remaining = self.distance_3d(target);
        if remaining <= max_step || remaining == 0.0 {
            *target
        } else {
            self.lerp(target, max_step / remaining)
        }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Position3D {
    type Output = Self;

    fn add(self, other: Self) -> Self::Output {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl Sub for Position3D {
    type Output = Self;

    fn sub(self, other: Self) -> Self::Output {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

impl Mul<f64> for Position3D {
    type Output = Self;

    fn mul(self, scalar: f64) -> Self::Output {
        Self::new(self.x * scalar, self.y * scalar, self.z * scalar)
    }
}

impl fmt::Display for Position3D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:.2}, {:.2}, {:.2}]", self.x, self.y, self.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lerp_endpoints_and_fraction() {
        let a = Position3D::new(0.0, 0.0, 20.0);
        let b = Position3D::new(10.0, -10.0, 20.0);
        assert_eq!(a.lerp(&b, 0.0), a);
        assert_eq!(a.lerp(&b, 1.0), b);
        let p = a.lerp(&b, 0.3);
        assert!((p.x - 3.0).abs() < 1e-9);
        assert!((p.y + 3.0).abs() < 1e-9);
        assert!((p.z - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_with_altitude_keeps_horizontal() {
        let p = Position3D::new(4.5, -2.0, 20.0).with_altitude(0.0);
        assert_eq!(p, Position3D::new(4.5, -2.0, 0.0));
    }

    #[test]
    fn test_step_towards_does_not_overshoot() {
        let a = Position3D::origin();
        let b = Position3D::new(3.0, 4.0, 0.0);
        let half = a.step_towards(&b, 2.5);
        assert!((half.distance_3d(&a) - 2.5).abs() < 1e-9);
        assert_eq!(a.step_towards(&b, 10.0), b);
    }
}
