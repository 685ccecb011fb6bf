//! 3x3 affine/perspective matrices, row-major.
//!
//! `pre_*` operations apply the new transform before the existing one
//! (`M = M * T`); `post_*` apply it after (`M = T * M`).

pub const SCALE_X: usize = 0;
pub const SKEW_X: usize = 1;
pub const TRANS_X: usize = 2;
pub const SKEW_Y: usize = 3;
pub const SCALE_Y: usize = 4;
pub const TRANS_Y: usize = 5;
pub const PERSP_0: usize = 6;
pub const PERSP_1: usize = 7;
pub const PERSP_2: usize = 8;

const NEARLY_ZERO: f32 = 1.0 / (1 << 12) as f32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix {
    m: [f32; 9],
}

impl Default for Matrix {
    fn default() -> Self {
        Self::identity()
    }
}

impl Matrix {
    pub const fn identity() -> Self {
        Self {
            m: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        }
    }

    pub fn from_values(m: [f32; 9]) -> Self {
        Self { m }
    }

    pub fn make_scale(sx: f32, sy: f32) -> Self {
        let mut m = Self::identity();
        m.set_scale(sx, sy, 0.0, 0.0);
        m
    }

    pub fn make_translate(dx: f32, dy: f32) -> Self {
        let mut m = Self::identity();
        m.set_translate(dx, dy);
        m
    }

    pub fn get(&self, index: usize) -> Option<f32> {
        self.m.get(index).copied()
    }

    pub fn set(&mut self, index: usize, value: f32) -> bool {
        match self.m.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn values(&self) -> [f32; 9] {
        self.m
    }

    pub fn set_values(&mut self, m: [f32; 9]) {
        self.m = m;
    }

    pub fn reset(&mut self) {
        *self = Self::identity();
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    pub fn set_translate(&mut self, dx: f32, dy: f32) {
        self.m = [1.0, 0.0, dx, 0.0, 1.0, dy, 0.0, 0.0, 1.0];
    }

    /// Scale about the pivot `(px, py)`.
    pub fn set_scale(&mut self, sx: f32, sy: f32, px: f32, py: f32) {
        self.m = [sx, 0.0, px - sx * px, 0.0, sy, py - sy * py, 0.0, 0.0, 1.0];
    }

    /// Rotate by `degrees` about the pivot `(px, py)`.
    pub fn set_rotate(&mut self, degrees: f32, px: f32, py: f32) {
        let (sin, cos) = degrees.to_radians().sin_cos();
        self.set_sin_cos(sin, cos, px, py);
    }

    fn set_sin_cos(&mut self, sin: f32, cos: f32, px: f32, py: f32) {
        let one_minus_cos = 1.0 - cos;
        self.m = [
            cos,
            -sin,
            sin * py + one_minus_cos * px,
            sin,
            cos,
            -sin * px + one_minus_cos * py,
            0.0,
            0.0,
            1.0,
        ];
    }

    /// Skew about the pivot `(px, py)`.
    pub fn set_skew(&mut self, kx: f32, ky: f32, px: f32, py: f32) {
        self.m = [1.0, kx, -kx * py, ky, 1.0, -ky * px, 0.0, 0.0, 1.0];
    }

    /// Set to `a * b`.
    pub fn set_concat(&mut self, a: &Matrix, b: &Matrix) {
        let mut out = [0.0f32; 9];
        for row in 0..3 {
            for col in 0..3 {
                out[row * 3 + col] = (0..3).map(|k| a.m[row * 3 + k] * b.m[k * 3 + col]).sum();
            }
        }
        self.m = out;
    }

    pub fn pre_concat(&mut self, other: &Matrix) {
        let current = *self;
        self.set_concat(&current, other);
    }

    pub fn post_concat(&mut self, other: &Matrix) {
        let current = *self;
        self.set_concat(other, &current);
    }

    pub fn pre_translate(&mut self, dx: f32, dy: f32) {
        self.pre_concat(&Self::make_translate(dx, dy));
    }

    pub fn post_translate(&mut self, dx: f32, dy: f32) {
        self.post_concat(&Self::make_translate(dx, dy));
    }

    pub fn pre_scale(&mut self, sx: f32, sy: f32, px: f32, py: f32) {
        let mut s = Self::identity();
        s.set_scale(sx, sy, px, py);
        self.pre_concat(&s);
    }

    pub fn post_scale(&mut self, sx: f32, sy: f32, px: f32, py: f32) {
        let mut s = Self::identity();
        s.set_scale(sx, sy, px, py);
        self.post_concat(&s);
    }

    pub fn pre_rotate(&mut self, degrees: f32, px: f32, py: f32) {
        let mut r = Self::identity();
        r.set_rotate(degrees, px, py);
        self.pre_concat(&r);
    }

    pub fn post_rotate(&mut self, degrees: f32, px: f32, py: f32) {
        let mut r = Self::identity();
        r.set_rotate(degrees, px, py);
        self.post_concat(&r);
    }

    pub fn pre_skew(&mut self, kx: f32, ky: f32, px: f32, py: f32) {
        let mut k = Self::identity();
        k.set_skew(kx, ky, px, py);
        self.pre_concat(&k);
    }

    pub fn post_skew(&mut self, kx: f32, ky: f32, px: f32, py: f32) {
        let mut k = Self::identity();
        k.set_skew(kx, ky, px, py);
        self.post_concat(&k);
    }

    /// Inverse, or `None` when the matrix is singular.
    pub fn invert(&self) -> Option<Matrix> {
        let m = &self.m;
        let c00 = m[4] * m[8] - m[5] * m[7];
        let c01 = m[5] * m[6] - m[3] * m[8];
        let c02 = m[3] * m[7] - m[4] * m[6];
        let det = m[0] * c00 + m[1] * c01 + m[2] * c02;
        if det.abs() <= NEARLY_ZERO * NEARLY_ZERO * NEARLY_ZERO {
            return None;
        }
        let inv = 1.0 / det;
        Some(Matrix {
            m: [
                c00 * inv,
                (m[2] * m[7] - m[1] * m[8]) * inv,
                (m[1] * m[5] - m[2] * m[4]) * inv,
                c01 * inv,
                (m[0] * m[8] - m[2] * m[6]) * inv,
                (m[2] * m[3] - m[0] * m[5]) * inv,
                c02 * inv,
                (m[1] * m[6] - m[0] * m[7]) * inv,
                (m[0] * m[4] - m[1] * m[3]) * inv,
            ],
        })
    }

    pub fn map_point(&self, x: f32, y: f32) -> (f32, f32) {
        let m = &self.m;
        let px = m[0] * x + m[1] * y + m[2];
        let py = m[3] * x + m[4] * y + m[5];
        let w = m[6] * x + m[7] * y + m[8];
        if w == 0.0 || w == 1.0 {
            (px, py)
        } else {
            (px / w, py / w)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: (f32, f32), b: (f32, f32)) -> bool {
        (a.0 - b.0).abs() < 1e-4 && (a.1 - b.1).abs() < 1e-4
    }

    #[test]
    fn test_pre_post_order() {
        let mut m = Matrix::make_scale(2.0, 2.0);
        m.post_translate(10.0, 0.0);
        assert!(close(m.map_point(1.0, 1.0), (12.0, 2.0)));

        let mut m = Matrix::make_scale(2.0, 2.0);
        m.pre_translate(10.0, 0.0);
        assert!(close(m.map_point(1.0, 1.0), (22.0, 2.0)));
    }

    #[test]
    fn test_rotate_about_pivot() {
        let mut m = Matrix::identity();
        m.set_rotate(90.0, 1.0, 1.0);
        assert!(close(m.map_point(2.0, 1.0), (1.0, 2.0)));
    }

    #[test]
    fn test_invert() {
        let mut m = Matrix::make_scale(2.0, 4.0);
        m.post_translate(3.0, -1.0);
        let inv = m.invert().unwrap();
        let (x, y) = m.map_point(5.0, 7.0);
        assert!(close(inv.map_point(x, y), (5.0, 7.0)));

        assert!(Matrix::make_scale(0.0, 1.0).invert().is_none());
    }

    #[test]
    fn test_get_set_bounds() {
        let mut m = Matrix::identity();
        assert!(m.is_identity());
        assert!(m.set(TRANS_X, 3.0));
        assert!(!m.set(9, 1.0));
        assert_eq!(m.get(TRANS_X), Some(3.0));
        assert_eq!(m.get(9), None);
        assert!(!m.is_identity());
    }
}
