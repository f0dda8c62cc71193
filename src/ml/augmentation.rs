//! 学習時のデータ拡張
//!
//! 回転・平行移動・せん断・拡大縮小を1つのアフィン変換にまとめ、
//! 出力画素ごとに逆変換で元画像を参照します（最近傍、範囲外は端の画素で埋める）。
//! 検証・評価・推論では使用しません。

use image::{ImageBuffer, RgbImage};
use rand::Rng;

/// データ拡張の設定
#[derive(Clone, Debug)]
pub struct AugmentationConfig {
    /// 回転角の最大値（度、±）
    pub rotation_degrees: f32,
    /// 水平方向の平行移動量（幅に対する割合、±）
    pub width_shift: f32,
    /// 垂直方向の平行移動量（高さに対する割合、±）
    pub height_shift: f32,
    /// せん断角の最大値（度、±）
    pub shear_degrees: f32,
    /// 拡大率の範囲
    pub zoom_range: (f32, f32),
    /// 左右反転の確率
    pub horizontal_flip_prob: f64,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            rotation_degrees: 40.0,
            width_shift: 0.2,
            height_shift: 0.2,
            shear_degrees: 0.2,
            zoom_range: (0.8, 1.2),
            horizontal_flip_prob: 0.5,
        }
    }
}

/// 1枚の画像に適用する変換パラメータ
#[derive(Clone, Debug, PartialEq)]
pub struct AffineParams {
    /// 回転角（ラジアン）
    pub theta: f32,
    /// 平行移動（画素）
    pub tx: f32,
    pub ty: f32,
    /// せん断角（ラジアン）
    pub shear: f32,
    pub zoom_x: f32,
    pub zoom_y: f32,
    pub flip: bool,
}

impl AffineParams {
    pub fn identity() -> Self {
        Self {
            theta: 0.0,
            tx: 0.0,
            ty: 0.0,
            shear: 0.0,
            zoom_x: 1.0,
            zoom_y: 1.0,
            flip: false,
        }
    }

    /// 出力座標（中心基準）から入力座標（中心基準）へ写す
    ///
    /// 入力 = 回転 · (平行移動 + せん断 · 拡大 · 出力)
    fn source_offset(&self, u: f32, v: f32) -> (f32, f32) {
        let (u, v) = (u * self.zoom_x, v * self.zoom_y);
        let (u, v) = (u - self.shear.sin() * v, self.shear.cos() * v);
        let (u, v) = (u + self.tx, v + self.ty);
        let (sin, cos) = self.theta.sin_cos();
        (cos * u - sin * v, sin * u + cos * v)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    /// 変換パラメータをランダムに決める
    pub fn sample<R: Rng>(&self, rng: &mut R, width: u32, height: u32) -> AffineParams {
        let c = &self.config;
        let symmetric = |rng: &mut R, max: f32| {
            if max > 0.0 {
                rng.gen_range(-max..=max)
            } else {
                0.0
            }
        };

        let (zoom_min, zoom_max) = c.zoom_range;
        let mut zoom = || {
            if zoom_max > zoom_min {
                rng.gen_range(zoom_min..=zoom_max)
            } else {
                zoom_min
            }
        };
        let zoom_x = zoom();
        let zoom_y = zoom();

        AffineParams {
            theta: symmetric(rng, c.rotation_degrees).to_radians(),
            tx: symmetric(rng, c.width_shift) * width as f32,
            ty: symmetric(rng, c.height_shift) * height as f32,
            shear: symmetric(rng, c.shear_degrees).to_radians(),
            zoom_x,
            zoom_y,
            flip: rng.gen_bool(c.horizontal_flip_prob.clamp(0.0, 1.0)),
        }
    }

    /// ランダムな変換を適用
    pub fn augment<R: Rng>(&self, image: &RgbImage, rng: &mut R) -> RgbImage {
        let params = self.sample(rng, image.width(), image.height());
        apply_affine(image, &params)
    }
}

/// 変換パラメータを画像に適用
pub fn apply_affine(image: &RgbImage, params: &AffineParams) -> RgbImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }

    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;
    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;

    ImageBuffer::from_fn(width, height, |x, y| {
        let x = if params.flip { width - 1 - x } else { x };
        let (su, sv) = params.source_offset(x as f32 - cx, y as f32 - cy);
        let sx = (su + cx).round().clamp(0.0, max_x) as u32;
        let sy = (sv + cy).round().clamp(0.0, max_y) as u32;
        *image.get_pixel(sx, sy)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gradient(width: u32, height: u32) -> RgbImage {
        ImageBuffer::from_fn(width, height, |x, y| Rgb([(x * 10) as u8, (y * 10) as u8, 0]))
    }

    #[test]
    fn test_identity_keeps_image() {
        let img = gradient(8, 6);
        assert_eq!(apply_affine(&img, &AffineParams::identity()), img);
    }

    #[test]
    fn test_flip_mirrors_columns() {
        let img = gradient(8, 6);
        let params = AffineParams {
            flip: true,
            ..AffineParams::identity()
        };
        let flipped = apply_affine(&img, &params);
        for y in 0..6 {
            for x in 0..8 {
                assert_eq!(flipped.get_pixel(x, y), img.get_pixel(7 - x, y));
            }
        }
    }

    #[test]
    fn test_shift_fills_with_edge() {
        let img = gradient(8, 8);
        let params = AffineParams {
            tx: 100.0,
            ..AffineParams::identity()
        };
        let shifted = apply_affine(&img, &params);
        // 参照先が右端を超えるので全列が最終列になる
        for y in 0..8 {
            for x in 0..8 {
                assert_eq!(shifted.get_pixel(x, y), img.get_pixel(7, y));
            }
        }
    }

    #[test]
    fn test_sample_within_ranges() {
        let augmenter = Augmenter::default();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let p = augmenter.sample(&mut rng, 100, 50);
            assert!(p.theta.abs() <= 40f32.to_radians() + 1e-6);
            assert!(p.tx.abs() <= 20.0 + 1e-4);
            assert!(p.ty.abs() <= 10.0 + 1e-4);
            assert!(p.shear.abs() <= 0.2f32.to_radians() + 1e-6);
            assert!((0.8..=1.2).contains(&p.zoom_x));
            assert!((0.8..=1.2).contains(&p.zoom_y));
        }
    }

    #[test]
    fn test_augment_preserves_size_and_is_seeded() {
        let img = gradient(16, 12);
        let augmenter = Augmenter::default();
        let a = augmenter.augment(&img, &mut StdRng::seed_from_u64(7));
        let b = augmenter.augment(&img, &mut StdRng::seed_from_u64(7));
        assert_eq!(a.dimensions(), (16, 12));
        assert_eq!(a, b);
    }
}
