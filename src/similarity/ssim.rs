use image::GrayImage;

use crate::error::SimilarityError;

/// Side of the square sliding window.
pub const WINDOW: u32 = 7;

const K1: f64 = 0.01;
const K2: f64 = 0.03;
const DATA_RANGE: f64 = 255.0;

// sum x, sum y, sum x^2, sum y^2, sum xy
type Moments = [u64; 5];

/// Mean structural similarity over every 7x7 window that fits inside the
/// image. Uses sample covariance, so a window of constant pixels scores by
/// its means alone. Both images must have the same dimensions.
pub fn mean_ssim(a: &GrayImage, b: &GrayImage) -> Result<f64, SimilarityError> {
    if a.dimensions() != b.dimensions() {
        return Err(SimilarityError::DimensionMismatch { a: a.dimensions(), b: b.dimensions() });
    }
    let (w, h) = a.dimensions();
    if w < WINDOW || h < WINDOW {
        return Err(SimilarityError::TooSmall { width: w, height: h, min: WINDOW });
    }

    let win = WINDOW as usize;
    let n = (win * win) as f64;
    let cov_norm = n / (n - 1.0);
    let c1 = (K1 * DATA_RANGE).powi(2);
    let c2 = (K2 * DATA_RANGE).powi(2);

    let (w, h) = (w as usize, h as usize);
    let (pa, pb) = (a.as_raw(), b.as_raw());

    // Per-column moments over the current band of `win` rows.
    let mut cols: Vec<Moments> = vec![[0; 5]; w];
    let mut total = 0.0f64;
    let mut count = 0u64;

    for y in 0..h {
        for (x, col) in cols.iter_mut().enumerate() {
            add(col, pixel_moments(pa[y * w + x], pb[y * w + x]));
            if y >= win {
                let old = (y - win) * w + x;
                sub(col, pixel_moments(pa[old], pb[old]));
            }
        }
        if y + 1 < win {
            continue;
        }

        let mut acc: Moments = [0; 5];
        for x in 0..w {
            add(&mut acc, cols[x]);
            if x >= win {
                sub(&mut acc, cols[x - win]);
            }
            if x + 1 < win {
                continue;
            }
            let ux = acc[0] as f64 / n;
            let uy = acc[1] as f64 / n;
            let vx = cov_norm * (acc[2] as f64 / n - ux * ux);
            let vy = cov_norm * (acc[3] as f64 / n - uy * uy);
            let vxy = cov_norm * (acc[4] as f64 / n - ux * uy);

            let num = (2.0 * ux * uy + c1) * (2.0 * vxy + c2);
            let den = (ux * ux + uy * uy + c1) * (vx + vy + c2);
            total += num / den;
            count += 1;
        }
    }

    Ok(total / count as f64)
}

fn pixel_moments(x: u8, y: u8) -> Moments {
    let (x, y) = (x as u64, y as u64);
    [x, y, x * x, y * y, x * y]
}

fn add(acc: &mut Moments, m: Moments) {
    for (a, v) in acc.iter_mut().zip(m) { *a += v; }
}

fn sub(acc: &mut Moments, m: Moments) {
    for (a, v) in acc.iter_mut().zip(m) { *a -= v; }
}
