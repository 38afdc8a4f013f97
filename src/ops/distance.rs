// ============================================================================
// SIGNED EUCLIDEAN DISTANCE TRANSFORM — exact two-pass lower-envelope EDT
// ============================================================================
//
// The morph between two slices interpolates *signed distance fields*, not
// raw binary masks: linear blending of signed distances produces a shape
// that deforms continuously, while blending binary values only cross-fades.
// Sign convention: negative inside the shape, positive outside, with the
// zero level set on the boundary (d(x, FG) - d(x, BG)).

use image::GrayImage;
use rayon::prelude::*;

const INF: f64 = 1e20;

/// Squared Euclidean distance from every pixel to the nearest pixel of the
/// indicated set (`foreground = true` → distance to mask > 0 pixels).
/// Pixels of a set that is empty everywhere end up at `INF`.
///
/// Exact EDT: 1D lower-envelope passes over columns, then rows. Rows are
/// independent in the second pass and run in parallel.
pub fn squared_distance(mask: &GrayImage, foreground: bool) -> Vec<f64> {
    let (w, h) = mask.dimensions();
    let (w, h) = (w as usize, h as usize);

    // Column pass over the 0/INF indicator grid.
    let columns: Vec<Vec<f64>> = (0..w)
        .into_par_iter()
        .map(|x| {
            let mut f = vec![0.0f64; h];
            for (y, fy) in f.iter_mut().enumerate() {
                let set = mask.get_pixel(x as u32, y as u32).0[0] > 0;
                *fy = if set == foreground { 0.0 } else { INF };
            }
            distance_1d(&f)
        })
        .collect();

    // Row pass over the column results.
    let mut grid = vec![0.0f64; w * h];
    grid.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        let f: Vec<f64> = (0..w).map(|x| columns[x][y]).collect();
        row.copy_from_slice(&distance_1d(&f));
    });
    grid
}

/// Signed Euclidean distance field of a binary mask:
/// `d(x, foreground) - d(x, background)`. Foreground pixels are strictly
/// negative, background pixels strictly positive; a mask with no foreground
/// at all is positive `INF`-scale everywhere, which one-sided interpolation
/// relies on upstream.
pub fn signed_distance_field(mask: &GrayImage) -> Vec<f64> {
    let outside = squared_distance(mask, true);
    let inside = squared_distance(mask, false);
    outside
        .iter()
        .zip(inside.iter())
        .map(|(o, i)| o.min(INF).sqrt() - i.min(INF).sqrt())
        .collect()
}

/// One-dimensional squared distance transform (lower envelope of parabolas).
fn distance_1d(f: &[f64]) -> Vec<f64> {
    let n = f.len();
    if n == 0 {
        return Vec::new();
    }
    let mut d = vec![0.0f64; n];
    let mut v = vec![0usize; n];
    let mut z = vec![0.0f64; n + 1];

    let mut k = 0usize;
    v[0] = 0;
    z[0] = -INF;
    z[1] = INF;
    for q in 1..n {
        let mut s = intersect(f, q, v[k]);
        while s <= z[k] {
            k -= 1;
            s = intersect(f, q, v[k]);
        }
        k += 1;
        v[k] = q;
        z[k] = s;
        z[k + 1] = INF;
    }

    k = 0;
    for (q, dq) in d.iter_mut().enumerate() {
        while z[k + 1] < q as f64 {
            k += 1;
        }
        let dist = q as f64 - v[k] as f64;
        *dq = dist * dist + f[v[k]];
    }
    d
}

/// Horizontal position where the parabolas rooted at `q` and `p` intersect.
#[inline(always)]
fn intersect(f: &[f64], q: usize, p: usize) -> f64 {
    let (qf, pf) = (q as f64, p as f64);
    ((f[q] + qf * qf) - (f[p] + pf * pf)) / (2.0 * qf - 2.0 * pf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn mask_from(rows: &[&[u8]]) -> GrayImage {
        let h = rows.len() as u32;
        let w = rows[0].len() as u32;
        let mut img = GrayImage::new(w, h);
        for (y, row) in rows.iter().enumerate() {
            for (x, v) in row.iter().enumerate() {
                img.put_pixel(x as u32, y as u32, Luma([*v]));
            }
        }
        img
    }

    #[test]
    fn single_pixel_distances_are_exact() {
        let mask = mask_from(&[
            &[0, 0, 0],
            &[0, 255, 0],
            &[0, 0, 0],
        ]);
        let d = squared_distance(&mask, true);
        // Squared distances to the center pixel
        assert_eq!(d[1 * 3 + 1], 0.0);
        assert_eq!(d[1 * 3 + 0], 1.0);
        assert_eq!(d[0 * 3 + 1], 1.0);
        assert_eq!(d[0 * 3 + 0], 2.0);
        assert_eq!(d[2 * 3 + 2], 2.0);
    }

    #[test]
    fn signed_field_is_negative_inside_positive_outside() {
        let mask = mask_from(&[
            &[0, 0, 0, 0, 0],
            &[0, 255, 255, 255, 0],
            &[0, 255, 255, 255, 0],
            &[0, 255, 255, 255, 0],
            &[0, 0, 0, 0, 0],
        ]);
        let sd = signed_distance_field(&mask);
        let at = |x: usize, y: usize| sd[y * 5 + x];
        assert!(at(2, 2) < at(1, 1)); // deeper inside is more negative
        assert!(at(1, 1) < 0.0);
        assert!(at(0, 0) > 0.0);
        assert!(at(4, 2) > 0.0);
        // Border foreground pixel: distance 1 to background → -1
        assert_eq!(at(1, 2), -1.0);
        // First background pixel outside: distance 1 to foreground → +1
        assert_eq!(at(0, 2), 1.0);
    }

    #[test]
    fn empty_mask_is_positive_everywhere() {
        let mask = GrayImage::new(4, 4);
        let sd = signed_distance_field(&mask);
        assert!(sd.iter().all(|v| *v > 0.0));
    }

    #[test]
    fn full_mask_is_negative_everywhere() {
        let mut mask = GrayImage::new(4, 4);
        for p in mask.pixels_mut() {
            *p = Luma([255]);
        }
        let sd = signed_distance_field(&mask);
        assert!(sd.iter().all(|v| *v < 0.0));
    }
}
