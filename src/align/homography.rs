//! Planar homography estimation: normalized DLT plus a seeded RANSAC loop.
//!
//! Points are `[x, y]` pixel coordinates. The fitted `H` maps `src` onto
//! `dst`, i.e. `dst ≈ project(H, src)`.

use nalgebra::{Matrix3, SMatrix, SVector, SymmetricEigen, Vector3};
use rand::{rngs::StdRng, Rng, SeedableRng};
use thiserror::Error;

// ---- Errors ----

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HomographyError {
    #[error("too few points: need {needed}, got {got}")]
    TooFewPoints { needed: usize, got: usize },
    #[error("numerical failure: {0}")]
    NumericalFailure(&'static str),
    #[error("insufficient inliers: need {needed}, found {found}")]
    InsufficientInliers { needed: usize, found: usize },
}

// ---- Projection ----

/// `H * [x, y, 1]^T` dehomogenized. `None` at the line at infinity.
pub fn project(h: &Matrix3<f64>, x: f64, y: f64) -> Option<[f64; 2]> {
    let p = h * Vector3::new(x, y, 1.0);
    if p[2].abs() < 1e-12 {
        return None;
    }
    Some([p[0] / p[2], p[1] / p[2]])
}

/// `||project(H, src) - dst||`; infinite when `src` projects to infinity.
pub fn reprojection_error(h: &Matrix3<f64>, src: &[f64; 2], dst: &[f64; 2]) -> f64 {
    match project(h, src[0], src[1]) {
        Some(p) => ((p[0] - dst[0]).powi(2) + (p[1] - dst[1]).powi(2)).sqrt(),
        None => f64::INFINITY,
    }
}

// ---- Hartley normalization ----

/// Translate the centroid to the origin and scale the mean distance to sqrt(2).
fn normalize_points(pts: &[[f64; 2]]) -> (Matrix3<f64>, Vec<[f64; 2]>) {
    let n = pts.len() as f64;
    let cx = pts.iter().map(|p| p[0]).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p[1]).sum::<f64>() / n;
    let mean_dist = pts
        .iter()
        .map(|p| ((p[0] - cx).powi(2) + (p[1] - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = pts.iter().map(|p| [s * (p[0] - cx), s * (p[1] - cy)]).collect();
    (t, normalized)
}

// ---- DLT ----

/// Least-squares homography from four or more correspondences.
pub fn estimate_homography_dlt(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
) -> Result<Matrix3<f64>, HomographyError> {
    if src.len() != dst.len() {
        return Err(HomographyError::NumericalFailure(
            "src and dst lengths differ",
        ));
    }
    if src.len() < 4 {
        return Err(HomographyError::TooFewPoints {
            needed: 4,
            got: src.len(),
        });
    }

    let (t_src, src_n) = normalize_points(src);
    let (t_dst, dst_n) = normalize_points(dst);

    // Accumulate A^T A row by row; the solution is its eigenvector with the
    // smallest eigenvalue.
    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (s, d) in src_n.iter().zip(&dst_n) {
        let (sx, sy) = (s[0], s[1]);
        let (dx, dy) = (d[0], d[1]);
        let r0 = SVector::<f64, 9>::from_column_slice(&[
            0.0,
            0.0,
            0.0,
            -sx,
            -sy,
            -1.0,
            dy * sx,
            dy * sy,
            dy,
        ]);
        let r1 = SVector::<f64, 9>::from_column_slice(&[
            sx,
            sy,
            1.0,
            0.0,
            0.0,
            0.0,
            -dx * sx,
            -dx * sy,
            -dx,
        ]);
        ata += r0 * r0.transpose();
        ata += r1 * r1.transpose();
    }

    let eig = SymmetricEigen::new(ata);
    let min_idx = (0..9)
        .min_by(|&a, &b| {
            eig.eigenvalues[a]
                .abs()
                .total_cmp(&eig.eigenvalues[b].abs())
        })
        .unwrap_or(0);
    let v = eig.eigenvectors.column(min_idx);
    let h_norm = Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]);

    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or(HomographyError::NumericalFailure("normalizer not invertible"))?;
    let h = t_dst_inv * h_norm * t_src;

    let scale = h[(2, 2)];
    if scale.abs() < 1e-12 {
        return Err(HomographyError::NumericalFailure("degenerate homography"));
    }
    Ok(h / scale)
}

// ---- RANSAC ----

#[derive(Debug, Clone, PartialEq)]
pub struct RansacConfig {
    pub max_iters: usize,
    /// Inlier threshold on reprojection error, in pixels.
    pub inlier_threshold: f64,
    pub min_inliers: usize,
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            max_iters: 500,
            inlier_threshold: 3.0,
            min_inliers: 12,
            seed: 0x5eed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RansacResult {
    pub h: Matrix3<f64>,
    pub inlier_mask: Vec<bool>,
    pub n_inliers: usize,
    /// Root-mean-square reprojection error over the inliers.
    pub rms_error: f64,
}

/// Twice the signed area of the triangle `abc`.
fn twice_area(a: &[f64; 2], b: &[f64; 2], c: &[f64; 2]) -> f64 {
    (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
}

/// A minimal sample is usable only when no three of its points are collinear.
fn is_degenerate(pts: &[[f64; 2]; 4]) -> bool {
    const MIN_TWICE_AREA: f64 = 1.0;
    [(0, 1, 2), (0, 1, 3), (0, 2, 3), (1, 2, 3)]
        .iter()
        .any(|&(i, j, k)| twice_area(&pts[i], &pts[j], &pts[k]).abs() < MIN_TWICE_AREA)
}

fn sample_distinct(rng: &mut StdRng, n: usize) -> [usize; 4] {
    let mut idx = [0usize; 4];
    let mut filled = 0;
    while filled < 4 {
        let candidate = rng.gen_range(0..n);
        if !idx[..filled].contains(&candidate) {
            idx[filled] = candidate;
            filled += 1;
        }
    }
    idx
}

fn score(h: &Matrix3<f64>, src: &[[f64; 2]], dst: &[[f64; 2]], threshold: f64) -> (Vec<bool>, usize, f64) {
    let mut mask = vec![false; src.len()];
    let mut count = 0usize;
    let mut sq_sum = 0.0f64;
    for (i, (s, d)) in src.iter().zip(dst).enumerate() {
        let err = reprojection_error(h, s, d);
        if err < threshold {
            mask[i] = true;
            count += 1;
            sq_sum += err * err;
        }
    }
    let rms = if count > 0 {
        (sq_sum / count as f64).sqrt()
    } else {
        f64::INFINITY
    };
    (mask, count, rms)
}

/// Robust homography fit. Deterministic for a given `config.seed`.
pub fn fit_homography_ransac(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
    config: &RansacConfig,
) -> Result<RansacResult, HomographyError> {
    let n = src.len().min(dst.len());
    if n < 4 {
        return Err(HomographyError::TooFewPoints { needed: 4, got: n });
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best: Option<(Matrix3<f64>, usize, f64)> = None;

    for _ in 0..config.max_iters {
        let idx = sample_distinct(&mut rng, n);
        let s4 = idx.map(|i| src[i]);
        let d4 = idx.map(|i| dst[i]);
        if is_degenerate(&s4) || is_degenerate(&d4) {
            continue;
        }
        let Ok(h) = estimate_homography_dlt(&s4, &d4) else {
            continue;
        };

        let (_, count, rms) = score(&h, &src[..n], &dst[..n], config.inlier_threshold);
        let better = match best {
            None => count > 0,
            Some((_, best_count, best_rms)) => {
                count > best_count || (count == best_count && rms < best_rms)
            }
        };
        if better {
            best = Some((h, count, rms));
            if count * 10 > n * 9 {
                break;
            }
        }
    }

    let found = best.map(|(_, c, _)| c).unwrap_or(0);
    let Some((best_h, _, _)) = best.filter(|_| found >= config.min_inliers) else {
        return Err(HomographyError::InsufficientInliers {
            needed: config.min_inliers,
            found,
        });
    };

    // Refit on the consensus set, then re-score.
    let (mask, _, _) = score(&best_h, &src[..n], &dst[..n], config.inlier_threshold);
    let (in_src, in_dst): (Vec<[f64; 2]>, Vec<[f64; 2]>) = (0..n)
        .filter(|&i| mask[i])
        .map(|i| (src[i], dst[i]))
        .unzip();
    let refit = estimate_homography_dlt(&in_src, &in_dst).unwrap_or(best_h);
    let (inlier_mask, n_inliers, rms_error) =
        score(&refit, &src[..n], &dst[..n], config.inlier_threshold);

    if n_inliers < config.min_inliers {
        return Err(HomographyError::InsufficientInliers {
            needed: config.min_inliers,
            found: n_inliers,
        });
    }

    Ok(RansacResult {
        h: refit,
        inlier_mask,
        n_inliers,
        rms_error,
    })
}
