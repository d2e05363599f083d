//! Planar homographies between two views.
//!
//! The homographies in this module map normalized image coordinates of the first camera into
//! normalized image coordinates of the second camera, both in the flipped camera coordinate system.
//! That makes them independent of the camera intrinsics, so [`decompose`] can directly extract the
//! relative motion.

use cv_core::nalgebra::{
    IsometryMatrix3, Matrix3, Point2, Rotation3, SMatrix, Translation3, Vector3,
};
use cv_core::CameraToCamera;
use float_ord::FloatOrd;
use log::trace;
use rand::{seq::index::sample, Rng};

/// Projects a bearing or camera point onto the `z = 1` plane.
pub fn normalized(v: &Vector3<f64>) -> Option<Point2<f64>> {
    (v.z.abs() > f64::EPSILON).then(|| Point2::new(v.x / v.z, v.y / v.z))
}

/// Maps a normalized point with a homography.
pub fn transfer(homography: &Matrix3<f64>, point: &Point2<f64>) -> Option<Point2<f64>> {
    normalized(&(homography * point.to_homogeneous()))
}

/// Computes a homography with the direct linear transform from at least four point pairs.
///
/// The result is scaled so that its Frobenius norm is one.
pub fn homography_dlt(pairs: &[(Point2<f64>, Point2<f64>)]) -> Option<Matrix3<f64>> {
    if pairs.len() < 4 {
        return None;
    }

    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (p, q) in pairs {
        let p = p.to_homogeneous();
        let rows = [
            [
                0.0,
                0.0,
                0.0,
                -p.x,
                -p.y,
                -p.z,
                q.y * p.x,
                q.y * p.y,
                q.y * p.z,
            ],
            [
                p.x,
                p.y,
                p.z,
                0.0,
                0.0,
                0.0,
                -q.x * p.x,
                -q.x * p.y,
                -q.x * p.z,
            ],
        ];
        for row in rows {
            let row = SMatrix::<f64, 1, 9>::from_row_slice(&row);
            ata += row.transpose() * row;
        }
    }

    let se = ata.try_symmetric_eigen(1e-12, 1000)?;
    let (ix, _) = se
        .eigenvalues
        .iter()
        .enumerate()
        .min_by_key(|&(_, &n)| FloatOrd(n))?;
    let h = se.eigenvectors.column(ix);
    let homography = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);
    let norm = homography.norm();
    (norm > f64::EPSILON && homography.iter().all(|v| v.is_finite())).then(|| homography / norm)
}

/// Estimates a homography with RANSAC over minimal four point samples.
///
/// `maximal_sqr_error` is the squared transfer error in normalized coordinates. The winning
/// hypothesis is refit on all its inliers.
pub fn homography_ransac(
    pairs: &[(Point2<f64>, Point2<f64>)],
    iterations: usize,
    maximal_sqr_error: f64,
    rng: &mut impl Rng,
) -> Option<(Matrix3<f64>, Vec<usize>)> {
    if pairs.len() < 4 {
        return None;
    }

    let inliers_of = |homography: &Matrix3<f64>| -> Vec<usize> {
        pairs
            .iter()
            .enumerate()
            .filter(|(_, (p, q))| {
                transfer(homography, p)
                    .map_or(false, |t| (t - q).norm_squared() <= maximal_sqr_error)
            })
            .map(|(ix, _)| ix)
            .collect()
    };

    let mut best: Option<(Matrix3<f64>, Vec<usize>)> = None;
    for _ in 0..iterations {
        let minimal: Vec<_> = sample(rng, pairs.len(), 4)
            .into_iter()
            .map(|ix| pairs[ix])
            .collect();
        let homography = match homography_dlt(&minimal) {
            Some(homography) => homography,
            None => continue,
        };
        let inliers = inliers_of(&homography);
        if best
            .as_ref()
            .map_or(true, |(_, best)| inliers.len() > best.len())
        {
            best = Some((homography, inliers));
        }
    }

    let (homography, inliers) = best?;
    let subset: Vec<_> = inliers.iter().map(|&ix| pairs[ix]).collect();
    let refined = homography_dlt(&subset).unwrap_or(homography);
    let refined_inliers = inliers_of(&refined);
    trace!(
        "homography ransac kept {} of {} pairs",
        refined_inliers.len(),
        pairs.len()
    );
    if refined_inliers.len() >= inliers.len() {
        Some((refined, refined_inliers))
    } else {
        Some((homography, inliers))
    }
}

/// Decomposes a homography into the motion hypotheses it may stem from.
///
/// Up to eight `second_T_first` candidates with unit translation are returned. A homography
/// whose singular values are (nearly) equal stems from a pure rotation or a degenerate
/// configuration and yields no candidates, since the translation cannot be recovered.
pub fn decompose(homography: &Matrix3<f64>) -> Vec<CameraToCamera> {
    let svd = homography.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return vec![],
    };

    // Sort the singular values in descending order together with their vectors.
    let mut order = [0usize, 1, 2];
    order.sort_by_key(|&ix| std::cmp::Reverse(FloatOrd(svd.singular_values[ix])));
    let u = Matrix3::from_columns(&[u.column(order[0]), u.column(order[1]), u.column(order[2])]);
    let v_t = Matrix3::from_rows(&[v_t.row(order[0]), v_t.row(order[1]), v_t.row(order[2])]);
    let v = v_t.transpose();
    let [d1, d2, d3] = order.map(|ix| svd.singular_values[ix]);

    if d3 <= f64::EPSILON || d1 / d2 < 1.00001 || d2 / d3 < 1.00001 {
        return vec![];
    }

    let s = u.determinant() * v_t.determinant();
    let aux1 = ((d1 * d1 - d2 * d2) / (d1 * d1 - d3 * d3)).sqrt();
    let aux3 = ((d2 * d2 - d3 * d3) / (d1 * d1 - d3 * d3)).sqrt();
    let x1 = [aux1, aux1, -aux1, -aux1];
    let x3 = [aux3, -aux3, aux3, -aux3];

    let mut candidates = Vec::with_capacity(8);
    let mut push = |rp: Matrix3<f64>, tp: Vector3<f64>, np: Vector3<f64>| {
        let rotation = s * u * rp * v_t;
        let mut translation = u * tp;
        let normal = v * np;
        if normal.z < 0.0 {
            translation = -translation;
        }
        let norm = translation.norm();
        if norm <= f64::EPSILON || !rotation.iter().all(|v| v.is_finite()) {
            return;
        }
        candidates.push(CameraToCamera(IsometryMatrix3::from_parts(
            Translation3::from(translation / norm),
            Rotation3::from_matrix(&rotation),
        )));
    };

    // d' > 0
    let aux_stheta = ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).sqrt() / ((d1 + d3) * d2);
    let ctheta = (d2 * d2 + d1 * d3) / ((d1 + d3) * d2);
    let stheta = [aux_stheta, -aux_stheta, -aux_stheta, aux_stheta];
    for i in 0..4 {
        let rp = Matrix3::new(
            ctheta, 0.0, -stheta[i], 0.0, 1.0, 0.0, stheta[i], 0.0, ctheta,
        );
        let tp = Vector3::new(x1[i], 0.0, -x3[i]) * (d1 - d3);
        push(rp, tp, Vector3::new(x1[i], 0.0, x3[i]));
    }

    // d' < 0
    let aux_sphi = ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).sqrt() / ((d1 - d3) * d2);
    let cphi = (d1 * d3 - d2 * d2) / ((d1 - d3) * d2);
    let sphi = [aux_sphi, -aux_sphi, -aux_sphi, aux_sphi];
    for i in 0..4 {
        let rp = Matrix3::new(cphi, 0.0, sphi[i], 0.0, -1.0, 0.0, sphi[i], 0.0, -cphi);
        let tp = Vector3::new(x1[i], 0.0, x3[i]) * (d1 + d3);
        push(rp, tp, Vector3::new(x1[i], 0.0, x3[i]));
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use cv_core::Pose;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    /// Points on the plane `z = 4` seen from the identity and from a moved camera.
    fn planar_pairs(
        second_t_first: &IsometryMatrix3<f64>,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Vec<(Point2<f64>, Point2<f64>)> {
        (0..60)
            .map(|_| {
                let point = cv_core::nalgebra::Point3::new(
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-1.5..1.5),
                    4.0,
                );
                let second = second_t_first * point;
                (
                    normalized(&point.coords).unwrap(),
                    normalized(&second.coords).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn dlt_transfers_exact_pairs() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let motion = IsometryMatrix3::from_parts(
            Translation3::new(0.3, 0.05, -0.1),
            Rotation3::new(Vector3::new(0.02, -0.05, 0.01)),
        );
        let pairs = planar_pairs(&motion, &mut rng);
        let homography = homography_dlt(&pairs).unwrap();
        for (p, q) in &pairs {
            assert_relative_eq!(transfer(&homography, p).unwrap(), q, epsilon = 1e-8);
        }
    }

    #[test]
    fn decomposition_contains_true_motion() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(2);
        let motion = IsometryMatrix3::from_parts(
            Translation3::new(0.4, -0.1, 0.05),
            Rotation3::new(Vector3::new(0.03, 0.06, -0.02)),
        );
        let mut pairs = planar_pairs(&motion, &mut rng);
        for pair in pairs.iter_mut().step_by(6) {
            pair.1.x += 0.2;
        }
        let (homography, inliers) = homography_ransac(&pairs, 200, 1e-6, &mut rng).unwrap();
        assert_eq!(inliers.len(), 50);

        let expected_translation = motion.translation.vector.normalize();
        let found = decompose(&homography).into_iter().any(|candidate| {
            let isometry = candidate.isometry();
            (isometry.rotation.matrix() - motion.rotation.matrix()).norm() < 1e-6
                && (isometry.translation.vector - expected_translation).norm() < 1e-6
        });
        assert!(found);
    }

    #[test]
    fn pure_rotation_yields_no_candidates() {
        let rotation = Rotation3::new(Vector3::new(0.1, -0.05, 0.02));
        assert!(decompose(rotation.matrix()).is_empty());
    }
}
