//! Least squares fits used by the apogee predictor.
//!
//! Both fits are solved through the normal equations in f64, the systems are
//! at most 3x3 so this stays cheap enough for every tick.

use libm::{log1p, sqrt};
use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};

use super::{FitModel, WindowPoint};

/// relative determinant below which the normal matrix is treated as singular
const CONDITION_LIMIT: f64 = 1e-12;
/// below this drag constant the closed form is replaced by its k -> 0 limit
const MIN_DRAG_CONSTANT: f64 = 1e-9;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Degenerate {
    NotEnoughSamples,
    Singular,
    /// fitted parameters do not describe a coasting rocket
    NonPhysical,
    NonFinite,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Fit {
    pub model: FitModel,
    /// altitude gain still to come, relative to the newest point
    pub apogee_offset: f64,
    pub sigma: f64,
    pub coefficients: [f64; 3],
}

/// Fit deceleration = c0 + k * v|v| and extrapolate the closed form apogee of a
/// vertical coast under gravity plus quadratic drag.
pub(crate) fn fit_drag<'a>(
    points: impl Iterator<Item = &'a WindowPoint> + Clone,
    newest: &WindowPoint,
) -> Result<Fit, Degenerate> {
    let samples = points.clone().filter_map(|p| {
        p.acceleration
            .map(|a| (drag_regressor(p.velocity as f64), -(a as f64)))
    });

    let mut xtx = Matrix2::<f64>::zeros();
    let mut xty = Vector2::<f64>::zeros();
    let mut n = 0usize;
    for (x, y) in samples.clone() {
        let row = Vector2::new(1.0, x);
        xtx += row * row.transpose();
        xty += row * y;
        n += 1;
    }
    if n < 3 {
        return Err(Degenerate::NotEnoughSamples);
    }

    let inverse = invert_conditioned2(&xtx)?;
    let beta = inverse * xty;
    let c0 = beta[0];
    let k = beta[1].max(0.0);
    if !(c0 > 0.0) {
        return Err(Degenerate::NonPhysical);
    }

    let ssr: f64 = samples
        .map(|(x, y)| {
            let r = y - (beta[0] + beta[1] * x);
            r * r
        })
        .sum();
    let residual_variance = ssr / (n - 2) as f64;
    let covariance = inverse * residual_variance;

    let v = newest.velocity as f64;
    let (apogee_offset, gradient) = drag_apogee_offset(c0, k, v);
    let sigma = sqrt((gradient.transpose() * covariance * gradient)[0].max(0.0));

    check_finite(Fit {
        model: FitModel::Drag,
        apogee_offset,
        sigma,
        coefficients: [c0, k, 0.0],
    })
}

/// Fit altitude = c0 + c1 t + c2 t^2 with t relative to the newest point and
/// return the height of the vertex.
pub(crate) fn fit_quadratic<'a>(
    points: impl Iterator<Item = &'a WindowPoint> + Clone,
    newest: &WindowPoint,
) -> Result<Fit, Degenerate> {
    let samples = points.map(|p| ((p.t - newest.t) as f64, p.altitude as f64));

    let mut xtx = Matrix3::<f64>::zeros();
    let mut xty = Vector3::<f64>::zeros();
    let mut n = 0usize;
    for (t, h) in samples.clone() {
        let row = Vector3::new(1.0, t, t * t);
        xtx += row * row.transpose();
        xty += row * h;
        n += 1;
    }
    if n < 4 {
        return Err(Degenerate::NotEnoughSamples);
    }

    let inverse = invert_conditioned3(&xtx)?;
    let beta = inverse * xty;
    let (c0, c1, c2) = (beta[0], beta[1], beta[2]);
    if !(c2 < 0.0) {
        return Err(Degenerate::NonPhysical);
    }

    let ssr: f64 = samples
        .map(|(t, h)| {
            let r = h - (c0 + c1 * t + c2 * t * t);
            r * r
        })
        .sum();
    let covariance = inverse * (ssr / (n - 3) as f64);

    let vertex = c0 - c1 * c1 / (4.0 * c2);
    let gradient = Vector3::new(1.0, -c1 / (2.0 * c2), c1 * c1 / (4.0 * c2 * c2));
    let sigma = sqrt((gradient.transpose() * covariance * gradient)[0].max(0.0));

    check_finite(Fit {
        model: FitModel::Quadratic,
        apogee_offset: vertex - newest.altitude as f64,
        sigma,
        coefficients: [c0, c1, c2],
    })
}

fn drag_regressor(v: f64) -> f64 {
    v * v.abs()
}

/// Height still to climb from velocity `v` with deceleration c0 + k v^2,
/// and its gradient with respect to (c0, k).
fn drag_apogee_offset(c0: f64, k: f64, v: f64) -> (f64, Vector2<f64>) {
    if v <= 0.0 {
        return (0.0, Vector2::zeros());
    }

    let v2 = v * v;
    if k < MIN_DRAG_CONSTANT {
        let offset = v2 / (2.0 * c0);
        let d_c0 = -v2 / (2.0 * c0 * c0);
        let d_k = -(v2 / c0) * (v2 / c0) / 4.0;
        return (offset, Vector2::new(d_c0, d_k));
    }

    let u = k * v2 / c0;
    let ln = log1p(u);
    let offset = ln / (2.0 * k);
    let d_c0 = -v2 / (2.0 * c0 * c0 * (1.0 + u));
    let d_k = (u / (1.0 + u) - ln) / (2.0 * k * k);
    (offset, Vector2::new(d_c0, d_k))
}

fn invert_conditioned2(m: &Matrix2<f64>) -> Result<Matrix2<f64>, Degenerate> {
    let scale = m[(0, 0)] * m[(1, 1)];
    if !(scale > 0.0) || m.determinant().abs() <= CONDITION_LIMIT * scale {
        return Err(Degenerate::Singular);
    }
    m.try_inverse().ok_or(Degenerate::Singular)
}

fn invert_conditioned3(m: &Matrix3<f64>) -> Result<Matrix3<f64>, Degenerate> {
    let scale = m[(0, 0)] * m[(1, 1)] * m[(2, 2)];
    if !(scale > 0.0) || m.determinant().abs() <= CONDITION_LIMIT * scale {
        return Err(Degenerate::Singular);
    }
    m.try_inverse().ok_or(Degenerate::Singular)
}

fn check_finite(fit: Fit) -> Result<Fit, Degenerate> {
    if fit.apogee_offset.is_finite()
        && fit.sigma.is_finite()
        && fit.coefficients.iter().all(|c| c.is_finite())
    {
        Ok(fit)
    } else {
        Err(Degenerate::NonFinite)
    }
}

/// Closed form apogee of a vertical coast, used by tests and the simulator to
/// generate reference trajectories.
pub fn drag_coast_apogee(altitude: f32, velocity: f32, gravity: f32, drag_constant: f32) -> f32 {
    let (offset, _) = drag_apogee_offset(gravity as f64, drag_constant as f64, velocity as f64);
    altitude + offset as f32
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn point(t: f32, altitude: f32, velocity: f32, acceleration: Option<f32>) -> WindowPoint {
        WindowPoint {
            t,
            altitude,
            velocity,
            acceleration,
        }
    }

    #[test]
    fn drag_fit_recovers_exact_parameters() {
        let (g, k) = (9.81f32, 0.002f32);
        let points: Vec<_> = (0..20)
            .map(|i| {
                let v = 80.0 - i as f32;
                point(i as f32 * 0.01, 100.0, v, Some(-g - k * v * v))
            })
            .collect();
        let newest = points.last().unwrap();

        let fit = fit_drag(points.iter(), newest).unwrap();
        assert_eq!(fit.model, FitModel::Drag);
        assert_relative_eq!(fit.coefficients[0], g as f64, max_relative = 1e-3);
        assert_relative_eq!(fit.coefficients[1], k as f64, max_relative = 1e-2);
        assert!(fit.sigma < 0.5, "sigma {}", fit.sigma);
    }

    #[test]
    fn constant_velocity_is_singular() {
        let points: Vec<_> = (0..20)
            .map(|i| point(i as f32 * 0.01, 100.0, 50.0, Some(-12.0)))
            .collect();
        let newest = points.last().unwrap();
        assert_eq!(
            fit_drag(points.iter(), newest),
            Err(Degenerate::Singular)
        );
    }

    #[test]
    fn quadratic_fit_finds_vertex() {
        // h = 300 - 4.9 (t - 3)^2
        let points: Vec<_> = (0..50)
            .map(|i| {
                let t = i as f32 * 0.02;
                point(t, 300.0 - 4.9 * (t - 3.0) * (t - 3.0), 0.0, None)
            })
            .collect();
        let newest = points.last().unwrap();

        let fit = fit_quadratic(points.iter(), newest).unwrap();
        assert_relative_eq!(
            newest.altitude as f64 + fit.apogee_offset,
            300.0,
            max_relative = 1e-3
        );
    }

    #[test]
    fn convex_altitude_is_rejected() {
        let points: Vec<_> = (0..10)
            .map(|i| {
                let t = i as f32 * 0.1;
                point(t, t * t, 0.0, None)
            })
            .collect();
        let newest = points.last().unwrap();
        assert_eq!(
            fit_quadratic(points.iter(), newest),
            Err(Degenerate::NonPhysical)
        );
    }

    #[test]
    fn closed_form_matches_ballistic_limit() {
        // no drag: v^2 / 2g
        assert_relative_eq!(drag_coast_apogee(0.0, 49.05, 9.81, 0.0), 122.625, max_relative = 1e-4);
        // drag always lowers the apogee
        assert!(drag_coast_apogee(0.0, 49.05, 9.81, 0.001) < 122.0);
        // descending: nothing left to climb
        assert_eq!(drag_coast_apogee(10.0, -3.0, 9.81, 0.001), 10.0);
    }
}
