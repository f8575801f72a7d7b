//! Numeric kernels behind the calibration model: a bounded least-squares fit
//! of `a * e^(b * x) + c`, an ordinary least-squares polynomial fit, and the
//! coefficient of determination used to grade both.

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use std::{borrow::Cow, fmt};

/// Starting point `(a, b, c)` of every exponential fit. Also the parameters a
/// cell falls back to when its fit fails.
pub const EXP_START: [f64; 3] = [0.05, 0.05, 100.0];

/// Lower bounds on `(a, b, c)`.
pub const EXP_LOWER: [f64; 3] = [0.00001, 0.00001, 0.0];

/// Upper bounds on `(a, b, c)`.
pub const EXP_UPPER: [f64; 3] = [100.0, 10.0, 500.0];

const MAX_ITERATIONS: usize = 1000;
const FTOL: f64 = 1e-10;
const XTOL: f64 = 1e-10;
const GTOL: f64 = 1e-10;
const COST_FLOOR: f64 = 1e-20;
const RELATIVE_COST_FLOOR: f64 = 1e-14;
const LAMBDA_START: f64 = 1e-3;
const LAMBDA_MIN: f64 = 1e-12;
const LAMBDA_MAX: f64 = 1e16;
const DIAG_FLOOR: f64 = 1e-12;
const SVD_RELATIVE_EPS: f64 = 1e-12;

/// Why a single curve could not be fitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitError {
    /// The optimiser ran out of iterations before settling.
    OptimizerDivergence,

    /// The least-squares system had no usable solution.
    SingularSystem,

    /// Fewer than two points were left to fit.
    TooFewPoints(usize),
}

impl fmt::Display for FitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FitError::OptimizerDivergence => Cow::from("optimizer failed to converge"),
            FitError::SingularSystem => Cow::from("least squares system is singular"),
            FitError::TooFewPoints(n) => Cow::from(format!("only {} points to fit", n)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for FitError {}

/// Evaluates `a * e^(b * x) + c`.
pub fn exponential(x: f64, params: &[f64]) -> f64 {
    params[0] * (params[1] * x).exp() + params[2]
}

/// Evaluates a polynomial whose coefficients are ordered from the constant
/// term up.
pub fn polynomial(x: f64, coeffs: &[f64]) -> f64 {
    coeffs.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

// The exponential solver works on `q = (ln a, b, c)`. Along the valley
// `a * e^(b * x) = y` the log keeps the problem close to linear in `(q0, q1)`.

fn solver_lower() -> Vector3<f64> {
    Vector3::new(EXP_LOWER[0].ln(), EXP_LOWER[1], EXP_LOWER[2])
}

fn solver_upper() -> Vector3<f64> {
    Vector3::new(EXP_UPPER[0].ln(), EXP_UPPER[1], EXP_UPPER[2])
}

fn project(q: Vector3<f64>, lower: &Vector3<f64>, upper: &Vector3<f64>) -> Vector3<f64> {
    Vector3::from_fn(|i, _| q[i].clamp(lower[i], upper[i]))
}

fn to_params(q: &Vector3<f64>) -> [f64; 3] {
    [q[0].exp().clamp(EXP_LOWER[0], EXP_UPPER[0]), q[1], q[2]]
}

fn exp_cost(xs: &[f64], ys: &[f64], q: &Vector3<f64>) -> f64 {
    0.5 * xs
        .iter()
        .zip(ys)
        .map(|(&x, &y)| ((q[0] + q[1] * x).exp() + q[2] - y).powi(2))
        .sum::<f64>()
}

/// `J^T J` and `J^T r` of the exponential residuals at `q`.
fn exp_normal_equations(xs: &[f64], ys: &[f64], q: &Vector3<f64>) -> (Matrix3<f64>, Vector3<f64>) {
    let mut jtj = Matrix3::zeros();
    let mut jtr = Vector3::zeros();
    for (&x, &y) in xs.iter().zip(ys) {
        let e = (q[0] + q[1] * x).exp();
        let row = Vector3::new(e, x * e, 1.0);
        let residual = e + q[2] - y;
        jtj += row * row.transpose();
        jtr += row * residual;
    }
    (jtj, jtr)
}

/// Fits `a * e^(b * x) + c` to the points, keeping every parameter inside
/// [`EXP_LOWER`]..=[`EXP_UPPER`].
///
/// This is a bounded Levenberg-Marquardt. A parameter sitting on a bound
/// with the gradient pushing it outwards is held fixed for the step, the
/// damped Gauss-Newton step is taken in the others and clipped back into
/// the box, and it is only kept if it lowers the cost. The fit is done when
/// one of these holds:
///
/// - the cost is negligible next to the targets,
/// - no free parameter's Jacobian column is correlated with the residual
///   (first-order optimality under the bounds),
/// - an accepted step barely changes the cost or the parameters,
/// - no amount of damping finds a lower cost.
pub fn fit_exponential(xs: &[f64], ys: &[f64]) -> Result<[f64; 3], FitError> {
    if xs.len() < 2 {
        return Err(FitError::TooFewPoints(xs.len()));
    }

    let (lower, upper) = (solver_lower(), solver_upper());
    let mut q = project(
        Vector3::new(EXP_START[0].ln(), EXP_START[1], EXP_START[2]),
        &lower,
        &upper,
    );
    let mut cost = exp_cost(xs, ys, &q);
    if !cost.is_finite() {
        return Err(FitError::OptimizerDivergence);
    }
    let floor = (RELATIVE_COST_FLOOR * 0.5 * ys.iter().map(|y| y * y).sum::<f64>()).max(COST_FLOOR);
    let mut lambda = LAMBDA_START;

    for _ in 0..MAX_ITERATIONS {
        if cost <= floor {
            return Ok(to_params(&q));
        }

        let (jtj, jtr) = exp_normal_equations(xs, ys, &q);
        let free: Vec<usize> = (0..3)
            .filter(|&i| {
                let held_low = q[i] <= lower[i] && jtr[i] > 0.0;
                let held_high = q[i] >= upper[i] && jtr[i] < 0.0;
                !(held_low || held_high)
            })
            .collect();

        let optimality = free
            .iter()
            .filter(|&&i| jtj[(i, i)] > 0.0)
            .map(|&i| jtr[i].abs() / jtj[(i, i)].sqrt())
            .fold(0.0, f64::max);
        if optimality <= GTOL * (2.0 * cost).sqrt() {
            return Ok(to_params(&q));
        }

        let n = free.len();
        let rhs = DVector::from_fn(n, |r, _| -jtr[free[r]]);
        let mut accepted = None;
        while lambda <= LAMBDA_MAX {
            let damped = DMatrix::from_fn(n, n, |r, c| {
                let (i, j) = (free[r], free[c]);
                if i == j {
                    jtj[(i, i)] + lambda * jtj[(i, i)].max(DIAG_FLOOR)
                } else {
                    jtj[(i, j)]
                }
            });
            if let Some(chol) = damped.cholesky() {
                let step = chol.solve(&rhs);
                let mut moved = q;
                for (k, &i) in free.iter().enumerate() {
                    moved[i] += step[k];
                }
                let candidate = project(moved, &lower, &upper);
                let candidate_cost = exp_cost(xs, ys, &candidate);
                if candidate_cost.is_finite() && candidate_cost < cost {
                    accepted = Some((candidate, candidate_cost));
                    lambda = (lambda * 0.1).max(LAMBDA_MIN);
                    break;
                }
            }
            lambda *= 10.0;
        }

        let Some((candidate, candidate_cost)) = accepted else {
            return Ok(to_params(&q));
        };

        let step = (candidate - q).norm();
        let reduction = cost - candidate_cost;
        q = candidate;
        cost = candidate_cost;

        if reduction <= FTOL * cost || step <= XTOL * (q.norm() + XTOL) {
            return Ok(to_params(&q));
        }
    }

    Err(FitError::OptimizerDivergence)
}

/// Rewrites `sum(c[k] * (alpha * x + beta)^k)` as plain coefficients of `x`.
fn to_power_basis(mapped: &[f64], alpha: f64, beta: f64) -> Vec<f64> {
    let Some((&highest, rest)) = mapped.split_last() else {
        return Vec::new();
    };

    // Horner's scheme, multiplying by the linear map at each step
    let mut acc = vec![highest];
    for &c in rest.iter().rev() {
        let mut next = vec![0.0; acc.len() + 1];
        for (i, v) in acc.iter().enumerate() {
            next[i] += beta * v;
            next[i + 1] += alpha * v;
        }
        next[0] += c;
        acc = next;
    }
    acc
}

/// Least-squares fit of a degree `degree` polynomial. Returns `degree + 1`
/// coefficients from the constant term up.
///
/// The points are mapped onto `[-1, 1]` before solving, which keeps the
/// Vandermonde system well conditioned for raw values up to 255. With fewer
/// points than coefficients the minimum-norm solution is returned.
pub fn fit_polynomial(xs: &[f64], ys: &[f64], degree: usize) -> Result<Vec<f64>, FitError> {
    if xs.len() < 2 {
        return Err(FitError::TooFewPoints(xs.len()));
    }

    let lo = xs.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let half_span = (hi - lo) / 2.0;
    let (alpha, beta) = if half_span > 0.0 {
        (1.0 / half_span, -(hi + lo) / 2.0 / half_span)
    } else {
        (0.0, 0.0)
    };

    let vandermonde = DMatrix::from_fn(xs.len(), degree + 1, |i, j| {
        (alpha * xs[i] + beta).powi(j as i32)
    });
    let targets = DVector::from_column_slice(ys);

    let svd = vandermonde.svd(true, true);
    let eps = svd.singular_values.max() * SVD_RELATIVE_EPS;
    let mapped = svd
        .solve(&targets, eps)
        .map_err(|_| FitError::SingularSystem)?;
    if mapped.iter().any(|c| !c.is_finite()) {
        return Err(FitError::SingularSystem);
    }

    Ok(to_power_basis(mapped.as_slice(), alpha, beta))
}

/// The coefficient of determination, `1 - SS_res / SS_tot`, of `model` on the
/// points.
///
/// Targets with no variance make the ratio undefined; they score 1 when the
/// model hits them exactly and 0 otherwise. No points at all scores 0.
pub fn r_squared(xs: &[f64], ys: &[f64], model: impl Fn(f64) -> f64) -> f64 {
    if ys.is_empty() {
        return 0.0;
    }

    let mean = ys.iter().sum::<f64>() / ys.len() as f64;
    let ss_res: f64 = xs.iter().zip(ys).map(|(&x, &y)| (y - model(x)).powi(2)).sum();
    let ss_tot: f64 = ys.iter().map(|y| (y - mean).powi(2)).sum();

    if ss_tot <= f64::EPSILON * mean.abs().max(1.0) {
        if ss_res <= 1e-12 {
            1.0
        } else {
            0.0
        }
    } else {
        1.0 - ss_res / ss_tot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polynomial_evaluates_constant_term_first() {
        // 1 + 2x + 3x^2
        assert_eq!(polynomial(2.0, &[1.0, 2.0, 3.0]), 17.0);
        assert_eq!(polynomial(5.0, &[]), 0.0);
    }

    #[test]
    fn power_basis_matches_mapped_evaluation() {
        let mapped = [0.5, -1.25, 2.0, 0.75];
        let (alpha, beta) = (1.0 / 127.5, -1.0);
        let plain = to_power_basis(&mapped, alpha, beta);

        for x in [0.0, 13.0, 127.5, 200.0, 255.0] {
            let expected = polynomial(alpha * x + beta, &mapped);
            assert!((polynomial(x, &plain) - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn quadratic_is_recovered_exactly() {
        let xs = [0.0, 32.0, 64.0, 128.0, 255.0];
        let ys: Vec<f64> = xs.iter().map(|x| 1.0 + 0.001 * x + 0.001 * x * x).collect();

        let coeffs = fit_polynomial(&xs, &ys, 2).unwrap();
        assert_eq!(coeffs.len(), 3);
        assert!((coeffs[0] - 1.0).abs() < 1e-8);
        assert!((coeffs[1] - 0.001).abs() < 1e-9);
        assert!((coeffs[2] - 0.001).abs() < 1e-11);
    }

    #[test]
    fn identical_inputs_fit_their_mean() {
        let coeffs = fit_polynomial(&[10.0, 10.0, 10.0], &[1.0, 2.0, 3.0], 2).unwrap();
        for x in [0.0, 10.0, 255.0] {
            assert!((polynomial(x, &coeffs) - 2.0).abs() < 1e-9);
        }
    }

    #[test]
    fn exponential_recovers_its_own_curve() {
        let truth = [0.1, 0.03, 20.0];
        let xs = [0.0, 40.0, 80.0, 120.0, 160.0, 200.0];
        let ys: Vec<f64> = xs.iter().map(|&x| exponential(x, &truth)).collect();

        let fitted = fit_exponential(&xs, &ys).unwrap();
        for (&x, &y) in xs.iter().zip(&ys) {
            let got = exponential(x, &fitted);
            assert!((got - y).abs() / y < 0.01, "at {}: {} vs {}", x, got, y);
        }
        assert!(r_squared(&xs, &ys, |x| exponential(x, &fitted)) > 0.999);
    }

    #[test]
    fn exponential_respects_bounds() {
        // this data wants a negative offset, which the bounds forbid
        let xs: [f64; 4] = [0.0, 50.0, 100.0, 150.0];
        let ys: Vec<f64> = xs.iter().map(|&x| (0.02 * x).exp() - 30.0).collect();

        let fitted = fit_exponential(&xs, &ys).unwrap();
        for i in 0..3 {
            assert!(fitted[i] >= EXP_LOWER[i] && fitted[i] <= EXP_UPPER[i]);
        }
    }

    #[test]
    fn exponential_settles_on_quadratic_data() {
        // bending like a quadratic needs c < 0, so the fit ends on the c = 0 bound
        let quadratic = |x: f64| 1.0 + 0.001 * x + 0.001 * x * x;
        for xs in [vec![0.0, 32.0, 64.0, 128.0], vec![0.0, 32.0, 64.0, 128.0, 255.0]] {
            let ys: Vec<f64> = xs.iter().map(|&x| quadratic(x)).collect();
            let fitted = fit_exponential(&xs, &ys).unwrap();

            assert_eq!(fitted[2], 0.0);
            assert!(r_squared(&xs, &ys, |x| exponential(x, &fitted)) > 0.98);
            let last = *xs.last().unwrap();
            let got = exponential(last, &fitted);
            assert!((got - quadratic(last)).abs() / quadratic(last) < 0.15);
        }
    }

    #[test]
    fn five_point_quadratic_reaches_the_bounded_optimum() {
        let xs = [0.0, 32.0, 64.0, 128.0, 255.0];
        let ys: Vec<f64> = xs.iter().map(|x| 1.0 + 0.001 * x + 0.001 * x * x).collect();
        let fitted = fit_exponential(&xs, &ys).unwrap();

        assert!((fitted[0] - 3.0408).abs() < 1e-3, "a = {}", fitted[0]);
        assert!((fitted[1] - 0.012102).abs() < 1e-5, "b = {}", fitted[1]);
    }

    #[test]
    fn exponential_fits_a_constant() {
        let fitted = fit_exponential(&[0.0, 1.0], &[1.0, 1.0]).unwrap();
        for x in [0.0, 1.0, 128.0, 255.0] {
            assert!((exponential(x, &fitted) - 1.0).abs() < 0.005);
        }
    }

    #[test]
    fn exponential_pinned_near_zero_converges() {
        // the exact fit needs a below its lower bound
        let xs = [0.0, 200.0];
        let ys = [0.0, 600.0];
        let fitted = fit_exponential(&xs, &ys).unwrap();
        assert!((exponential(200.0, &fitted) - 600.0).abs() < 0.01);
        assert!(exponential(0.0, &fitted) < 0.01);
    }

    #[test]
    fn single_point_is_rejected() {
        assert_eq!(
            fit_exponential(&[3.0], &[1.0]),
            Err(FitError::TooFewPoints(1))
        );
        assert_eq!(
            fit_polynomial(&[], &[], 1),
            Err(FitError::TooFewPoints(0))
        );
    }

    #[test]
    fn r_squared_of_constant_targets() {
        let xs = [0.0, 1.0];
        let ys = [4.0, 4.0];
        assert_eq!(r_squared(&xs, &ys, |_| 4.0), 1.0);
        assert_eq!(r_squared(&xs, &ys, |_| 5.0), 0.0);
        assert_eq!(r_squared(&[], &[], |_| 0.0), 0.0);
    }

    #[test]
    fn r_squared_of_mean_model_is_zero() {
        let xs = [0.0, 1.0, 2.0];
        let ys = [1.0, 2.0, 3.0];
        assert!(r_squared(&xs, &ys, |_| 2.0).abs() < 1e-12);
        assert!((r_squared(&xs, &ys, |x| x + 1.0) - 1.0).abs() < 1e-12);
    }
}
