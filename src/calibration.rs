use nalgebra::{DMatrix, DVector};

use crate::error::CalibrationError;
use crate::structs::{CalibrationDataset, GazePoint};

/// `[1, x, y, x², y², xy, x²y²]`
pub const POLYNOMIAL_TERMS: usize = 7;

fn polynomial_terms(x: f64, y: f64) -> [f64; POLYNOMIAL_TERMS] {
    [1.0, x, y, x * x, y * y, x * y, x * x * y * y]
}

/// Fitted map from normalised pupil position to centred screen position.
#[derive(Clone, Debug, PartialEq)]
pub struct GazeMapping {
    pub coeffs_x: [f64; POLYNOMIAL_TERMS],
    pub coeffs_y: [f64; POLYNOMIAL_TERMS],
    pub inliers: usize,
    pub samples: usize,
    /// Residual over the inliers, in frame pixels.
    pub rms_error_px: f64,
}

impl GazeMapping {
    pub fn map(&self, norm_pos: (f32, f32)) -> GazePoint {
        let terms = polynomial_terms(norm_pos.0 as f64, norm_pos.1 as f64);
        let dot = |coeffs: &[f64; POLYNOMIAL_TERMS]| -> f64 {
            coeffs.iter().zip(terms.iter()).map(|(c, t)| c * t).sum()
        };
        GazePoint::new(dot(&self.coeffs_x) as f32, dot(&self.coeffs_y) as f32)
    }
}

#[derive(Clone, Debug)]
pub struct CalibrationSolver {
    frame_size: (u32, u32),
    outlier_threshold_px: f64,
}

impl CalibrationSolver {
    pub fn new(frame_size: (u32, u32), outlier_threshold_px: f32) -> Self {
        Self {
            frame_size,
            outlier_threshold_px: outlier_threshold_px as f64,
        }
    }

    /// Least-squares fit, one outlier rejection pass, then a refit on the
    /// inliers.
    pub fn fit(&self, dataset: &CalibrationDataset) -> Result<GazeMapping, CalibrationError> {
        let points: Vec<([f64; 2], [f64; 2])> = dataset
            .pairs()
            .iter()
            .map(|pair| {
                (
                    [pair.pupil.norm_pos.0 as f64, pair.pupil.norm_pos.1 as f64],
                    [
                        pair.reference.position.0 as f64,
                        pair.reference.position.1 as f64,
                    ],
                )
            })
            .filter(|(p, r)| p.iter().chain(r.iter()).all(|v| v.is_finite()))
            .collect();

        if points.len() < POLYNOMIAL_TERMS {
            return Err(CalibrationError::InsufficientData {
                got: points.len(),
                needed: POLYNOMIAL_TERMS,
            });
        }

        let (coeffs_x, coeffs_y) = solve(&points)?;
        let errors: Vec<f64> = points
            .iter()
            .map(|point| self.error_px(&coeffs_x, &coeffs_y, point))
            .collect();

        let inliers: Vec<([f64; 2], [f64; 2])> = points
            .iter()
            .zip(errors.iter())
            .filter(|(_, err)| **err < self.outlier_threshold_px)
            .map(|(point, _)| *point)
            .collect();

        if inliers.len() < POLYNOMIAL_TERMS {
            return Err(CalibrationError::NotConverged {
                inliers: inliers.len(),
                needed: POLYNOMIAL_TERMS,
            });
        }

        let (coeffs_x, coeffs_y) = solve(&inliers)?;
        let squared: f64 = inliers
            .iter()
            .map(|point| self.error_px(&coeffs_x, &coeffs_y, point).powi(2))
            .sum();

        let mapping = GazeMapping {
            coeffs_x,
            coeffs_y,
            inliers: inliers.len(),
            samples: points.len(),
            rms_error_px: (squared / inliers.len() as f64).sqrt(),
        };
        log::info!(
            "Calibration fit: {}/{} inliers, rms {:.2}px, x={:?} y={:?}",
            mapping.inliers,
            mapping.samples,
            mapping.rms_error_px,
            mapping.coeffs_x,
            mapping.coeffs_y
        );
        Ok(mapping)
    }

    fn error_px(
        &self,
        coeffs_x: &[f64; POLYNOMIAL_TERMS],
        coeffs_y: &[f64; POLYNOMIAL_TERMS],
        (pupil, reference): &([f64; 2], [f64; 2]),
    ) -> f64 {
        let terms = polynomial_terms(pupil[0], pupil[1]);
        let gx: f64 = coeffs_x.iter().zip(terms.iter()).map(|(c, t)| c * t).sum();
        let gy: f64 = coeffs_y.iter().zip(terms.iter()).map(|(c, t)| c * t).sum();
        // Centred units span 2, so half the frame size per unit.
        let dx = (gx - reference[0]) * self.frame_size.0 as f64 / 2.0;
        let dy = (gy - reference[1]) * self.frame_size.1 as f64 / 2.0;
        (dx * dx + dy * dy).sqrt()
    }
}

type Coefficients = [f64; POLYNOMIAL_TERMS];

fn solve(points: &[([f64; 2], [f64; 2])]) -> Result<(Coefficients, Coefficients), CalibrationError> {
    let n = points.len();
    let a = DMatrix::<f64>::from_fn(n, POLYNOMIAL_TERMS, |r, c| {
        polynomial_terms(points[r].0[0], points[r].0[1])[c]
    });
    let bx = DVector::<f64>::from_iterator(n, points.iter().map(|(_, r)| r[0]));
    let by = DVector::<f64>::from_iterator(n, points.iter().map(|(_, r)| r[1]));

    let svd = a.svd(true, true);
    let max_singular = svd.singular_values.max();
    let eps = (max_singular * 1e-9).max(f64::MIN_POSITIVE);
    let rank = svd.rank(eps);
    if rank < POLYNOMIAL_TERMS {
        return Err(CalibrationError::IllConditioned {
            rank,
            needed: POLYNOMIAL_TERMS,
        });
    }

    let not_converged = || CalibrationError::NotConverged {
        inliers: n,
        needed: POLYNOMIAL_TERMS,
    };
    let x = svd.solve(&bx, eps).map_err(|_| not_converged())?;
    let y = svd.solve(&by, eps).map_err(|_| not_converged())?;

    let mut coeffs_x = [0.0; POLYNOMIAL_TERMS];
    let mut coeffs_y = [0.0; POLYNOMIAL_TERMS];
    coeffs_x.copy_from_slice(x.as_slice());
    coeffs_y.copy_from_slice(y.as_slice());

    if coeffs_x.iter().chain(coeffs_y.iter()).any(|c| !c.is_finite()) {
        return Err(not_converged());
    }
    Ok((coeffs_x, coeffs_y))
}
