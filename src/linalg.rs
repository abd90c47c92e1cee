use log::{debug, warn};
use nalgebra::{DMatrix, DVector, Dyn, LU};
use rsparse::data::{Nmrc, Sprs, Symb, Trpl};
use rsparse::{lsolve, lu, sqr, usolve};

use crate::error::{PowerFlowError, Result};

/// Condition estimates at or above this are treated as singular.
pub const SINGULAR_CONDITION: f64 = 1.0 / f64::EPSILON;

/// Real square matrix in either storage.
pub enum RealMatrix {
    Dense(DMatrix<f64>),
    Sparse(Sprs<f64>),
}

impl RealMatrix {
    pub fn dim(&self) -> usize {
        match self {
            RealMatrix::Dense(m) => m.nrows(),
            RealMatrix::Sparse(m) => m.m,
        }
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        match self {
            RealMatrix::Dense(m) => m.clone(),
            RealMatrix::Sparse(m) => {
                let rows = m.to_dense();
                DMatrix::from_fn(m.m, m.n, |i, j| rows[i][j])
            }
        }
    }
}

/// Collects entries of a square matrix; repeated positions are summed.
pub enum Assembly {
    Dense(DMatrix<f64>),
    Sparse(Trpl<f64>),
}

impl Assembly {
    pub fn new(n: usize, sparse: bool) -> Self {
        if sparse {
            let mut t = Trpl::<f64>::new();
            t.m = n;
            t.n = n;
            Assembly::Sparse(t)
        } else {
            Assembly::Dense(DMatrix::zeros(n, n))
        }
    }

    pub fn add(&mut self, i: usize, j: usize, value: f64) {
        match self {
            Assembly::Dense(m) => m[(i, j)] += value,
            Assembly::Sparse(t) => t.append(i, j, value),
        }
    }

    pub fn finish(self) -> RealMatrix {
        match self {
            Assembly::Dense(m) => RealMatrix::Dense(m),
            Assembly::Sparse(mut t) => {
                t.sum_dupl();
                RealMatrix::Sparse(t.to_sprs())
            }
        }
    }
}

enum Factors {
    Dense(LU<f64, Dyn, Dyn>),
    Sparse { symbolic: Symb, numeric: Nmrc<f64> },
}

/// LU factors of a square matrix, reusable across right-hand sides.
pub struct Factorization {
    factors: Factors,
    dim: usize,
    condition: f64,
}

impl Factorization {
    pub fn new(matrix: &RealMatrix) -> Result<Self> {
        let dim = matrix.dim();
        match matrix {
            RealMatrix::Dense(m) => {
                let lu = m.clone().lu();
                let condition = dense_pivot_condition(&lu);
                if !lu.is_invertible() || !(condition < SINGULAR_CONDITION) {
                    return Err(PowerFlowError::SingularMatrix(format!(
                        "{}x{} matrix, condition estimate {:e}",
                        dim, dim, condition
                    )));
                }
                Ok(Self {
                    factors: Factors::Dense(lu),
                    dim,
                    condition,
                })
            }
            RealMatrix::Sparse(a) => {
                let mut symbolic = sqr(a, 1, false);
                let numeric = lu(a, &mut symbolic, 1.0).map_err(|_| {
                    PowerFlowError::SingularMatrix(format!(
                        "{}x{} sparse LU found no pivot",
                        dim, dim
                    ))
                })?;
                let condition = pivot_condition(&numeric.u);
                if !(condition < SINGULAR_CONDITION) {
                    return Err(PowerFlowError::SingularMatrix(format!(
                        "{}x{} matrix, pivot ratio {:e}",
                        dim, dim, condition
                    )));
                }
                Ok(Self {
                    factors: Factors::Sparse { symbolic, numeric },
                    dim,
                    condition,
                })
            }
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Ratio of the largest to the smallest U pivot.
    pub fn condition(&self) -> f64 {
        self.condition
    }

    pub fn solve(&self, rhs: &DVector<f64>) -> Result<DVector<f64>> {
        if rhs.len() != self.dim {
            return Err(PowerFlowError::DimensionMismatch {
                expected: self.dim,
                actual: rhs.len(),
            });
        }

        let x = match &self.factors {
            Factors::Dense(lu) => lu.solve(rhs).ok_or_else(|| {
                PowerFlowError::SingularMatrix("dense LU solve failed".to_string())
            })?,
            Factors::Sparse { symbolic, numeric } => {
                let mut x = vec![0.0; self.dim];
                let mut b = vec![0.0; self.dim];
                ipvec(&numeric.pinv, rhs.as_slice(), &mut x); // x = P*b
                lsolve(&numeric.l, &mut x[..]); // x = L\x
                usolve(&numeric.u, &mut x[..]); // x = U\x
                ipvec(&symbolic.q, &x, &mut b); // b = Q*x
                DVector::from_vec(b)
            }
        };

        if x.iter().any(|v| !v.is_finite()) {
            return Err(PowerFlowError::SingularMatrix(
                "solution contains non-finite values".to_string(),
            ));
        }
        Ok(x)
    }
}

/// Ill-conditioning outcome of a linear solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conditioning {
    pub condition: f64,
    pub ill_conditioned: bool,
}

/// Solves `A x = b` once, flagging ill-conditioning against `ceiling`.
/// Singular matrices are an error; ill-conditioned ones only a diagnostic.
pub fn solve_checked(
    matrix: &RealMatrix,
    rhs: &DVector<f64>,
    ceiling: f64,
) -> Result<(DVector<f64>, Conditioning)> {
    let factorization = Factorization::new(matrix)?;
    let conditioning = check_condition(&factorization, ceiling);
    let x = factorization.solve(rhs)?;
    Ok((x, conditioning))
}

pub fn check_condition(factorization: &Factorization, ceiling: f64) -> Conditioning {
    let condition = factorization.condition();
    let ill_conditioned = condition > ceiling;
    if ill_conditioned {
        warn!(
            "Matrix of order {} is ill-conditioned (condition estimate {:e})",
            factorization.dim(),
            condition
        );
    } else {
        debug!("Condition estimate {:e}", condition);
    }
    Conditioning {
        condition,
        ill_conditioned,
    }
}

fn dense_pivot_condition(lu: &LU<f64, Dyn, Dyn>) -> f64 {
    pivot_ratio(lu.u().diagonal().iter().map(|p| p.abs()))
}

fn pivot_condition(u: &Sprs<f64>) -> f64 {
    pivot_ratio((0..u.n).map(|j| {
        let start = u.p[j] as usize;
        let end = u.p[j + 1] as usize;
        (start..end)
            .find(|&k| u.i[k] == j)
            .map(|k| u.x[k].abs())
            .unwrap_or(0.0)
    }))
}

fn pivot_ratio(pivots: impl Iterator<Item = f64>) -> f64 {
    let mut max = 0.0_f64;
    let mut min = f64::INFINITY;
    let mut any = false;
    for pivot in pivots {
        any = true;
        if !pivot.is_finite() {
            return f64::INFINITY;
        }
        max = max.max(pivot);
        min = min.min(pivot);
    }
    if !any {
        1.0
    } else if min == 0.0 {
        f64::INFINITY
    } else {
        max / min
    }
}

fn ipvec(p: &Option<Vec<isize>>, b: &[f64], x: &mut [f64]) {
    match p {
        Some(perm) => {
            for k in 0..b.len() {
                x[perm[k] as usize] = b[k];
            }
        }
        None => x.copy_from_slice(b),
    }
}
