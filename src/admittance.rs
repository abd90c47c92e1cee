use std::fmt;

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use num_complex::Complex64;

use crate::case::Network;
use crate::error::Result;

/// Lines with |r| and |x| both below this are treated as zero impedance.
pub const ZERO_IMPEDANCE_EPS: f64 = 1e-12;

/// Largest bus count printed in full by the Display impl.
const DISPLAY_LIMIT: usize = 10;

/// Network admittance matrix. Dense or sparse storage is a size decision only;
/// all access goes through the methods below.
#[derive(Debug, Clone)]
pub enum AdmittanceMatrix {
    Dense(DMatrix<Complex64>),
    Sparse(CsrMatrix<Complex64>),
}

/// A line dropped from the matrix because its impedance is zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkippedLine {
    pub from_bus: usize,
    pub to_bus: usize,
}

/// Accumulates stamps before the matrix is frozen.
enum Accumulator {
    Dense(DMatrix<Complex64>),
    Sparse(CooMatrix<Complex64>),
}

impl Accumulator {
    fn new(n: usize, sparse: bool) -> Self {
        if sparse {
            Accumulator::Sparse(CooMatrix::new(n, n))
        } else {
            Accumulator::Dense(DMatrix::zeros(n, n))
        }
    }

    fn add(&mut self, i: usize, j: usize, value: Complex64) {
        match self {
            Accumulator::Dense(m) => m[(i, j)] += value,
            // duplicates are summed on conversion to CSR
            Accumulator::Sparse(coo) => coo.push(i, j, value),
        }
    }

    fn finish(self) -> AdmittanceMatrix {
        match self {
            Accumulator::Dense(m) => AdmittanceMatrix::Dense(m),
            Accumulator::Sparse(coo) => AdmittanceMatrix::Sparse(CsrMatrix::from(&coo)),
        }
    }
}

/// Builds the Y-bus for a validated network. Returns the matrix together with
/// any lines skipped for having zero impedance.
pub fn build_admittance(
    network: &Network,
    sparse: bool,
) -> Result<(AdmittanceMatrix, Vec<SkippedLine>)> {
    let n = network.buses.len();
    debug!(
        "Building {}x{} admittance matrix ({})",
        n,
        n,
        if sparse { "sparse" } else { "dense" }
    );

    let mut acc = Accumulator::new(n, sparse);
    let mut skipped = Vec::new();

    for line in &network.lines {
        let i = network.index_of(line.from_bus)?;
        let j = network.index_of(line.to_bus)?;

        if line.resistance.abs() < ZERO_IMPEDANCE_EPS && line.reactance.abs() < ZERO_IMPEDANCE_EPS {
            warn!(
                "Zero impedance line between buses {} and {} skipped",
                line.from_bus, line.to_bus
            );
            skipped.push(SkippedLine {
                from_bus: line.from_bus,
                to_bus: line.to_bus,
            });
            continue;
        }

        // series admittance and half of the line charging at each end
        let y = Complex64::new(line.resistance, line.reactance).inv();
        let half_shunt = Complex64::new(0.0, line.susceptance / 2.0);

        acc.add(i, i, y + half_shunt);
        acc.add(j, j, y + half_shunt);
        acc.add(i, j, -y);
        acc.add(j, i, -y);
    }

    Ok((acc.finish(), skipped))
}

/// Non-zero entries of one matrix row as (column, value).
pub enum RowEntries<'a> {
    Dense {
        matrix: &'a DMatrix<Complex64>,
        row: usize,
        col: usize,
    },
    Sparse {
        cols: &'a [usize],
        values: &'a [Complex64],
        pos: usize,
    },
}

impl Iterator for RowEntries<'_> {
    type Item = (usize, Complex64);

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            RowEntries::Dense { matrix, row, col } => {
                while *col < matrix.ncols() {
                    let k = *col;
                    *col += 1;
                    let value = matrix[(*row, k)];
                    if value != Complex64::new(0.0, 0.0) {
                        return Some((k, value));
                    }
                }
                None
            }
            RowEntries::Sparse { cols, values, pos } => {
                let k = *pos;
                if k < cols.len() {
                    *pos += 1;
                    Some((cols[k], values[k]))
                } else {
                    None
                }
            }
        }
    }
}

impl AdmittanceMatrix {
    pub fn size(&self) -> usize {
        match self {
            AdmittanceMatrix::Dense(m) => m.nrows(),
            AdmittanceMatrix::Sparse(m) => m.nrows(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, AdmittanceMatrix::Sparse(_))
    }

    pub fn get(&self, i: usize, j: usize) -> Complex64 {
        match self {
            AdmittanceMatrix::Dense(m) => m[(i, j)],
            AdmittanceMatrix::Sparse(m) => {
                let offsets = m.row_offsets();
                let range = offsets[i]..offsets[i + 1];
                let cols = &m.col_indices()[range.clone()];
                match cols.binary_search(&j) {
                    Ok(pos) => m.values()[range.start + pos],
                    Err(_) => Complex64::new(0.0, 0.0),
                }
            }
        }
    }

    pub fn row(&self, i: usize) -> RowEntries<'_> {
        match self {
            AdmittanceMatrix::Dense(m) => RowEntries::Dense {
                matrix: m,
                row: i,
                col: 0,
            },
            AdmittanceMatrix::Sparse(m) => {
                let offsets = m.row_offsets();
                let range = offsets[i]..offsets[i + 1];
                RowEntries::Sparse {
                    cols: &m.col_indices()[range.clone()],
                    values: &m.values()[range],
                    pos: 0,
                }
            }
        }
    }

    /// Nodal current injections I = Y V.
    pub fn mul_vector(&self, v: &DVector<Complex64>) -> DVector<Complex64> {
        match self {
            AdmittanceMatrix::Dense(m) => m * v,
            AdmittanceMatrix::Sparse(m) => m * v,
        }
    }

    /// Buses with no connection to any other bus.
    pub fn isolated_buses(&self) -> Vec<usize> {
        let n = self.size();
        if n < 2 {
            return Vec::new();
        }
        (0..n)
            .filter(|&i| self.row(i).all(|(k, _)| k == i))
            .collect()
    }

    pub fn to_dense(&self) -> DMatrix<Complex64> {
        match self {
            AdmittanceMatrix::Dense(m) => m.clone(),
            AdmittanceMatrix::Sparse(m) => DMatrix::from_fn(m.nrows(), m.ncols(), |i, j| {
                self.get(i, j)
            }),
        }
    }
}

impl fmt::Display for AdmittanceMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.size();
        if n > DISPLAY_LIMIT {
            return write!(f, "Y-bus Matrix: {}x{} (too large to display)", n, n);
        }

        writeln!(f, "Y-bus Matrix (rectangular form):")?;
        for i in 0..n {
            for j in 0..n {
                let y = self.get(i, j);
                let sign = if y.im >= 0.0 { '+' } else { '-' };
                write!(f, "{:.4} {} j{:.4}\t", y.re, sign, y.im.abs())?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::{Bus, BusType, Line};
    use approx::assert_abs_diff_eq;

    fn network(lines: Vec<Line>) -> Network {
        Network::from_parts(
            String::new(),
            1.0,
            vec![
                Bus::new(1, BusType::Slack).with_voltage(1.05, 0.0),
                Bus::new(2, BusType::PV).with_voltage(1.03, 0.0),
                Bus::new(3, BusType::PQ),
            ],
            lines,
        )
    }

    fn scenario_lines() -> Vec<Line> {
        vec![
            Line::new(1, 2, 0.02, 0.06).with_charging(0.06),
            Line::new(1, 3, 0.08, 0.24).with_charging(0.05),
            Line::new(2, 3, 0.06, 0.18).with_charging(0.04),
        ]
    }

    #[test]
    fn matrix_is_symmetric_and_rows_balance() {
        let (y, skipped) = build_admittance(&network(scenario_lines()), false).unwrap();
        assert!(skipped.is_empty());
        for i in 0..3 {
            for j in 0..3 {
                assert_eq!(y.get(i, j), y.get(j, i));
            }
        }

        // off-diagonal is -1/(r+jx)
        let y12 = Complex64::new(0.02, 0.06).inv();
        assert_abs_diff_eq!(y.get(0, 1).re, -y12.re, epsilon = 1e-12);
        assert_abs_diff_eq!(y.get(0, 1).im, -y12.im, epsilon = 1e-12);

        // each row sums to the half-shunts incident on the bus
        let row_sum: Complex64 = (0..3).map(|j| y.get(0, j)).sum();
        assert_abs_diff_eq!(row_sum.re, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(row_sum.im, 0.03 + 0.025, epsilon = 1e-12);
    }

    #[test]
    fn sparse_and_dense_agree() {
        let net = network(scenario_lines());
        let (dense, _) = build_admittance(&net, false).unwrap();
        let (sparse, _) = build_admittance(&net, true).unwrap();
        assert!(sparse.is_sparse());
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(dense.get(i, j).re, sparse.get(i, j).re, epsilon = 1e-12);
                assert_abs_diff_eq!(dense.get(i, j).im, sparse.get(i, j).im, epsilon = 1e-12);
            }
            let d: Vec<usize> = dense.row(i).map(|(k, _)| k).collect();
            let s: Vec<usize> = sparse.row(i).map(|(k, _)| k).collect();
            assert_eq!(d, s);
        }

        let v = DVector::from_vec(vec![
            Complex64::new(1.05, 0.0),
            Complex64::from_polar(1.03, -0.02),
            Complex64::new(0.95, -0.05),
        ]);
        let a = dense.mul_vector(&v);
        let b = sparse.mul_vector(&v);
        for i in 0..3 {
            assert_abs_diff_eq!((a[i] - b[i]).norm(), 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn zero_impedance_line_is_skipped_and_can_isolate_a_bus() {
        let lines = vec![
            Line::new(1, 2, 0.02, 0.06),
            Line::new(2, 3, 0.0, 0.0).with_charging(0.04),
        ];
        let (y, skipped) = build_admittance(&network(lines), false).unwrap();
        assert_eq!(
            skipped,
            vec![SkippedLine {
                from_bus: 2,
                to_bus: 3
            }]
        );
        // bus 3 has lost its only branch
        assert_eq!(y.get(2, 2), Complex64::new(0.0, 0.0));
        assert_eq!(y.isolated_buses(), vec![2]);
    }

    #[test]
    fn display_switches_to_notice_for_large_networks() {
        let (y, _) = build_admittance(&network(scenario_lines()), false).unwrap();
        let text = y.to_string();
        assert!(text.starts_with("Y-bus Matrix (rectangular form):"));
        assert_eq!(text.lines().count(), 4);

        let big = AdmittanceMatrix::Dense(DMatrix::zeros(11, 11));
        assert_eq!(big.to_string(), "Y-bus Matrix: 11x11 (too large to display)");
    }
}
