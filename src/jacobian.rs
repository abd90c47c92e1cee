//! Newton-Raphson Jacobian in polar coordinates.
//!
//! Layout, with angle unknowns for every non-slack bus first and magnitude
//! unknowns for PQ buses second:
//!
//! ```text
//! | J11 = ∂P/∂δ   J12 = ∂P/∂|V| |
//! | J21 = ∂Q/∂δ   J22 = ∂Q/∂|V| |
//! ```
//!
//! Only admittance entries present in a bus row are visited, so buses that are
//! not directly connected contribute no off-diagonal terms.

use crate::admittance::AdmittanceMatrix;
use crate::equations::{BusPartition, VoltageState};
use crate::linalg::{Assembly, RealMatrix};

/// Admittance magnitudes at or below this are treated as no connection.
pub const COUPLING_EPS: f64 = 1e-10;

pub fn assemble_jacobian(
    ybus: &AdmittanceMatrix,
    state: &VoltageState,
    partition: &BusPartition,
    sparse: bool,
) -> RealMatrix {
    let n_ns = partition.non_slack.len();
    let mut jac = Assembly::new(partition.n_unknowns(), sparse);

    for (row_p, &i) in partition.non_slack.iter().enumerate() {
        let vi = state.magnitude[i];
        let di = state.angle[i];
        let row_q = partition.magnitude_pos(i).map(|r| n_ns + r);

        let mut dp_ddi = 0.0;
        let mut dp_dvi = 0.0;
        let mut dq_ddi = 0.0;
        let mut dq_dvi = 0.0;

        for (k, yik) in ybus.row(i) {
            let y_mag = yik.norm();
            let theta = yik.arg();

            if k == i {
                dp_dvi += 2.0 * vi * y_mag * theta.cos();
                dq_dvi -= 2.0 * vi * y_mag * theta.sin();
                continue;
            }
            if y_mag <= COUPLING_EPS {
                continue;
            }

            let vk = state.magnitude[k];
            let (s, c) = (theta + state.angle[k] - di).sin_cos();
            let t = vi * vk * y_mag;

            dp_ddi += t * s;
            dp_dvi += vk * y_mag * c;
            dq_ddi += t * c;
            dq_dvi -= vk * y_mag * s;

            if let Some(col) = partition.angle_pos(k) {
                jac.add(row_p, col, -t * s);
                if let Some(rq) = row_q {
                    jac.add(rq, col, -t * c);
                }
            }
            if let Some(col) = partition.magnitude_pos(k) {
                jac.add(row_p, n_ns + col, vi * y_mag * c);
                if let Some(rq) = row_q {
                    jac.add(rq, n_ns + col, -vi * y_mag * s);
                }
            }
        }

        jac.add(row_p, row_p, dp_ddi);
        if let Some(rq) = row_q {
            jac.add(row_p, rq, dp_dvi);
            jac.add(rq, row_p, dq_ddi);
            jac.add(rq, rq, dq_dvi);
        }
    }

    jac.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admittance::build_admittance;
    use crate::case::{Bus, BusType, Line, Network};
    use crate::equations::power_injections;
    use approx::assert_abs_diff_eq;
    use nalgebra::{DMatrix, DVector};

    fn four_bus() -> Network {
        Network::from_parts(
            String::new(),
            1.0,
            vec![
                Bus::new(1, BusType::Slack).with_voltage(1.05, 0.0),
                Bus::new(2, BusType::PQ),
                Bus::new(3, BusType::PV).with_voltage(1.02, 0.0),
                Bus::new(4, BusType::PQ),
            ],
            vec![
                Line::new(1, 2, 0.02, 0.06).with_charging(0.06),
                Line::new(2, 3, 0.06, 0.18).with_charging(0.04),
                Line::new(3, 4, 0.04, 0.12),
            ],
        )
    }

    fn state() -> VoltageState {
        VoltageState {
            magnitude: DVector::from_vec(vec![1.05, 0.97, 1.02, 0.95]),
            angle: DVector::from_vec(vec![0.0, -0.04, -0.02, -0.09]),
        }
    }

    /// Central-difference derivative of the calculated injections.
    fn numeric_jacobian(net: &Network, partition: &BusPartition) -> DMatrix<f64> {
        let (y, _) = build_admittance(net, false).unwrap();
        let n = partition.n_unknowns();
        let n_ns = partition.non_slack.len();
        let h = 1e-7;
        let mut jac = DMatrix::zeros(n, n);

        let eval = |s: &VoltageState| {
            let (p, q) = power_injections(&y, s);
            let mut f = vec![0.0; n];
            for (r, &i) in partition.non_slack.iter().enumerate() {
                f[r] = p[i];
            }
            for (r, &i) in partition.pq.iter().enumerate() {
                f[n_ns + r] = q[i];
            }
            f
        };

        for col in 0..n {
            let mut plus = state();
            let mut minus = state();
            if col < n_ns {
                let bus = partition.non_slack[col];
                plus.angle[bus] += h;
                minus.angle[bus] -= h;
            } else {
                let bus = partition.pq[col - n_ns];
                plus.magnitude[bus] += h;
                minus.magnitude[bus] -= h;
            }
            let fp = eval(&plus);
            let fm = eval(&minus);
            for row in 0..n {
                jac[(row, col)] = (fp[row] - fm[row]) / (2.0 * h);
            }
        }
        jac
    }

    #[test]
    fn analytic_jacobian_matches_finite_differences() {
        let net = four_bus();
        let partition = BusPartition::new(&net.bus_types());
        let (y, _) = build_admittance(&net, false).unwrap();
        let analytic = assemble_jacobian(&y, &state(), &partition, false).to_dense();
        let numeric = numeric_jacobian(&net, &partition);

        assert_eq!(analytic.nrows(), 3 + 2);
        for r in 0..analytic.nrows() {
            for c in 0..analytic.ncols() {
                assert_abs_diff_eq!(analytic[(r, c)], numeric[(r, c)], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn sparse_assembly_matches_dense() {
        let net = four_bus();
        let partition = BusPartition::new(&net.bus_types());
        let (yd, _) = build_admittance(&net, false).unwrap();
        let (ys, _) = build_admittance(&net, true).unwrap();
        let dense = assemble_jacobian(&yd, &state(), &partition, false).to_dense();
        let sparse = assemble_jacobian(&ys, &state(), &partition, true).to_dense();
        for r in 0..dense.nrows() {
            for c in 0..dense.ncols() {
                assert_abs_diff_eq!(dense[(r, c)], sparse[(r, c)], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn unconnected_buses_have_no_coupling() {
        let net = four_bus();
        let partition = BusPartition::new(&net.bus_types());
        let (y, _) = build_admittance(&net, false).unwrap();
        let jac = assemble_jacobian(&y, &state(), &partition, false).to_dense();

        // buses 2 and 4 (matrix indices 1 and 3) share no line
        let a2 = partition.angle_pos(1).unwrap();
        let a4 = partition.angle_pos(3).unwrap();
        assert_eq!(jac[(a2, a4)], 0.0);
        assert_eq!(jac[(a4, a2)], 0.0);
    }
}
