//! Polar power-flow equations shared by every solver.
//!
//! Injections are evaluated for all buses at once as `S = V ∘ conj(Y V)`,
//! which expands to
//!
//! ```text
//! P_i =  Σ_k |V_i||V_k||Y_ik| cos(θ_ik + δ_k − δ_i)
//! Q_i = −Σ_k |V_i||V_k||Y_ik| sin(θ_ik + δ_k − δ_i)
//! ```

use nalgebra::DVector;
use num_complex::Complex64;

use crate::admittance::AdmittanceMatrix;
use crate::case::BusType;

/// Starting point for PQ buses, a little below nominal with a lagging angle.
pub const PQ_INITIAL_VOLTAGE: Complex64 = Complex64::new(0.95, -0.05);

/// Ordering of the unknowns. Angle unknowns cover every non-slack bus, magnitude
/// unknowns every PQ bus, both in ascending bus order.
#[derive(Debug, Clone, PartialEq)]
pub struct BusPartition {
    pub slack: usize,
    pub non_slack: Vec<usize>,
    pub pv: Vec<usize>,
    pub pq: Vec<usize>,
    angle_pos: Vec<Option<usize>>,
    magnitude_pos: Vec<Option<usize>>,
}

impl BusPartition {
    pub fn new(types: &[BusType]) -> Self {
        let mut slack = 0;
        let mut non_slack = Vec::new();
        let mut pv = Vec::new();
        let mut pq = Vec::new();
        let mut angle_pos = vec![None; types.len()];
        let mut magnitude_pos = vec![None; types.len()];

        for (i, t) in types.iter().enumerate() {
            match t {
                BusType::Slack => slack = i,
                BusType::PV => pv.push(i),
                BusType::PQ => {
                    magnitude_pos[i] = Some(pq.len());
                    pq.push(i);
                }
            }
            if *t != BusType::Slack {
                angle_pos[i] = Some(non_slack.len());
                non_slack.push(i);
            }
        }

        Self {
            slack,
            non_slack,
            pv,
            pq,
            angle_pos,
            magnitude_pos,
        }
    }

    /// Row/column of bus `i` in the angle block, if it has an angle unknown.
    pub fn angle_pos(&self, i: usize) -> Option<usize> {
        self.angle_pos[i]
    }

    /// Row/column of bus `i` in the magnitude block, if it has a magnitude unknown.
    pub fn magnitude_pos(&self, i: usize) -> Option<usize> {
        self.magnitude_pos[i]
    }

    pub fn n_unknowns(&self) -> usize {
        self.non_slack.len() + self.pq.len()
    }
}

/// Bus voltages held in polar form. Angles are radians.
#[derive(Debug, Clone, PartialEq)]
pub struct VoltageState {
    pub magnitude: DVector<f64>,
    pub angle: DVector<f64>,
}

impl VoltageState {
    pub fn from_phasors(v: &[Complex64]) -> Self {
        Self {
            magnitude: DVector::from_iterator(v.len(), v.iter().map(|c| c.norm())),
            angle: DVector::from_iterator(v.len(), v.iter().map(|c| c.arg())),
        }
    }

    pub fn len(&self) -> usize {
        self.magnitude.len()
    }

    pub fn is_empty(&self) -> bool {
        self.magnitude.is_empty()
    }

    pub fn phasor(&self, i: usize) -> Complex64 {
        Complex64::from_polar(self.magnitude[i], self.angle[i])
    }

    pub fn phasors(&self) -> DVector<Complex64> {
        DVector::from_fn(self.len(), |i, _| self.phasor(i))
    }

    /// Overwrites bus `i` from a complex value.
    pub fn set_phasor(&mut self, i: usize, v: Complex64) {
        let (r, theta) = v.to_polar();
        self.magnitude[i] = r;
        self.angle[i] = theta;
    }
}

/// Calculated active and reactive injections for every bus.
pub fn power_injections(ybus: &AdmittanceMatrix, state: &VoltageState) -> (DVector<f64>, DVector<f64>) {
    let v = state.phasors();
    let current = ybus.mul_vector(&v);
    let s = v.zip_map(&current, |vi, ii| vi * ii.conj());
    (s.map(|c| c.re), s.map(|c| c.im))
}

/// Specified minus calculated power, restricted to the unknown set: active rows
/// for all non-slack buses followed by reactive rows for PQ buses.
#[derive(Debug, Clone)]
pub struct Mismatch {
    pub values: DVector<f64>,
}

impl Mismatch {
    pub fn evaluate(
        ybus: &AdmittanceMatrix,
        state: &VoltageState,
        partition: &BusPartition,
        p_spec: &[f64],
        q_spec: &[f64],
    ) -> Self {
        let (p, q) = power_injections(ybus, state);
        let n_ns = partition.non_slack.len();
        let mut values = DVector::zeros(partition.n_unknowns());
        for (row, &i) in partition.non_slack.iter().enumerate() {
            values[row] = p_spec[i] - p[i];
        }
        for (row, &i) in partition.pq.iter().enumerate() {
            values[n_ns + row] = q_spec[i] - q[i];
        }
        Self { values }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn max_abs(&self) -> f64 {
        self.values.amax()
    }

    pub fn rms(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        (self.values.norm_squared() / self.values.len() as f64).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admittance::build_admittance;
    use crate::case::{Bus, Line, Network};
    use approx::assert_abs_diff_eq;

    fn two_bus() -> Network {
        Network::from_parts(
            String::new(),
            1.0,
            vec![
                Bus::new(1, BusType::Slack).with_voltage(1.0, 0.0),
                Bus::new(2, BusType::PQ).with_load(0.5, 0.2),
            ],
            vec![Line::new(1, 2, 0.01, 0.1)],
        )
    }

    #[test]
    fn partition_orders_unknowns_by_bus() {
        let p = BusPartition::new(&[BusType::PQ, BusType::Slack, BusType::PV, BusType::PQ]);
        assert_eq!(p.slack, 1);
        assert_eq!(p.non_slack, vec![0, 2, 3]);
        assert_eq!(p.pq, vec![0, 3]);
        assert_eq!(p.pv, vec![2]);
        assert_eq!(p.angle_pos(2), Some(1));
        assert_eq!(p.magnitude_pos(3), Some(1));
        assert_eq!(p.magnitude_pos(2), None);
        assert_eq!(p.angle_pos(1), None);
        assert_eq!(p.n_unknowns(), 5);
    }

    #[test]
    fn injections_match_polar_sums() {
        let net = two_bus();
        let (y, _) = build_admittance(&net, false).unwrap();
        let state = VoltageState::from_phasors(&[
            Complex64::new(1.0, 0.0),
            Complex64::from_polar(0.97, -0.05),
        ]);
        let (p, q) = power_injections(&y, &state);

        for i in 0..2 {
            let mut p_i = 0.0;
            let mut q_i = 0.0;
            for k in 0..2 {
                let yik = y.get(i, k);
                let phi = yik.arg() + state.angle[k] - state.angle[i];
                let t = state.magnitude[i] * state.magnitude[k] * yik.norm();
                p_i += t * phi.cos();
                q_i -= t * phi.sin();
            }
            assert_abs_diff_eq!(p[i], p_i, epsilon = 1e-12);
            assert_abs_diff_eq!(q[i], q_i, epsilon = 1e-12);
        }
    }

    #[test]
    fn mismatch_rows_follow_partition() {
        let net = two_bus();
        let (y, _) = build_admittance(&net, false).unwrap();
        let partition = BusPartition::new(&net.bus_types());
        let (p_spec, q_spec) = net.specified_injections();
        // flat start: no flow, so mismatch equals the specified injection
        let state = VoltageState::from_phasors(&[Complex64::new(1.0, 0.0); 2]);
        let mis = Mismatch::evaluate(&y, &state, &partition, &p_spec, &q_spec);
        assert_eq!(mis.values.len(), 2);
        assert_abs_diff_eq!(mis.values[0], -0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(mis.values[1], -0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(mis.max_abs(), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(mis.rms(), (0.29f64 / 2.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn slack_phasor_survives_polar_round_trip() {
        let mut state = VoltageState::from_phasors(&[Complex64::new(1.05, 0.0)]);
        let before = (state.magnitude[0], state.angle[0]);
        let v = state.phasor(0);
        state.set_phasor(0, v);
        assert_eq!((state.magnitude[0], state.angle[0]), before);
    }
}
