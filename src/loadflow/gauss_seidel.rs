use log::{debug, error};
use num_complex::Complex64;

use super::{IterationRecord, Method, PowerFlowSolver, SolveContext, SolveStatus};
use crate::case::{BusType, Network};
use crate::config::SolverConfig;
use crate::equations::{Mismatch, PQ_INITIAL_VOLTAGE};
use crate::error::Result;

/// Voltages and self-admittances smaller than this are treated as zero.
const NEAR_ZERO: f64 = 1e-12;

/// Gauss-Seidel with in-place sweeps and optional acceleration.
///
/// PV reactive output is clamped to its limits every sweep; the bus keeps its
/// type and set-point magnitude.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussSeidel;

impl PowerFlowSolver for GaussSeidel {
    fn method(&self) -> Method {
        Method::GaussSeidel
    }

    fn iterate(
        &self,
        ctx: &mut SolveContext,
        network: &mut Network,
        config: &SolverConfig,
    ) -> Result<SolveStatus> {
        let alpha = config.acceleration;
        let types = network.bus_types();
        let mut v: Vec<Complex64> = (0..ctx.state.len()).map(|i| ctx.state.phasor(i)).collect();

        for &i in &ctx.partition.non_slack {
            if ctx.ybus.get(i, i).norm() < NEAR_ZERO {
                let message = format!("bus {} has no self admittance", ctx.bus_ids[i]);
                error!("Gauss-Seidel cannot update {}", message);
                return Ok(SolveStatus::SingularMatrix {
                    iteration: 0,
                    message,
                });
            }
        }

        for it in 0..config.max_iter {
            let iteration = it + 1;
            let mut max_change = 0.0_f64;

            for &i in &ctx.partition.non_slack {
                let y_ii = ctx.ybus.get(i, i);
                let neighbours: Complex64 = ctx
                    .ybus
                    .row(i)
                    .filter(|&(k, _)| k != i)
                    .map(|(k, y_ik)| y_ik * v[k])
                    .sum();

                let previous = v[i];
                if v[i].norm() < NEAR_ZERO {
                    v[i] = match types[i] {
                        BusType::PV => Complex64::new(ctx.v_set[i], 0.0),
                        _ => PQ_INITIAL_VOLTAGE,
                    };
                }

                let updated = match types[i] {
                    BusType::PV => {
                        // reactive estimate from the current voltages, held to limits
                        let current = neighbours + y_ii * v[i];
                        let q = (v[i] * current.conj()).im;
                        let lo = ctx.q_min[i] - ctx.q_load[i];
                        let hi = ctx.q_max[i] - ctx.q_load[i];
                        let q = q.max(lo).min(hi);

                        let s = Complex64::new(ctx.p_spec[i], q);
                        let raw = (s.conj() / v[i].conj() - neighbours) / y_ii;
                        if raw.norm() < NEAR_ZERO {
                            Complex64::new(ctx.v_set[i], 0.0)
                        } else {
                            raw * (ctx.v_set[i] / raw.norm())
                        }
                    }
                    _ => {
                        let s = Complex64::new(ctx.p_spec[i], ctx.q_spec[i]);
                        (s.conj() / v[i].conj() - neighbours) / y_ii
                    }
                };

                let next = updated * alpha + v[i] * (1.0 - alpha);
                if !next.is_finite() {
                    // state keeps the last finite sweep
                    let message = format!("bus {} voltage is not finite", ctx.bus_ids[i]);
                    error!("Gauss-Seidel diverged at iteration {}: {}", iteration, message);
                    return Ok(SolveStatus::SingularMatrix { iteration, message });
                }
                v[i] = next;
                max_change = max_change.max((v[i] - previous).norm());
            }

            for &i in &ctx.partition.non_slack {
                ctx.state.set_phasor(i, v[i]);
            }

            let mismatch = Mismatch::evaluate(
                &ctx.ybus,
                &ctx.state,
                &ctx.partition,
                &ctx.p_spec,
                &ctx.q_spec,
            );
            let max = mismatch.max_abs();
            debug!(
                "GS iteration {}: max voltage change {:e}, max mismatch {:e}",
                iteration, max_change, max
            );
            let record =
                IterationRecord::new(iteration, max, ctx.snapshot()).with_voltage_change(max_change);
            ctx.trace.push(record);

            // the step alone can stall while power is still unbalanced
            if max_change < config.tolerance && max < config.tolerance {
                return Ok(SolveStatus::Converged);
            }
        }

        Ok(SolveStatus::MaxIterations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::{Bus, Line};
    use approx::assert_abs_diff_eq;

    fn three_bus() -> Network {
        Network::from_parts(
            String::new(),
            1.0,
            vec![
                Bus::new(1, BusType::Slack).with_voltage(1.05, 0.0),
                Bus::new(2, BusType::PV)
                    .with_voltage(1.03, 0.0)
                    .with_generation(0.5, 0.0),
                Bus::new(3, BusType::PQ).with_load(0.8, 0.4),
            ],
            vec![
                Line::new(1, 2, 0.02, 0.06).with_charging(0.06),
                Line::new(1, 3, 0.08, 0.24).with_charging(0.05),
                Line::new(2, 3, 0.06, 0.18).with_charging(0.04),
            ],
        )
    }

    #[test]
    fn pv_magnitude_is_held_at_set_point() {
        let mut net = three_bus();
        let config = SolverConfig::for_method(Method::GaussSeidel);
        let sol = GaussSeidel.solve(&mut net, &config).unwrap();
        assert!(sol.converged);
        assert_abs_diff_eq!(sol.magnitude[1], 1.03, epsilon = 1e-12);
        assert!(sol.trace.iter().all(|r| r.max_voltage_change.is_some()));
        let last = sol.trace.last().unwrap();
        assert!(last.max_voltage_change.unwrap() < config.tolerance);
        assert!(last.max_mismatch < config.tolerance);
    }

    #[test]
    fn acceleration_reaches_the_same_point() {
        let config = SolverConfig::for_method(Method::GaussSeidel).with_tolerance(1e-8);
        let plain = GaussSeidel.solve(&mut three_bus(), &config).unwrap();
        let fast = GaussSeidel
            .solve(&mut three_bus(), &config.clone().with_acceleration(1.2))
            .unwrap();
        assert!(plain.converged && fast.converged);
        for i in 0..3 {
            assert_abs_diff_eq!(plain.magnitude[i], fast.magnitude[i], epsilon = 1e-6);
            assert_abs_diff_eq!(plain.angle[i], fast.angle[i], epsilon = 1e-6);
        }
    }

    #[test]
    fn reactive_clamp_keeps_bus_type() {
        let mut net = three_bus();
        net.buses[1].q_load = 0.5;
        net.buses[1].q_max = Some(0.1);
        let config = SolverConfig::for_method(Method::GaussSeidel);
        let sol = GaussSeidel.solve(&mut net, &config).unwrap();
        assert_eq!(sol.bus_types[1], BusType::PV);
        assert!(sol.reclassified().is_empty());
        assert_abs_diff_eq!(sol.magnitude[1], 1.03, epsilon = 1e-12);
    }

    #[test]
    fn bus_without_admittance_stops_the_sweep() {
        let mut net = three_bus();
        net.lines = vec![Line::new(1, 2, 0.02, 0.06)];
        let sol = GaussSeidel.solve(&mut net, &SolverConfig::default()).unwrap();
        assert!(!sol.converged);
        assert!(matches!(sol.status, SolveStatus::SingularMatrix { iteration: 0, .. }));
        assert!(sol.trace.is_empty());
    }

    #[test]
    fn non_finite_sweep_is_not_convergence() {
        let mut net = three_bus();
        net.buses[2].p_load = f64::INFINITY;
        let sol = GaussSeidel.solve(&mut net, &SolverConfig::default()).unwrap();
        assert!(!sol.converged);
        assert!(matches!(sol.status, SolveStatus::SingularMatrix { iteration: 1, .. }));
        assert!(sol.magnitude.iter().all(|m| m.is_finite()));
    }
}
