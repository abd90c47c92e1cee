use log::{debug, error, info};
use nalgebra::DVector;

use super::{Diagnostic, IterationRecord, Method, PowerFlowSolver, SolveContext, SolveStatus};
use crate::admittance::AdmittanceMatrix;
use crate::case::{BusType, Network};
use crate::config::SolverConfig;
use crate::equations::{BusPartition, power_injections};
use crate::error::{PowerFlowError, Result};
use crate::linalg::{Assembly, Factorization, RealMatrix, check_condition};

/// Fast-Decoupled load flow with constant B' and B'' matrices.
///
/// A PV bus whose reactive generation leaves [Qmin, Qmax] is switched to PQ
/// with its generation pinned at the violated limit, and both matrices are
/// rebuilt for the new unknown set.
#[derive(Debug, Clone, Copy, Default)]
pub struct FastDecoupled;

/// Negated susceptance of `ybus` restricted to `buses`, in their order.
fn reduced_susceptance(
    ybus: &AdmittanceMatrix,
    buses: &[usize],
    position: impl Fn(usize) -> Option<usize>,
    sparse: bool,
) -> RealMatrix {
    let mut b = Assembly::new(buses.len(), sparse);
    for (row, &i) in buses.iter().enumerate() {
        for (k, y) in ybus.row(i) {
            if let Some(col) = position(k) {
                b.add(row, col, -y.im);
            }
        }
    }
    b.finish()
}

struct DecoupledFactors {
    b_prime: Factorization,
    b_double_prime: Option<Factorization>,
}

impl DecoupledFactors {
    fn new(ctx: &mut SolveContext, iteration: usize, ceiling: f64) -> Result<Self> {
        let partition = &ctx.partition;
        let b1 = reduced_susceptance(
            &ctx.ybus,
            &partition.non_slack,
            |k| partition.angle_pos(k),
            ctx.sparse,
        );
        let b_prime = Factorization::new(&b1)?;
        let mut worst = check_condition(&b_prime, ceiling);

        let b_double_prime = if partition.pq.is_empty() {
            None
        } else {
            let b2 = reduced_susceptance(
                &ctx.ybus,
                &partition.pq,
                |k| partition.magnitude_pos(k),
                ctx.sparse,
            );
            let f = Factorization::new(&b2)?;
            let c = check_condition(&f, ceiling);
            if c.condition > worst.condition {
                worst = c;
            }
            Some(f)
        };
        debug!(
            "B' is {}x{}, B'' is {}x{}",
            b_prime.dim(),
            b_prime.dim(),
            partition.pq.len(),
            partition.pq.len()
        );

        if worst.ill_conditioned {
            ctx.diagnostics.push(Diagnostic::IllConditioned {
                iteration,
                condition: worst.condition,
            });
        }
        Ok(Self {
            b_prime,
            b_double_prime,
        })
    }
}

fn singular(iteration: usize, what: &str, message: String) -> SolveStatus {
    error!("Singular {} at iteration {}: {}", what, iteration, message);
    SolveStatus::SingularMatrix {
        iteration,
        message: format!("{}: {}", what, message),
    }
}

/// Scaled mismatch `ΔX_i / |V_i|` over `buses`.
fn scaled(buses: &[usize], mismatch: &DVector<f64>, ctx: &SolveContext) -> DVector<f64> {
    DVector::from_iterator(
        buses.len(),
        buses
            .iter()
            .enumerate()
            .map(|(pos, &i)| mismatch[pos] / ctx.state.magnitude[i]),
    )
}

impl PowerFlowSolver for FastDecoupled {
    fn method(&self) -> Method {
        Method::FastDecoupled
    }

    fn iterate(
        &self,
        ctx: &mut SolveContext,
        network: &mut Network,
        config: &SolverConfig,
    ) -> Result<SolveStatus> {
        let mut factors = match DecoupledFactors::new(ctx, 0, config.condition_ceiling) {
            Ok(f) => f,
            Err(PowerFlowError::SingularMatrix(message)) => {
                return Ok(singular(0, "B matrix", message));
            }
            Err(e) => return Err(e),
        };

        for it in 0..config.max_iter {
            let iteration = it + 1;

            let (p, q) = power_injections(&ctx.ybus, &ctx.state);
            let d_p = DVector::from_iterator(
                ctx.partition.non_slack.len(),
                ctx.partition.non_slack.iter().map(|&i| ctx.p_spec[i] - p[i]),
            );
            let d_q = DVector::from_iterator(
                ctx.partition.pq.len(),
                ctx.partition.pq.iter().map(|&i| ctx.q_spec[i] - q[i]),
            );
            let max_p = d_p.amax();
            // no PQ buses leaves dQ empty
            let max_q = d_q.iter().fold(0.0_f64, |m, x| m.max(x.abs()));
            let max = max_p.max(max_q);
            debug!(
                "FD iteration {}: max dP {:e}, max dQ {:e}",
                iteration, max_p, max_q
            );
            let record =
                IterationRecord::new(iteration, max, ctx.snapshot()).with_split_mismatch(max_p, max_q);
            ctx.trace.push(record);

            if max < config.tolerance {
                return Ok(SolveStatus::Converged);
            }

            // P-δ half step
            let rhs = scaled(&ctx.partition.non_slack, &d_p, ctx);
            let d_theta = match factors.b_prime.solve(&rhs) {
                Ok(x) => x,
                Err(PowerFlowError::SingularMatrix(message)) => {
                    return Ok(singular(iteration, "B'", message));
                }
                Err(e) => return Err(e),
            };
            for (pos, &i) in ctx.partition.non_slack.iter().enumerate() {
                ctx.state.angle[i] += d_theta[pos];
            }

            // Q-V half step against the updated angles
            if let Some(b_double_prime) = &factors.b_double_prime {
                let (_, q) = power_injections(&ctx.ybus, &ctx.state);
                let d_q = DVector::from_iterator(
                    ctx.partition.pq.len(),
                    ctx.partition.pq.iter().map(|&i| ctx.q_spec[i] - q[i]),
                );
                let rhs = scaled(&ctx.partition.pq, &d_q, ctx);
                let d_v = match b_double_prime.solve(&rhs) {
                    Ok(x) => x,
                    Err(PowerFlowError::SingularMatrix(message)) => {
                        return Ok(singular(iteration, "B''", message));
                    }
                    Err(e) => return Err(e),
                };
                for (pos, &i) in ctx.partition.pq.iter().enumerate() {
                    ctx.state.magnitude[i] += d_v[pos];
                }
            }

            if enforce_reactive_limits(ctx, network, iteration)? {
                ctx.partition = BusPartition::new(&network.bus_types());
                factors = match DecoupledFactors::new(ctx, iteration, config.condition_ceiling) {
                    Ok(f) => f,
                    Err(PowerFlowError::SingularMatrix(message)) => {
                        return Ok(singular(iteration, "B matrix", message));
                    }
                    Err(e) => return Err(e),
                };
            }
        }

        Ok(SolveStatus::MaxIterations)
    }
}

/// Switches every PV bus whose reactive generation is outside its limits to
/// PQ. Returns whether any bus changed.
fn enforce_reactive_limits(
    ctx: &mut SolveContext,
    network: &mut Network,
    iteration: usize,
) -> Result<bool> {
    let (_, q) = power_injections(&ctx.ybus, &ctx.state);
    let mut changed = false;

    for &i in &ctx.partition.pv {
        let q_gen = q[i] + ctx.q_load[i];
        let limit = if q_gen > ctx.q_max[i] {
            ctx.q_max[i]
        } else if q_gen < ctx.q_min[i] {
            ctx.q_min[i]
        } else {
            continue;
        };

        let bus = &mut network.buses[i];
        bus.reclassify(BusType::PQ)?;
        bus.q_gen = limit * network.s_base;
        ctx.q_spec[i] = limit - ctx.q_load[i];
        info!(
            "Bus {} switched from PV to PQ at iteration {}: Qg {:.4} outside [{:.4}, {:.4}]",
            bus.bus_id, iteration, q_gen, ctx.q_min[i], ctx.q_max[i]
        );
        ctx.diagnostics.push(Diagnostic::Reclassified {
            iteration,
            bus_id: bus.bus_id,
            q_gen,
        });
        changed = true;
    }

    Ok(changed)
}
