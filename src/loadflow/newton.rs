use log::{debug, error};

use super::{Diagnostic, IterationRecord, Method, PowerFlowSolver, SolveContext, SolveStatus};
use crate::case::Network;
use crate::config::SolverConfig;
use crate::equations::Mismatch;
use crate::error::{PowerFlowError, Result};
use crate::jacobian::assemble_jacobian;
use crate::linalg::solve_checked;

/// Iterations that take a shortened step before full Newton steps.
const DAMPED_ITERATIONS: usize = 3;
const DAMPED_STEP: f64 = 0.8;

/// PQ magnitudes are held inside this band after each update.
const MIN_VOLTAGE: f64 = 0.5;
const MAX_VOLTAGE: f64 = 1.5;

/// Full Newton-Raphson in polar coordinates. Reactive limits are not enforced.
#[derive(Debug, Clone, Copy, Default)]
pub struct NewtonRaphson;

impl PowerFlowSolver for NewtonRaphson {
    fn method(&self) -> Method {
        Method::NewtonRaphson
    }

    fn iterate(
        &self,
        ctx: &mut SolveContext,
        _network: &mut Network,
        config: &SolverConfig,
    ) -> Result<SolveStatus> {
        let n_ns = ctx.partition.non_slack.len();

        for it in 0..config.max_iter {
            let iteration = it + 1;
            let mismatch = Mismatch::evaluate(
                &ctx.ybus,
                &ctx.state,
                &ctx.partition,
                &ctx.p_spec,
                &ctx.q_spec,
            );
            let max = mismatch.max_abs();
            let rms = mismatch.rms();
            debug!("NR iteration {}: max mismatch {:e}, rms {:e}", iteration, max, rms);

            let record = IterationRecord::new(iteration, max, ctx.snapshot()).with_rms(rms);
            ctx.trace.push(record);

            // both criteria must hold
            if max < config.tolerance && rms < config.tolerance / 10.0 {
                return Ok(SolveStatus::Converged);
            }

            let jac = assemble_jacobian(&ctx.ybus, &ctx.state, &ctx.partition, ctx.sparse);
            let (dx, conditioning) =
                match solve_checked(&jac, &mismatch.values, config.condition_ceiling) {
                    Ok(solved) => solved,
                    Err(PowerFlowError::SingularMatrix(message)) => {
                        error!("Singular Jacobian at iteration {}: {}", iteration, message);
                        return Ok(SolveStatus::SingularMatrix {
                            iteration,
                            message: format!("Jacobian: {}", message),
                        });
                    }
                    Err(e) => return Err(e),
                };
            if conditioning.ill_conditioned {
                ctx.diagnostics.push(Diagnostic::IllConditioned {
                    iteration,
                    condition: conditioning.condition,
                });
            }

            let step = if it < DAMPED_ITERATIONS { DAMPED_STEP } else { 1.0 };
            for (pos, &i) in ctx.partition.non_slack.iter().enumerate() {
                ctx.state.angle[i] += step * dx[pos];
            }
            for (pos, &i) in ctx.partition.pq.iter().enumerate() {
                let v = ctx.state.magnitude[i] + step * dx[n_ns + pos];
                ctx.state.magnitude[i] = v.clamp(MIN_VOLTAGE, MAX_VOLTAGE);
            }
        }

        Ok(SolveStatus::MaxIterations)
    }
}
