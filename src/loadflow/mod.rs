//! Power-flow solvers.
//!
//! Every method implements [`PowerFlowSolver`]. The provided `solve` method
//! validates the input, builds the admittance matrix and initial estimate, and
//! hands a [`SolveContext`] to the method's own iteration loop.

mod fast_decoupled;
mod gauss_seidel;
mod newton;

pub use fast_decoupled::FastDecoupled;
pub use gauss_seidel::GaussSeidel;
pub use newton::NewtonRaphson;

use std::fmt;
use std::str::FromStr;

use log::{debug, error, info, warn};
use nalgebra::DVector;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::admittance::{AdmittanceMatrix, build_admittance};
use crate::case::{Bus, BusType, Network};
use crate::config::SolverConfig;
use crate::equations::{BusPartition, PQ_INITIAL_VOLTAGE, VoltageState};
use crate::error::{PowerFlowError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    NewtonRaphson,
    GaussSeidel,
    FastDecoupled,
}

impl Method {
    pub const ALL: [Method; 3] = [
        Method::NewtonRaphson,
        Method::GaussSeidel,
        Method::FastDecoupled,
    ];

    pub fn solver(&self) -> Box<dyn PowerFlowSolver + Send + Sync> {
        match self {
            Method::NewtonRaphson => Box::new(NewtonRaphson),
            Method::GaussSeidel => Box::new(GaussSeidel),
            Method::FastDecoupled => Box::new(FastDecoupled),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::NewtonRaphson => write!(f, "Newton-Raphson"),
            Method::GaussSeidel => write!(f, "Gauss-Seidel"),
            Method::FastDecoupled => write!(f, "Fast-Decoupled"),
        }
    }
}

impl FromStr for Method {
    type Err = PowerFlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "nr" | "newton" | "newton_raphson" => Ok(Method::NewtonRaphson),
            "gs" | "gauss_seidel" => Ok(Method::GaussSeidel),
            "fd" | "fdlf" | "fast_decoupled" => Ok(Method::FastDecoupled),
            _ => Err(PowerFlowError::InvalidConfig(format!(
                "unknown solution method '{}'",
                s
            ))),
        }
    }
}

/// Why an iteration loop stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SolveStatus {
    Converged,
    MaxIterations,
    SingularMatrix { iteration: usize, message: String },
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveStatus::Converged => write!(f, "converged"),
            SolveStatus::MaxIterations => write!(f, "maximum iterations reached"),
            SolveStatus::SingularMatrix { iteration, message } => {
                write!(f, "singular matrix at iteration {}: {}", iteration, message)
            }
        }
    }
}

/// Non-fatal findings collected while solving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    ZeroImpedanceLine { from_bus: usize, to_bus: usize },
    IsolatedBus { bus_id: usize },
    IllConditioned { iteration: usize, condition: f64 },
    /// A PV bus dropped to PQ; `q_gen` is the generation (p.u.) that broke
    /// the limit.
    Reclassified { iteration: usize, bus_id: usize, q_gen: f64 },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::ZeroImpedanceLine { from_bus, to_bus } => write!(
                f,
                "zero impedance line {}-{} skipped",
                from_bus, to_bus
            ),
            Diagnostic::IsolatedBus { bus_id } => write!(f, "bus {} is isolated", bus_id),
            Diagnostic::IllConditioned {
                iteration,
                condition,
            } => write!(
                f,
                "ill-conditioned matrix at iteration {} (condition {:e})",
                iteration, condition
            ),
            Diagnostic::Reclassified {
                iteration,
                bus_id,
                q_gen,
            } => write!(
                f,
                "bus {} switched PV to PQ at iteration {} (Qg = {:.4})",
                bus_id, iteration, q_gen
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BusPhasor {
    pub bus_id: usize,
    pub magnitude: f64,
    pub angle_deg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoltageSnapshot {
    PerBus(Vec<BusPhasor>),
    Summary { min: f64, max: f64, avg: f64 },
}

/// One row of the iteration trace. Which optional metrics are set depends on
/// the method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    /// Largest absolute power mismatch at the start of the iteration.
    pub max_mismatch: f64,
    pub rms_mismatch: Option<f64>,
    pub max_voltage_change: Option<f64>,
    pub max_p_mismatch: Option<f64>,
    pub max_q_mismatch: Option<f64>,
    pub voltages: VoltageSnapshot,
}

impl IterationRecord {
    pub fn new(iteration: usize, max_mismatch: f64, voltages: VoltageSnapshot) -> Self {
        Self {
            iteration,
            max_mismatch,
            rms_mismatch: None,
            max_voltage_change: None,
            max_p_mismatch: None,
            max_q_mismatch: None,
            voltages,
        }
    }

    pub fn with_rms(mut self, rms: f64) -> Self {
        self.rms_mismatch = Some(rms);
        self
    }

    pub fn with_voltage_change(mut self, change: f64) -> Self {
        self.max_voltage_change = Some(change);
        self
    }

    pub fn with_split_mismatch(mut self, p: f64, q: f64) -> Self {
        self.max_p_mismatch = Some(p);
        self.max_q_mismatch = Some(q);
        self
    }
}

/// Outcome of one solve. Angles are radians; use [`angle_degrees`] at the
/// boundary.
///
/// [`angle_degrees`]: PowerFlowSolution::angle_degrees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerFlowSolution {
    pub method: Method,
    pub converged: bool,
    pub status: SolveStatus,
    pub iterations: usize,
    pub bus_ids: Vec<usize>,
    pub bus_types: Vec<BusType>,
    pub magnitude: Vec<f64>,
    pub angle: Vec<f64>,
    pub trace: Vec<IterationRecord>,
    pub diagnostics: Vec<Diagnostic>,
}

impl PowerFlowSolution {
    pub fn angle_degrees(&self) -> Vec<f64> {
        self.angle.iter().map(|a| a.to_degrees()).collect()
    }

    pub fn phasors(&self) -> Vec<Complex64> {
        self.magnitude
            .iter()
            .zip(&self.angle)
            .map(|(&m, &a)| Complex64::from_polar(m, a))
            .collect()
    }

    pub fn state(&self) -> VoltageState {
        VoltageState {
            magnitude: DVector::from_column_slice(&self.magnitude),
            angle: DVector::from_column_slice(&self.angle),
        }
    }

    /// Final voltage of a bus by id, as (magnitude, angle in radians).
    pub fn voltage_of(&self, bus_id: usize) -> Option<(f64, f64)> {
        let i = self.bus_ids.iter().position(|&id| id == bus_id)?;
        Some((self.magnitude[i], self.angle[i]))
    }

    /// Bus ids switched from PV to PQ, in the order it happened.
    pub fn reclassified(&self) -> Vec<usize> {
        self.diagnostics
            .iter()
            .filter_map(|d| match d {
                Diagnostic::Reclassified { bus_id, .. } => Some(*bus_id),
                _ => None,
            })
            .collect()
    }
}

/// Per-solve working data. Quantities are per-unit of the case base and
/// indexed by matrix position.
pub struct SolveContext {
    pub(crate) ybus: AdmittanceMatrix,
    pub(crate) partition: BusPartition,
    pub(crate) state: VoltageState,
    pub(crate) p_spec: Vec<f64>,
    pub(crate) q_spec: Vec<f64>,
    pub(crate) q_load: Vec<f64>,
    pub(crate) q_min: Vec<f64>,
    pub(crate) q_max: Vec<f64>,
    pub(crate) v_set: Vec<f64>,
    pub(crate) sparse: bool,
    pub(crate) bus_ids: Vec<usize>,
    pub(crate) snapshot_threshold: usize,
    pub(crate) trace: Vec<IterationRecord>,
    pub(crate) diagnostics: Vec<Diagnostic>,
}

impl SolveContext {
    pub fn prepare(network: &mut Network, config: &SolverConfig) -> Result<Self> {
        config.validate()?;
        network.validate()?;

        let n = network.buses.len();
        let sparse = config.use_sparse(n);
        let (ybus, skipped) = build_admittance(network, sparse)?;

        let mut diagnostics: Vec<Diagnostic> = skipped
            .iter()
            .map(|s| Diagnostic::ZeroImpedanceLine {
                from_bus: s.from_bus,
                to_bus: s.to_bus,
            })
            .collect();
        for i in ybus.isolated_buses() {
            let bus_id = network.buses[i].bus_id;
            warn!("Bus {} has no connection to the rest of the network", bus_id);
            diagnostics.push(Diagnostic::IsolatedBus { bus_id });
        }

        let base = network.s_base;
        let (p_spec, q_spec) = network.specified_injections();
        let q_load = network.buses.iter().map(|b| b.q_load / base).collect();
        let (q_min, q_max) = network
            .buses
            .iter()
            .map(|b| {
                let (lo, hi) = b.q_limits();
                (lo / base, hi / base)
            })
            .unzip();

        let mut state = VoltageState {
            magnitude: DVector::zeros(n),
            angle: DVector::zeros(n),
        };
        for (i, bus) in network.buses.iter().enumerate() {
            let (magnitude, angle) = initial_estimate(bus);
            state.magnitude[i] = magnitude;
            state.angle[i] = angle;
        }

        Ok(Self {
            ybus,
            partition: BusPartition::new(&network.bus_types()),
            state,
            p_spec,
            q_spec,
            q_load,
            q_min,
            q_max,
            v_set: network.buses.iter().map(|b| b.voltage).collect(),
            sparse,
            bus_ids: network.buses.iter().map(|b| b.bus_id).collect(),
            snapshot_threshold: config.snapshot_threshold,
            trace: Vec::new(),
            diagnostics,
        })
    }

    pub fn ybus(&self) -> &AdmittanceMatrix {
        &self.ybus
    }

    pub fn state(&self) -> &VoltageState {
        &self.state
    }

    pub(crate) fn snapshot(&self) -> VoltageSnapshot {
        let n = self.state.len();
        if n <= self.snapshot_threshold {
            VoltageSnapshot::PerBus(
                (0..n)
                    .map(|i| BusPhasor {
                        bus_id: self.bus_ids[i],
                        magnitude: self.state.magnitude[i],
                        angle_deg: self.state.angle[i].to_degrees(),
                    })
                    .collect(),
            )
        } else {
            VoltageSnapshot::Summary {
                min: self.state.magnitude.min(),
                max: self.state.magnitude.max(),
                avg: self.state.magnitude.mean(),
            }
        }
    }

    fn finish(self, method: Method, status: SolveStatus, network: &Network) -> PowerFlowSolution {
        PowerFlowSolution {
            method,
            converged: status == SolveStatus::Converged,
            status,
            iterations: self.trace.len(),
            bus_ids: self.bus_ids,
            bus_types: network.bus_types(),
            magnitude: self.state.magnitude.iter().copied().collect(),
            angle: self.state.angle.iter().copied().collect(),
            trace: self.trace,
            diagnostics: self.diagnostics,
        }
    }
}

/// Slack at its set-point, PV at its magnitude with zero angle, PQ at a
/// slightly depressed lagging estimate.
fn initial_estimate(bus: &Bus) -> (f64, f64) {
    match bus.bus_type {
        BusType::Slack => (bus.voltage, bus.angle.to_radians()),
        BusType::PV => (bus.voltage, 0.0),
        BusType::PQ => PQ_INITIAL_VOLTAGE.to_polar(),
    }
}

pub trait PowerFlowSolver {
    fn method(&self) -> Method;

    /// Runs the iteration loop on a prepared context until it converges, runs
    /// out of iterations or hits a singular matrix. Bus type changes are
    /// written to `network`.
    fn iterate(
        &self,
        ctx: &mut SolveContext,
        network: &mut Network,
        config: &SolverConfig,
    ) -> Result<SolveStatus>;

    fn solve(&self, network: &mut Network, config: &SolverConfig) -> Result<PowerFlowSolution> {
        let method = self.method();
        let mut ctx = SolveContext::prepare(network, config)?;
        info!(
            "{} solve of '{}': {} buses, {} lines",
            method,
            network.case_name,
            network.buses.len(),
            network.lines.len()
        );

        let status = if ctx.partition.non_slack.is_empty() {
            debug!("Only the slack bus is present, nothing to solve");
            SolveStatus::Converged
        } else {
            self.iterate(&mut ctx, network, config)?
        };

        match &status {
            SolveStatus::Converged => info!("{} converged in {} iterations", method, ctx.trace.len()),
            SolveStatus::MaxIterations => warn!(
                "{} did not converge within {} iterations (last max mismatch {:e})",
                method,
                config.max_iter,
                ctx.trace.last().map_or(f64::NAN, |r| r.max_mismatch)
            ),
            SolveStatus::SingularMatrix { iteration, message } => {
                error!("{} aborted at iteration {}: {}", method, iteration, message)
            }
        }

        Ok(ctx.finish(method, status, network))
    }
}

/// Solves `network` with the chosen method.
pub fn run_load_flow(
    network: &mut Network,
    method: Method,
    config: &SolverConfig,
) -> Result<PowerFlowSolution> {
    method.solver().solve(network, config)
}
