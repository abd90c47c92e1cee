use std::fmt;

use serde::Serialize;

use crate::admittance::build_admittance;
use crate::case::{BusType, Network};
use crate::config::SolverConfig;
use crate::equations::power_injections;
use crate::error::{PowerFlowError, Result};
use crate::loadflow::{PowerFlowSolution, SolveStatus};

pub const LOW_VOLTAGE: f64 = 0.95;
pub const HIGH_VOLTAGE: f64 = 1.05;

/// Bus count above which the summary adds voltage statistics.
const STATS_MIN_BUSES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VoltageStatus {
    Low,
    Normal,
    High,
}

impl VoltageStatus {
    pub fn classify(magnitude: f64) -> Self {
        if magnitude < LOW_VOLTAGE {
            VoltageStatus::Low
        } else if magnitude > HIGH_VOLTAGE {
            VoltageStatus::High
        } else {
            VoltageStatus::Normal
        }
    }
}

impl fmt::Display for VoltageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoltageStatus::Low => write!(f, "Low"),
            VoltageStatus::Normal => write!(f, "Normal"),
            VoltageStatus::High => write!(f, "High"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusVoltageRow {
    pub bus_id: usize,
    pub magnitude: f64,
    pub angle_deg: f64,
    pub status: VoltageStatus,
}

pub fn voltage_rows(solution: &PowerFlowSolution) -> Vec<BusVoltageRow> {
    solution
        .bus_ids
        .iter()
        .zip(solution.magnitude.iter().zip(solution.angle_degrees()))
        .map(|(&bus_id, (&magnitude, angle_deg))| BusVoltageRow {
            bus_id,
            magnitude,
            angle_deg,
            status: VoltageStatus::classify(magnitude),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VoltageStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

/// Population statistics of the magnitudes. `None` when empty.
pub fn voltage_stats(magnitudes: &[f64]) -> Option<VoltageStats> {
    if magnitudes.is_empty() {
        return None;
    }
    let n = magnitudes.len() as f64;
    let mean = magnitudes.iter().sum::<f64>() / n;
    let var = magnitudes.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some(VoltageStats {
        min: magnitudes.iter().copied().fold(f64::INFINITY, f64::min),
        max: magnitudes.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        mean,
        std_dev: var.sqrt(),
    })
}

/// Calculated against specified injections at one bus, per-unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusPowerRow {
    pub bus_id: usize,
    pub bus_type: BusType,
    pub p_calc: f64,
    pub q_calc: f64,
    pub p_spec: f64,
    pub q_spec: f64,
}

/// Evaluates the final injections of `solution` on `network`. The network must
/// be the one that was solved, since reclassified buses carry their pinned
/// generation.
pub fn bus_power_rows(
    network: &Network,
    solution: &PowerFlowSolution,
    config: &SolverConfig,
) -> Result<Vec<BusPowerRow>> {
    if solution.bus_ids.len() != network.buses.len() {
        return Err(PowerFlowError::DimensionMismatch {
            expected: network.buses.len(),
            actual: solution.bus_ids.len(),
        });
    }

    let (ybus, _) = build_admittance(network, config.use_sparse(network.buses.len()))?;
    let (p, q) = power_injections(&ybus, &solution.state());
    let (p_spec, q_spec) = network.specified_injections();

    Ok(network
        .buses
        .iter()
        .enumerate()
        .map(|(i, bus)| BusPowerRow {
            bus_id: bus.bus_id,
            bus_type: bus.bus_type,
            p_calc: p[i],
            q_calc: q[i],
            p_spec: p_spec[i],
            q_spec: q_spec[i],
        })
        .collect())
}

/// Text report of a solve.
pub fn results_summary(network: &Network, solution: &PowerFlowSolution) -> String {
    let rule = "=".repeat(80);
    let mut out = String::new();

    out.push_str(&format!("{}\n", rule));
    out.push_str(&format!("  {} Load Flow Results", solution.method));
    if !network.case_name.is_empty() {
        out.push_str(&format!(": {}", network.case_name));
    }
    out.push_str(&format!("\n{}\n\n", rule));

    let state = match &solution.status {
        SolveStatus::Converged => "Converged".to_string(),
        other => format!("Not converged ({})", other),
    };
    out.push_str(&format!("Status: {}\n", state));
    out.push_str(&format!("Iterations: {}\n", solution.iterations));
    out.push_str(&format!("Buses: {}\n\n", solution.bus_ids.len()));

    if !solution.trace.is_empty() {
        out.push_str("Iteration   Max mismatch\n");
        for record in &solution.trace {
            out.push_str(&format!("{:>9}   {:.6e}\n", record.iteration, record.max_mismatch));
        }
        out.push('\n');
    }

    out.push_str("Bus Voltages:\n");
    for (row, bus_type) in voltage_rows(solution).iter().zip(&solution.bus_types) {
        out.push_str(&format!(
            "Bus {:>4} {:>5}: {:.6} pu \u{2220} {:>9.4}\u{b0}  {}\n",
            row.bus_id, bus_type, row.magnitude, row.angle_deg, row.status
        ));
    }

    if solution.bus_ids.len() > STATS_MIN_BUSES {
        if let Some(stats) = voltage_stats(&solution.magnitude) {
            out.push_str(&format!(
                "\nVoltage statistics: min {:.4} pu, max {:.4} pu, mean {:.4} pu, std {:.4} pu\n",
                stats.min, stats.max, stats.mean, stats.std_dev
            ));
        }
    }

    if !solution.diagnostics.is_empty() {
        out.push_str("\nDiagnostics:\n");
        for d in &solution.diagnostics {
            out.push_str(&format!("  - {}\n", d));
        }
    }
    out
}

pub fn voltages_csv(solution: &PowerFlowSolution) -> String {
    let mut out = String::from("bus,voltage_pu,angle_deg,status\n");
    for row in voltage_rows(solution) {
        out.push_str(&format!(
            "{},{:.6},{:.4},{}\n",
            row.bus_id, row.magnitude, row.angle_deg, row.status
        ));
    }
    out
}

fn optional(value: Option<f64>) -> String {
    value.map(|v| format!("{:e}", v)).unwrap_or_default()
}

pub fn trace_csv(solution: &PowerFlowSolution) -> String {
    let mut out = String::from(
        "iteration,max_mismatch,rms_mismatch,max_voltage_change,max_p_mismatch,max_q_mismatch\n",
    );
    for r in &solution.trace {
        out.push_str(&format!(
            "{},{:e},{},{},{},{}\n",
            r.iteration,
            r.max_mismatch,
            optional(r.rms_mismatch),
            optional(r.max_voltage_change),
            optional(r.max_p_mismatch),
            optional(r.max_q_mismatch),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::{Bus, Line};
    use crate::loadflow::{Method, run_load_flow};
    use approx::assert_abs_diff_eq;

    fn solved() -> (Network, PowerFlowSolution) {
        let mut net = Network::from_parts(
            "pair".to_string(),
            1.0,
            vec![
                Bus::new(1, BusType::Slack).with_voltage(1.06, 0.0),
                Bus::new(2, BusType::PQ).with_load(0.5, 0.2),
            ],
            vec![Line::new(1, 2, 0.01, 0.1)],
        );
        let sol = run_load_flow(&mut net, Method::NewtonRaphson, &SolverConfig::default()).unwrap();
        (net, sol)
    }

    #[test]
    fn status_thresholds() {
        assert_eq!(VoltageStatus::classify(0.94), VoltageStatus::Low);
        assert_eq!(VoltageStatus::classify(0.95), VoltageStatus::Normal);
        assert_eq!(VoltageStatus::classify(1.05), VoltageStatus::Normal);
        assert_eq!(VoltageStatus::classify(1.051), VoltageStatus::High);
    }

    #[test]
    fn stats_use_population_deviation() {
        let s = voltage_stats(&[1.0, 1.0, 0.9, 1.1]).unwrap();
        assert_eq!(s.min, 0.9);
        assert_eq!(s.max, 1.1);
        assert_abs_diff_eq!(s.mean, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s.std_dev, 0.005f64.sqrt(), epsilon = 1e-12);
        assert!(voltage_stats(&[]).is_none());
    }

    #[test]
    fn csv_has_one_row_per_bus() {
        let (_, sol) = solved();
        let csv = voltages_csv(&sol);
        let rows: Vec<&str> = csv.lines().collect();
        assert_eq!(rows[0], "bus,voltage_pu,angle_deg,status");
        assert_eq!(rows.len(), 3);
        assert!(rows[1].starts_with("1,1.060000,0.0000,High"));

        let trace = trace_csv(&sol);
        assert_eq!(trace.lines().count(), sol.trace.len() + 1);
        // Newton-Raphson leaves the voltage-change column empty
        assert!(trace.lines().nth(1).unwrap().contains(",,"));
    }

    #[test]
    fn power_rows_balance_at_convergence() {
        let (net, sol) = solved();
        let rows = bus_power_rows(&net, &sol, &SolverConfig::default()).unwrap();
        assert_abs_diff_eq!(rows[1].p_calc, rows[1].p_spec, epsilon = 1e-6);
        assert_abs_diff_eq!(rows[1].q_calc, rows[1].q_spec, epsilon = 1e-6);
        // slack covers the load plus losses
        assert!(rows[0].p_calc > 0.5);
    }

    #[test]
    fn summary_reports_method_and_buses() {
        let (net, sol) = solved();
        let text = results_summary(&net, &sol);
        assert!(text.contains("Newton-Raphson Load Flow Results: pair"));
        assert!(text.contains("Status: Converged"));
        assert!(text.contains("Bus    2"));
        assert!(!text.contains("Voltage statistics"));
    }
}
