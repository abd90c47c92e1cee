use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{PowerFlowError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusType {
    Slack, // slack, swing, reference bus
    PV,    // generator bus
    PQ,    // load bus
}

impl BusType {
    /// Decodes the boundary type code: 1 = slack, 2 = PV, 3 = PQ.
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(BusType::Slack),
            2 => Ok(BusType::PV),
            3 => Ok(BusType::PQ),
            other => Err(PowerFlowError::InvalidTypeCode(other)),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            BusType::Slack => 1,
            BusType::PV => 2,
            BusType::PQ => 3,
        }
    }

    /// Allowed type transitions during a solve. A PV bus may drop to PQ when
    /// its reactive limits are violated; nothing else ever changes.
    pub fn can_transition_to(&self, next: BusType) -> bool {
        *self == next || matches!((self, next), (BusType::PV, BusType::PQ))
    }
}

impl fmt::Display for BusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusType::Slack => write!(f, "Slack"),
            BusType::PV => write!(f, "PV"),
            BusType::PQ => write!(f, "PQ"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bus {
    // Identifiers
    pub bus_id: usize,
    pub bus_type: BusType,

    // Voltage set-point (magnitude in pu, angle in degrees)
    pub voltage: f64,
    pub angle: f64,

    // Injections
    #[serde(default)]
    pub p_gen: f64,
    #[serde(default)]
    pub q_gen: f64,
    #[serde(default)]
    pub p_load: f64,
    #[serde(default)]
    pub q_load: f64,

    // Reactive limits, None = unbounded
    #[serde(default)]
    pub q_min: Option<f64>,
    #[serde(default)]
    pub q_max: Option<f64>,
}

impl Bus {
    pub fn new(bus_id: usize, bus_type: BusType) -> Self {
        Self {
            bus_id,
            bus_type,
            voltage: 1.0,
            angle: 0.0,
            p_gen: 0.0,
            q_gen: 0.0,
            p_load: 0.0,
            q_load: 0.0,
            q_min: None,
            q_max: None,
        }
    }

    pub fn with_voltage(mut self, voltage: f64, angle: f64) -> Self {
        self.voltage = voltage;
        self.angle = angle;
        self
    }

    pub fn with_generation(mut self, p_gen: f64, q_gen: f64) -> Self {
        self.p_gen = p_gen;
        self.q_gen = q_gen;
        self
    }

    pub fn with_load(mut self, p_load: f64, q_load: f64) -> Self {
        self.p_load = p_load;
        self.q_load = q_load;
        self
    }

    pub fn with_q_limits(mut self, q_min: f64, q_max: f64) -> Self {
        self.q_min = Some(q_min);
        self.q_max = Some(q_max);
        self
    }

    /// Net specified active injection (generation minus load).
    pub fn p_spec(&self) -> f64 {
        self.p_gen - self.p_load
    }

    /// Net specified reactive injection (generation minus load).
    pub fn q_spec(&self) -> f64 {
        self.q_gen - self.q_load
    }

    pub fn q_limits(&self) -> (f64, f64) {
        (
            self.q_min.unwrap_or(f64::NEG_INFINITY),
            self.q_max.unwrap_or(f64::INFINITY),
        )
    }

    /// Changes the bus type through the transition table.
    pub fn reclassify(&mut self, next: BusType) -> Result<()> {
        if !self.bus_type.can_transition_to(next) {
            return Err(PowerFlowError::InvalidTransition {
                bus_id: self.bus_id,
                from: self.bus_type,
                to: next,
            });
        }
        self.bus_type = next;
        Ok(())
    }
}

impl fmt::Display for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bus {:>3} {:>5}  |V|={:.4}  Angle={:>8.3}  Pg={:>8.4} Qg={:>8.4}  Pl={:>8.4} Ql={:>8.4}",
            self.bus_id,
            self.bus_type,
            self.voltage,
            self.angle,
            self.p_gen,
            self.q_gen,
            self.p_load,
            self.q_load,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub from_bus: usize,
    pub to_bus: usize,

    // Series impedance and total line charging (pu)
    pub resistance: f64,
    pub reactance: f64,
    #[serde(default)]
    pub susceptance: f64,
}

impl Line {
    pub fn new(from_bus: usize, to_bus: usize, resistance: f64, reactance: f64) -> Self {
        Self {
            from_bus,
            to_bus,
            resistance,
            reactance,
            susceptance: 0.0,
        }
    }

    pub fn with_charging(mut self, susceptance: f64) -> Self {
        self.susceptance = susceptance;
        self
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Line {:>3} -> {:<3}  R={:>10.6}  X={:>10.6}  B={:>10.6}",
            self.from_bus, self.to_bus, self.resistance, self.reactance, self.susceptance,
        )
    }
}

fn default_s_base() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    #[serde(default)]
    pub case_name: String,
    #[serde(default = "default_s_base")]
    pub s_base: f64,

    pub buses: Vec<Bus>,
    #[serde(default)]
    pub lines: Vec<Line>,
    #[serde(skip)]
    pub bus_map: HashMap<usize, usize>, // bus_id -> matrix index
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Case: {}  Sbase: {}", self.case_name, self.s_base)?;
        writeln!(f, "{} buses, {} lines\n", self.buses.len(), self.lines.len())?;

        writeln!(f, "=== Buses ===")?;
        for bus in &self.buses {
            writeln!(f, "  {}", bus)?;
        }

        writeln!(f, "\n=== Lines ===")?;
        for line in &self.lines {
            writeln!(f, "  {}", line)?;
        }

        Ok(())
    }
}

impl Network {
    // New case
    pub fn new(case_name: String, s_base: f64) -> Self {
        Self {
            case_name,
            s_base,
            buses: Vec::new(),
            lines: Vec::new(),
            bus_map: HashMap::new(),
        }
    }

    pub fn from_parts(case_name: String, s_base: f64, buses: Vec<Bus>, lines: Vec<Line>) -> Self {
        let mut network = Self {
            case_name,
            s_base,
            buses,
            lines,
            bus_map: HashMap::new(),
        };
        network.rebuild_bus_map();
        network
    }

    /// Rebuild bus_map from current buses list (must be called after any bus change)
    pub fn rebuild_bus_map(&mut self) {
        self.bus_map.clear();
        for (matrix_idx, bus) in self.buses.iter().enumerate() {
            self.bus_map.insert(bus.bus_id, matrix_idx);
        }
    }

    pub fn index_of(&self, bus_id: usize) -> Result<usize> {
        self.bus_map
            .get(&bus_id)
            .copied()
            .ok_or(PowerFlowError::UnknownBus(bus_id))
    }

    pub fn bus(&self, bus_id: usize) -> Option<&Bus> {
        self.bus_map.get(&bus_id).map(|&idx| &self.buses[idx])
    }

    pub fn bus_types(&self) -> Vec<BusType> {
        self.buses.iter().map(|b| b.bus_type).collect()
    }

    pub fn slack_index(&self) -> Result<usize> {
        let slacks: Vec<usize> = self
            .buses
            .iter()
            .enumerate()
            .filter(|(_, b)| b.bus_type == BusType::Slack)
            .map(|(idx, _)| idx)
            .collect();
        match slacks.as_slice() {
            [idx] => Ok(*idx),
            _ => Err(PowerFlowError::SlackCount(slacks.len())),
        }
    }

    /// Checks the input invariants a solve relies on. Zero-impedance lines are
    /// not rejected here; the admittance builder skips them with a warning.
    pub fn validate(&mut self) -> Result<()> {
        if self.buses.is_empty() {
            return Err(PowerFlowError::EmptyNetwork);
        }

        self.rebuild_bus_map();
        if self.bus_map.len() != self.buses.len() {
            let mut seen = HashMap::new();
            for bus in &self.buses {
                if seen.insert(bus.bus_id, ()).is_some() {
                    return Err(PowerFlowError::DuplicateBus(bus.bus_id));
                }
            }
        }

        self.slack_index()?;

        for line in &self.lines {
            self.index_of(line.from_bus)?;
            self.index_of(line.to_bus)?;
        }

        if !(self.s_base.is_finite() && self.s_base > 0.0) {
            return Err(PowerFlowError::InvalidConfig(format!(
                "base power must be positive, got {}",
                self.s_base
            )));
        }

        for bus in &self.buses {
            let (q_min, q_max) = bus.q_limits();
            if q_min > q_max {
                return Err(PowerFlowError::InvalidConfig(format!(
                    "bus {} has Qmin {} above Qmax {}",
                    bus.bus_id, q_min, q_max
                )));
            }
            let regulated = matches!(bus.bus_type, BusType::Slack | BusType::PV);
            if regulated && !(bus.voltage.is_finite() && bus.voltage > 0.0) {
                return Err(PowerFlowError::InvalidConfig(format!(
                    "bus {} voltage set-point must be positive, got {}",
                    bus.bus_id, bus.voltage
                )));
            }
        }

        Ok(())
    }

    /// Specified net injections in per-unit of the case base.
    pub fn specified_injections(&self) -> (Vec<f64>, Vec<f64>) {
        let p = self.buses.iter().map(|b| b.p_spec() / self.s_base).collect();
        let q = self.buses.iter().map(|b| b.q_spec() / self.s_base).collect();
        (p, q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_bus() -> Network {
        Network::from_parts(
            "three".to_string(),
            1.0,
            vec![
                Bus::new(1, BusType::Slack).with_voltage(1.05, 0.0),
                Bus::new(2, BusType::PV).with_voltage(1.03, 0.0).with_generation(0.5, 0.0),
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
    fn type_codes_round_trip() {
        for code in 1..=3 {
            assert_eq!(BusType::from_code(code).unwrap().code() as i64, code);
        }
        assert!(matches!(
            BusType::from_code(4),
            Err(PowerFlowError::InvalidTypeCode(4))
        ));
    }

    #[test]
    fn only_pv_to_pq_is_allowed() {
        assert!(BusType::PV.can_transition_to(BusType::PQ));
        assert!(BusType::PQ.can_transition_to(BusType::PQ));
        assert!(!BusType::PQ.can_transition_to(BusType::PV));
        assert!(!BusType::Slack.can_transition_to(BusType::PQ));
        assert!(!BusType::PV.can_transition_to(BusType::Slack));

        let mut bus = Bus::new(4, BusType::PV);
        bus.reclassify(BusType::PQ).unwrap();
        let err = bus.reclassify(BusType::PV).unwrap_err();
        assert!(matches!(err, PowerFlowError::InvalidTransition { bus_id: 4, .. }));
        assert_eq!(bus.bus_type, BusType::PQ);
    }

    #[test]
    fn validate_accepts_well_formed_case() {
        let mut net = three_bus();
        net.validate().unwrap();
        assert_eq!(net.slack_index().unwrap(), 0);
        assert_eq!(net.index_of(3).unwrap(), 2);
    }

    #[test]
    fn validate_rejects_slack_violations() {
        let mut none = three_bus();
        none.buses[0].bus_type = BusType::PQ;
        assert!(matches!(none.validate(), Err(PowerFlowError::SlackCount(0))));

        let mut two = three_bus();
        two.buses[1].bus_type = BusType::Slack;
        assert!(matches!(two.validate(), Err(PowerFlowError::SlackCount(2))));
    }

    #[test]
    fn validate_rejects_unknown_and_duplicate_buses() {
        let mut dangling = three_bus();
        dangling.lines.push(Line::new(3, 9, 0.1, 0.1));
        assert!(matches!(dangling.validate(), Err(PowerFlowError::UnknownBus(9))));

        let mut dup = three_bus();
        dup.buses.push(Bus::new(2, BusType::PQ));
        assert!(matches!(dup.validate(), Err(PowerFlowError::DuplicateBus(2))));
    }

    #[test]
    fn validate_rejects_bad_voltage_set_points() {
        for voltage in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let mut pv = three_bus();
            pv.buses[1].voltage = voltage;
            assert!(matches!(pv.validate(), Err(PowerFlowError::InvalidConfig(_))));

            let mut slack = three_bus();
            slack.buses[0].voltage = voltage;
            assert!(matches!(slack.validate(), Err(PowerFlowError::InvalidConfig(_))));
        }

        // a PQ magnitude is only an estimate
        let mut pq = three_bus();
        pq.buses[2].voltage = 0.0;
        pq.validate().unwrap();
    }

    #[test]
    fn injections_are_scaled_by_base_power() {
        let mut net = three_bus();
        net.s_base = 100.0;
        net.buses[2].p_load = 80.0;
        net.buses[2].q_load = 40.0;
        let (p, q) = net.specified_injections();
        assert!((p[2] + 0.8).abs() < 1e-12);
        assert!((q[2] + 0.4).abs() < 1e-12);
    }
}
