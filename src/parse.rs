//! Bus and line tables in plain text.
//!
//! Fields are separated by commas or whitespace and `#` starts a comment.
//!
//! Bus rows: `id type |V| angle_deg Pg Qg Pl Ql [Qmin Qmax]`, with type codes
//! 1 = slack, 2 = PV, 3 = PQ.
//! Line rows: `from to r x b`.
//!
//! A case file carries both tables after `[buses]` and `[lines]` headers and
//! may set the base power with a `base <MVA>` line before them.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use log::{debug, info};

use crate::case::{Bus, BusType, Line, Network};
use crate::error::{PowerFlowError, Result};

const BUS_TABLE: &str = "bus";
const LINE_TABLE: &str = "line";

fn parse_error(table: &'static str, line: usize, message: impl Into<String>) -> PowerFlowError {
    PowerFlowError::Parse {
        table,
        line,
        message: message.into(),
    }
}

/// Splits a row into fields, dropping any trailing comment. Blank rows give an
/// empty vector.
fn fields(row: &str) -> Vec<&str> {
    let data = row.split('#').next().unwrap_or("");
    data.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|f| !f.is_empty())
        .collect()
}

fn number(table: &'static str, line: usize, name: &str, field: &str) -> Result<f64> {
    let value: f64 = field
        .parse()
        .map_err(|_| parse_error(table, line, format!("{} '{}' is not a number", name, field)))?;
    if value.is_nan() {
        return Err(parse_error(table, line, format!("{} is NaN", name)));
    }
    Ok(value)
}

/// Integer field; integral decimals such as `2.0` are accepted.
fn integer(table: &'static str, line: usize, name: &str, field: &str) -> Result<i64> {
    let value = number(table, line, name, field)?;
    if value.fract() != 0.0 || !value.is_finite() {
        return Err(parse_error(
            table,
            line,
            format!("{} '{}' is not an integer", name, field),
        ));
    }
    Ok(value as i64)
}

fn bus_id(table: &'static str, line: usize, name: &str, field: &str) -> Result<usize> {
    let id = integer(table, line, name, field)?;
    if id < 1 {
        return Err(parse_error(
            table,
            line,
            format!("{} must be 1 or greater, got {}", name, id),
        ));
    }
    Ok(id as usize)
}

fn parse_bus_row(line: usize, f: &[&str]) -> Result<Bus> {
    if f.len() != 8 && f.len() != 10 {
        return Err(parse_error(
            BUS_TABLE,
            line,
            format!("expected 8 or 10 fields, found {}", f.len()),
        ));
    }

    let id = bus_id(BUS_TABLE, line, "bus id", f[0])?;
    let bus_type = BusType::from_code(integer(BUS_TABLE, line, "type code", f[1])?)
        .map_err(|e| parse_error(BUS_TABLE, line, e.to_string()))?;

    let mut bus = Bus::new(id, bus_type)
        .with_voltage(
            number(BUS_TABLE, line, "voltage", f[2])?,
            number(BUS_TABLE, line, "angle", f[3])?,
        )
        .with_generation(
            number(BUS_TABLE, line, "Pg", f[4])?,
            number(BUS_TABLE, line, "Qg", f[5])?,
        )
        .with_load(
            number(BUS_TABLE, line, "Pl", f[6])?,
            number(BUS_TABLE, line, "Ql", f[7])?,
        );

    if f.len() == 10 {
        let q_min = number(BUS_TABLE, line, "Qmin", f[8])?;
        let q_max = number(BUS_TABLE, line, "Qmax", f[9])?;
        if q_min > q_max {
            return Err(parse_error(
                BUS_TABLE,
                line,
                format!("Qmin {} exceeds Qmax {}", q_min, q_max),
            ));
        }
        // an infinite side means no limit on that side
        bus.q_min = Some(q_min).filter(|q| q.is_finite());
        bus.q_max = Some(q_max).filter(|q| q.is_finite());
    }

    if !(bus.voltage > 0.0) {
        return Err(parse_error(BUS_TABLE, line, "voltage set-point must be positive"));
    }
    Ok(bus)
}

fn parse_line_row(line: usize, f: &[&str]) -> Result<Line> {
    if f.len() != 5 {
        return Err(parse_error(
            LINE_TABLE,
            line,
            format!("expected 5 fields, found {}", f.len()),
        ));
    }
    let from = bus_id(LINE_TABLE, line, "from bus", f[0])?;
    let to = bus_id(LINE_TABLE, line, "to bus", f[1])?;
    if from == to {
        return Err(parse_error(LINE_TABLE, line, format!("line connects bus {} to itself", from)));
    }
    Ok(Line::new(
        from,
        to,
        number(LINE_TABLE, line, "r", f[2])?,
        number(LINE_TABLE, line, "x", f[3])?,
    )
    .with_charging(number(LINE_TABLE, line, "b", f[4])?))
}

/// Accumulates rows and rejects repeated buses or parallel lines.
#[derive(Default)]
struct Tables {
    buses: Vec<Bus>,
    lines: Vec<Line>,
    bus_ids: HashSet<usize>,
    line_ends: HashSet<(usize, usize)>,
}

impl Tables {
    fn push_bus(&mut self, line: usize, row: &[&str]) -> Result<()> {
        let bus = parse_bus_row(line, row)?;
        if !self.bus_ids.insert(bus.bus_id) {
            return Err(parse_error(
                BUS_TABLE,
                line,
                format!("bus {} is already defined", bus.bus_id),
            ));
        }
        self.buses.push(bus);
        Ok(())
    }

    fn push_line(&mut self, line: usize, row: &[&str]) -> Result<()> {
        let l = parse_line_row(line, row)?;
        let key = (l.from_bus.min(l.to_bus), l.from_bus.max(l.to_bus));
        if !self.line_ends.insert(key) {
            return Err(parse_error(
                LINE_TABLE,
                line,
                format!("a line between buses {} and {} already exists", key.0, key.1),
            ));
        }
        self.lines.push(l);
        Ok(())
    }
}

pub fn parse_bus_table(text: &str) -> Result<Vec<Bus>> {
    let mut tables = Tables::default();
    for (idx, row) in text.lines().enumerate() {
        let f = fields(row);
        if !f.is_empty() {
            tables.push_bus(idx + 1, &f)?;
        }
    }
    Ok(tables.buses)
}

pub fn parse_line_table(text: &str) -> Result<Vec<Line>> {
    let mut tables = Tables::default();
    for (idx, row) in text.lines().enumerate() {
        let f = fields(row);
        if !f.is_empty() {
            tables.push_line(idx + 1, &f)?;
        }
    }
    Ok(tables.lines)
}

/// Builds a network from separate bus and line tables.
pub fn parse_tables(case_name: &str, s_base: f64, buses: &str, lines: &str) -> Result<Network> {
    let network = Network::from_parts(
        case_name.to_string(),
        s_base,
        parse_bus_table(buses)?,
        parse_line_table(lines)?,
    );
    info!(
        "Parsed case '{}': {} buses, {} lines",
        case_name,
        network.buses.len(),
        network.lines.len()
    );
    Ok(network)
}

/// Parses a combined case file. A leading comment line names the case.
pub fn parse_case_str(text: &str) -> Result<Network> {
    #[derive(PartialEq, Debug)]
    enum Section {
        Header,
        Buses,
        Lines,
    }

    let mut section = Section::Header;
    let mut case_name = String::new();
    let mut s_base = 1.0;
    let mut tables = Tables::default();

    for (idx, row) in text.lines().enumerate() {
        let line_number = idx + 1;
        let trimmed = row.trim();

        if section == Section::Header && case_name.is_empty() {
            if let Some(comment) = trimmed.strip_prefix('#') {
                case_name = comment.trim().to_string();
                continue;
            }
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "[buses]" => {
                section = Section::Buses;
                continue;
            }
            "[lines]" => {
                section = Section::Lines;
                continue;
            }
            _ => {}
        }

        let f = fields(trimmed);
        if f.is_empty() {
            continue;
        }

        match section {
            Section::Header => match f.as_slice() {
                [key, value] if key.eq_ignore_ascii_case("base") => {
                    s_base = number("header", line_number, "base power", value)?;
                    debug!("Base power {} MVA", s_base);
                }
                _ => {
                    return Err(parse_error(
                        "header",
                        line_number,
                        format!("unexpected '{}' before the [buses] section", trimmed),
                    ));
                }
            },
            Section::Buses => tables.push_bus(line_number, &f)?,
            Section::Lines => tables.push_line(line_number, &f)?,
        }
    }

    info!(
        "Parsed case '{}': {} buses, {} lines, base {}",
        case_name,
        tables.buses.len(),
        tables.lines.len(),
        s_base
    );
    Ok(Network::from_parts(case_name, s_base, tables.buses, tables.lines))
}

pub fn read_case(path: impl AsRef<Path>) -> Result<Network> {
    let text = fs::read_to_string(path.as_ref())?;
    let mut network = parse_case_str(&text)?;
    if network.case_name.is_empty() {
        if let Some(stem) = path.as_ref().file_stem() {
            network.case_name = stem.to_string_lossy().into_owned();
        }
    }
    Ok(network)
}

/// Writes a network back out in the case file layout.
pub fn write_case(network: &Network) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {}\n", network.case_name));
    out.push_str(&format!("base {}\n\n[buses]\n", network.s_base));
    out.push_str("# id type |V| angle Pg Qg Pl Ql Qmin Qmax\n");
    for bus in &network.buses {
        out.push_str(&format!(
            "{} {} {} {} {} {} {} {}",
            bus.bus_id,
            bus.bus_type.code(),
            bus.voltage,
            bus.angle,
            bus.p_gen,
            bus.q_gen,
            bus.p_load,
            bus.q_load
        ));
        if bus.q_min.is_some() || bus.q_max.is_some() {
            let (q_min, q_max) = bus.q_limits();
            out.push_str(&format!(" {} {}", q_min, q_max));
        }
        out.push('\n');
    }
    out.push_str("\n[lines]\n# from to r x b\n");
    for line in &network.lines {
        out.push_str(&format!(
            "{} {} {} {} {}\n",
            line.from_bus, line.to_bus, line.resistance, line.reactance, line.susceptance
        ));
    }
    out
}
