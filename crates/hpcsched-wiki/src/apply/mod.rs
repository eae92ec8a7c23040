//! Attribute appliers.
//!
//! Each object kind has a registry mapping wire attribute names to small
//! handler functions. A record is applied attribute by attribute; unknown
//! names and rejected values are reported, not fatal.
//!
//! - **`node`**: `GETNODES` records onto [`hpcsched_state::Node`]
//! - **`job`**: `GETJOBS` records onto [`hpcsched_state::Job`]
//! - **`vm`**: `GETNODES` records that describe VMs onto [`hpcsched_state::Vm`]

pub mod job;
pub mod node;
pub mod vm;

use std::str::FromStr;

use hpc_core::UNLIMITED;

use crate::error::{WikiError, WikiResult};

pub use job::{apply_job_attr, apply_job_record};
pub use node::{apply_node_attr, apply_node_record};
pub use vm::{apply_vm_attr, apply_vm_record, is_vm_record, vm_destroyed};

/// Outcome of applying one or more records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub records: usize,
    pub applied: usize,
    pub unknown: Vec<String>,
    pub rejected: Vec<String>,
}

impl ApplyReport {
    pub fn merge(&mut self, other: ApplyReport) {
        self.records += other.records;
        self.applied += other.applied;
        self.unknown.extend(other.unknown);
        self.rejected.extend(other.rejected);
    }

    pub(crate) fn record(&mut self, name: &str, result: WikiResult<()>) -> Option<WikiError> {
        match result {
            Ok(()) => {
                self.applied += 1;
                None
            }
            Err(WikiError::UnknownAttribute(_)) => {
                self.unknown.push(name.to_string());
                None
            }
            Err(e) => {
                self.rejected.push(name.to_string());
                Some(e)
            }
        }
    }
}

pub(crate) fn parse<T: FromStr>(attribute: &str, value: &str) -> WikiResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| WikiError::invalid(attribute, value))
}

/// A configured or available amount: never negative.
pub(crate) fn parse_capacity(attribute: &str, value: &str) -> WikiResult<i64> {
    let n = parse(attribute, value)?;
    if n < 0 {
        return Err(WikiError::invalid(attribute, value));
    }
    Ok(n)
}

/// A per-task demand: non-negative, or [`UNLIMITED`] for the whole node.
pub(crate) fn parse_demand(attribute: &str, value: &str) -> WikiResult<i64> {
    let n = parse(attribute, value)?;
    if n < 0 && n != UNLIMITED {
        return Err(WikiError::invalid(attribute, value));
    }
    Ok(n)
}

/// Split a list on `:` or `,`, dropping empty items.
pub(crate) fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split([':', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Parse generic resource demands: `name[:count],name[:count],...`.
/// Counts follow [`parse_demand`].
pub fn parse_gres(attribute: &str, value: &str) -> WikiResult<Vec<(String, i64)>> {
    gres_with(attribute, value, parse_demand)
}

/// As [`parse_gres`] for node capacities; counts follow [`parse_capacity`].
pub fn parse_gres_capacity(attribute: &str, value: &str) -> WikiResult<Vec<(String, i64)>> {
    gres_with(attribute, value, parse_capacity)
}

fn gres_with(
    attribute: &str,
    value: &str,
    count: fn(&str, &str) -> WikiResult<i64>,
) -> WikiResult<Vec<(String, i64)>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| match item.split_once(':') {
            Some((name, n)) => Ok((name.to_string(), count(attribute, n)?)),
            None => Ok((item.to_string(), 1)),
        })
        .collect()
}

/// Expand `prefix[1-3,7]suffix` into individual names. Names without
/// brackets pass through.
pub fn expand_range(expr: &str) -> WikiResult<Vec<String>> {
    let (Some(open), Some(close)) = (expr.find('['), expr.rfind(']')) else {
        return Ok(vec![expr.to_string()]);
    };
    if close < open {
        return Err(WikiError::invalid("node range", expr));
    }
    let (prefix, inner, suffix) = (&expr[..open], &expr[open + 1..close], &expr[close + 1..]);

    let mut names = Vec::new();
    for part in inner.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let width = lo.len();
                let start: u64 = parse("node range", lo)?;
                let end: u64 = parse("node range", hi)?;
                if end < start {
                    return Err(WikiError::invalid("node range", part));
                }
                names.extend((start..=end).map(|i| format!("{prefix}{i:0width$}{suffix}")));
            }
            None => names.push(format!("{prefix}{part}{suffix}")),
        }
    }
    Ok(names)
}

/// Parse a task list into per-node task counts, in first-seen order.
///
/// Accepts `n1:n1:n2`, `n1*2,n2` and range forms such as `n[1-3]*2`.
pub fn parse_task_list(value: &str) -> WikiResult<Vec<(String, u32)>> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ':' | ',' if depth == 0 => {
                items.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(&value[start..]);

    let mut counts: Vec<(String, u32)> = Vec::new();
    for item in items.into_iter().map(str::trim).filter(|s| !s.is_empty()) {
        let (expr, tasks) = match item.rsplit_once('*') {
            Some((expr, n)) => (expr, parse::<u32>("TASKLIST", n)?),
            None => (item, 1),
        };
        for name in expand_range(expr)? {
            match counts.iter_mut().find(|(n, _)| *n == name) {
                Some(entry) => entry.1 += tasks,
                None => counts.push((name, tasks)),
            }
        }
    }
    Ok(counts)
}
