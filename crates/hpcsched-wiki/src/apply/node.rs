//! Node attribute registry.

use std::collections::HashMap;
use std::sync::LazyLock;

use hpc_core::{NodeAccessPolicy, NodeState, ResourceVector};
use hpcsched_state::{Node, PartitionRegistry, SchedulerContext};
use tracing::{debug, warn};

use super::{ApplyReport, parse, parse_capacity, parse_gres_capacity, split_list};
use crate::codec::WikiMessage;
use crate::error::{WikiError, WikiResult};

/// Mutable view handed to node handlers.
pub struct NodeUpdate<'a> {
    pub node: &'a mut Node,
    pub partitions: &'a mut PartitionRegistry,
    pub rm_index: usize,
    pub now: u64,
}

impl NodeUpdate<'_> {
    fn reported(&mut self) -> &mut ResourceVector {
        let configured = &self.node.configured;
        self.node.reported.get_or_insert_with(|| configured.clone())
    }
}

type NodeHandler = fn(&mut NodeUpdate<'_>, &str) -> WikiResult<()>;

static NODE_HANDLERS: LazyLock<HashMap<&'static str, NodeHandler>> = LazyLock::new(|| {
    let mut m: HashMap<&'static str, NodeHandler> = HashMap::new();
    m.insert("STATE", apply_state);
    m.insert("CPROC", |u, v| {
        u.node.configured.procs = parse_capacity("CPROC", v)?;
        Ok(())
    });
    m.insert("APROC", |u, v| {
        u.reported().procs = parse_capacity("APROC", v)?;
        Ok(())
    });
    m.insert("CMEMORY", |u, v| {
        u.node.configured.memory_mb = parse_capacity("CMEMORY", v)?;
        Ok(())
    });
    m.insert("AMEMORY", |u, v| {
        u.reported().memory_mb = parse_capacity("AMEMORY", v)?;
        Ok(())
    });
    m.insert("CDISK", |u, v| {
        u.node.configured.disk_mb = parse_capacity("CDISK", v)?;
        Ok(())
    });
    m.insert("ADISK", |u, v| {
        u.reported().disk_mb = parse_capacity("ADISK", v)?;
        Ok(())
    });
    m.insert("CSWAP", |u, v| {
        u.node.configured.swap_mb = parse_capacity("CSWAP", v)?;
        Ok(())
    });
    m.insert("ASWAP", |u, v| {
        u.reported().swap_mb = parse_capacity("ASWAP", v)?;
        Ok(())
    });
    m.insert("CRES", |u, v| {
        for (name, count) in parse_gres_capacity("CRES", v)? {
            u.node.configured.set_generic(&name, count);
        }
        Ok(())
    });
    m.insert("ARES", apply_available_gres);
    m.insert("FEATURE", |u, v| {
        u.node.features = split_list(v).map(str::to_string).collect();
        Ok(())
    });
    m.insert("PARTITION", |u, v| {
        u.node.partition = u.partitions.get_or_create(v.trim());
        Ok(())
    });
    m.insert("ARCH", |u, v| {
        u.node.arch = Some(v.trim().to_string());
        Ok(())
    });
    m.insert("OS", |u, v| {
        u.node.opsys = Some(v.trim().to_string());
        Ok(())
    });
    m.insert("NODEACCESSPOLICY", |u, v| {
        u.node.access_policy = v
            .parse::<NodeAccessPolicy>()
            .map_err(|_| WikiError::invalid("NODEACCESSPOLICY", v))?;
        Ok(())
    });
    m.insert("CPULOAD", |u, v| {
        u.node.cpu_load = parse("CPULOAD", v)?;
        Ok(())
    });
    m.insert("SPEED", |u, v| {
        u.node.speed = parse("SPEED", v)?;
        Ok(())
    });
    m.insert("PRIORITY", |u, v| {
        u.node.priority = parse("PRIORITY", v)?;
        Ok(())
    });
    m.insert("UPDATETIME", |u, v| {
        u.node.update_time = parse("UPDATETIME", v)?;
        Ok(())
    });
    m.insert("MESSAGE", |u, v| {
        u.node.message = Some(hpc_core::bounded_message(v));
        Ok(())
    });
    m
});

/// `STATE=<state>[:<substate>]`.
fn apply_state(u: &mut NodeUpdate<'_>, value: &str) -> WikiResult<()> {
    let (state, substate) = match value.split_once(':') {
        Some((s, sub)) => (s, Some(sub)),
        None => (value, None),
    };
    let state: NodeState = state
        .trim()
        .parse()
        .map_err(|_| WikiError::invalid("STATE", value))?;

    let previous = u.node.state;
    u.node.rm_state.insert(u.rm_index, state);
    u.node.set_state(state, u.now);
    u.node.substate = substate
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    if previous != state {
        debug!(node = %u.node.id, from = %previous, to = %state, "node state changed");
    }
    Ok(())
}

/// Available gres above the configured amount raises the configured amount.
fn apply_available_gres(u: &mut NodeUpdate<'_>, value: &str) -> WikiResult<()> {
    for (name, count) in parse_gres_capacity("ARES", value)? {
        if count > u.node.configured.generic(&name) {
            u.node.configured.set_generic(&name, count);
        }
        u.reported().set_generic(&name, count);
    }
    Ok(())
}

/// Apply one attribute. Unknown names yield `UnknownAttribute`.
pub fn apply_node_attr(update: &mut NodeUpdate<'_>, name: &str, value: &str) -> WikiResult<()> {
    let handler = NODE_HANDLERS
        .get(name)
        .ok_or_else(|| WikiError::UnknownAttribute(name.to_string()))?;
    handler(update, value)
}

/// Apply a `GETNODES` record, creating the node if it is new.
pub fn apply_node_record(ctx: &mut SchedulerContext, rm_index: usize, msg: &WikiMessage) -> ApplyReport {
    let now = ctx.now;
    let node = ctx.nodes.get_or_create(&msg.object_id);
    let mut update = NodeUpdate {
        node,
        partitions: &mut ctx.partitions,
        rm_index,
        now,
    };

    let mut report = ApplyReport {
        records: 1,
        ..ApplyReport::default()
    };
    for (name, value) in msg.attrs() {
        let result = apply_node_attr(&mut update, name, value);
        if let Some(e) = report.record(name, result) {
            warn!(node = %msg.object_id, attribute = name, error = %e, "node attribute rejected");
        }
    }
    if msg.get("UPDATETIME").is_none() {
        update.node.update_time = now;
    }
    if !report.unknown.is_empty() {
        debug!(node = %msg.object_id, unknown = ?report.unknown, "unknown node attributes");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_record;

    fn make_ctx() -> SchedulerContext {
        let mut ctx = SchedulerContext::default();
        ctx.begin_iteration(100);
        ctx
    }

    #[test]
    fn full_node_record() {
        let mut ctx = make_ctx();
        let msg = decode_record(
            "n1:STATE=Busy:maint;CPROC=8;APROC=2;CMEMORY=4096;AMEMORY=1024;\
             FEATURE=fast:ib;PARTITION=batch;ARCH=x86_64;OS=linux;CRES=gpu:2;ARES=gpu:4;\
             NODEACCESSPOLICY=SINGLEJOB;CPULOAD=1.5",
        )
        .unwrap();
        let report = apply_node_record(&mut ctx, 0, &msg);
        assert!(report.rejected.is_empty());
        assert!(report.unknown.is_empty());

        let node = ctx.nodes.by_id("n1").unwrap();
        assert_eq!(node.state, NodeState::Busy);
        assert_eq!(node.substate.as_deref(), Some("maint"));
        assert_eq!(node.rm_state.get(&0), Some(&NodeState::Busy));
        assert_eq!(node.configured.procs, 8);
        assert_eq!(node.reported.as_ref().unwrap().procs, 2);
        assert_eq!(node.reported.as_ref().unwrap().memory_mb, 1024);
        assert!(node.has_feature("fast") && node.has_feature("ib"));
        assert_eq!(ctx.partitions.by_name("batch").unwrap().id, node.partition);
        assert_eq!(node.configured.generic("gpu"), 4);
        assert_eq!(node.access_policy, NodeAccessPolicy::SingleJob);
        assert_eq!(node.update_time, 100);
        assert_eq!(node.state_mtime, 100);
    }

    #[test]
    fn draining_maps_to_draining() {
        let mut ctx = make_ctx();
        apply_node_record(&mut ctx, 0, &decode_record("n1:STATE=Draining").unwrap());
        assert_eq!(ctx.nodes.by_id("n1").unwrap().state, NodeState::Draining);
    }

    #[test]
    fn bad_value_is_rejected_but_record_continues() {
        let mut ctx = make_ctx();
        let msg = decode_record("n1:CPROC=lots;CMEMORY=512;BOGUS=1").unwrap();
        let report = apply_node_record(&mut ctx, 0, &msg);
        assert_eq!(report.rejected, vec!["CPROC"]);
        assert_eq!(report.unknown, vec!["BOGUS"]);
        assert_eq!(ctx.nodes.by_id("n1").unwrap().configured.memory_mb, 512);
    }

    #[test]
    fn negative_capacity_is_rejected() {
        let mut ctx = make_ctx();
        let msg = decode_record("n1:CPROC=4;APROC=-3;CMEMORY=-1;CRES=gpu:-2").unwrap();
        let report = apply_node_record(&mut ctx, 0, &msg);
        assert_eq!(report.rejected, vec!["APROC", "CMEMORY", "CRES"]);
        let node = ctx.nodes.by_id("n1").unwrap();
        assert_eq!(node.configured, ResourceVector::procs(4));
        assert!(node.reported.is_none());
    }

    #[test]
    fn single_handler_in_isolation() {
        let mut node = Node::new("n1", ResourceVector::procs(4));
        let mut partitions = PartitionRegistry::default();
        let mut update = NodeUpdate {
            node: &mut node,
            partitions: &mut partitions,
            rm_index: 1,
            now: 7,
        };
        apply_node_attr(&mut update, "STATE", "Down").unwrap();
        assert!(matches!(
            apply_node_attr(&mut update, "NOPE", "1"),
            Err(WikiError::UnknownAttribute(_))
        ));
        assert_eq!(node.state, NodeState::Down);
        assert_eq!(node.rm_state.get(&1), Some(&NodeState::Down));
    }
}
