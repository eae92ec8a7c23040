//! VM attribute registry.

use std::collections::HashMap;
use std::sync::LazyLock;

use hpc_core::NodeState;
use hpcsched_state::{SchedulerContext, Vm};
use tracing::warn;

use super::{ApplyReport, parse, parse_capacity, parse_gres_capacity};
use crate::codec::WikiMessage;
use crate::error::{WikiError, WikiResult};

pub struct VmUpdate<'a> {
    pub vm: &'a mut Vm,
    pub now: u64,
}

type VmHandler = fn(&mut VmUpdate<'_>, &str) -> WikiResult<()>;

static VM_HANDLERS: LazyLock<HashMap<&'static str, VmHandler>> = LazyLock::new(|| {
    let mut m: HashMap<&'static str, VmHandler> = HashMap::new();
    m.insert("STATE", |u, v| {
        let state = v.split(':').next().unwrap_or_default();
        u.vm.state = state
            .trim()
            .parse::<NodeState>()
            .map_err(|_| WikiError::invalid("STATE", v))?;
        Ok(())
    });
    m.insert("CPROC", |u, v| {
        u.vm.configured.procs = parse_capacity("CPROC", v)?;
        Ok(())
    });
    m.insert("APROC", |u, v| {
        u.vm.available.procs = parse_capacity("APROC", v)?;
        Ok(())
    });
    m.insert("CMEMORY", |u, v| {
        u.vm.configured.memory_mb = parse_capacity("CMEMORY", v)?;
        Ok(())
    });
    m.insert("AMEMORY", |u, v| {
        u.vm.available.memory_mb = parse_capacity("AMEMORY", v)?;
        Ok(())
    });
    m.insert("CDISK", |u, v| {
        u.vm.configured.disk_mb = parse_capacity("CDISK", v)?;
        Ok(())
    });
    m.insert("ADISK", |u, v| {
        u.vm.available.disk_mb = parse_capacity("ADISK", v)?;
        Ok(())
    });
    m.insert("CSWAP", |u, v| {
        u.vm.configured.swap_mb = parse_capacity("CSWAP", v)?;
        Ok(())
    });
    m.insert("ASWAP", |u, v| {
        u.vm.available.swap_mb = parse_capacity("ASWAP", v)?;
        Ok(())
    });
    m.insert("CRES", |u, v| {
        for (name, count) in parse_gres_capacity("CRES", v)? {
            u.vm.configured.set_generic(&name, count);
        }
        Ok(())
    });
    m.insert("ARES", |u, v| {
        for (name, count) in parse_gres_capacity("ARES", v)? {
            u.vm.available.set_generic(&name, count);
        }
        Ok(())
    });
    m.insert("OS", |u, v| {
        let os = v.trim();
        u.vm.opsys = (!os.is_empty()).then(|| os.to_string());
        Ok(())
    });
    m.insert("CONTAINERNODE", |u, v| {
        let node = v.trim();
        u.vm.container_node = (!node.is_empty()).then(|| node.to_string());
        Ok(())
    });
    m.insert("UPDATETIME", |u, v| {
        u.vm.update_time = parse("UPDATETIME", v)?;
        Ok(())
    });
    m
});

pub fn apply_vm_attr(update: &mut VmUpdate<'_>, name: &str, value: &str) -> WikiResult<()> {
    let handler = VM_HANDLERS
        .get(name)
        .ok_or_else(|| WikiError::UnknownAttribute(name.to_string()))?;
    handler(update, value)
}

/// A `GETNODES` record describes a VM if it names a container node or its
/// id is already a known VM.
pub fn is_vm_record(ctx: &SchedulerContext, msg: &WikiMessage) -> bool {
    msg.get("CONTAINERNODE").is_some() || ctx.vms.get(&msg.object_id).is_some()
}

/// `STATE=Down:destroyed`: the VM is already gone.
pub fn vm_destroyed(msg: &WikiMessage) -> bool {
    msg.get("STATE")
        .is_some_and(|s| s.trim().eq_ignore_ascii_case("down:destroyed"))
}

/// Apply a VM record, creating the VM if it is new.
pub fn apply_vm_record(ctx: &mut SchedulerContext, msg: &WikiMessage) -> ApplyReport {
    let now = ctx.now;
    let mut update = VmUpdate {
        vm: ctx.vms.get_or_create(&msg.object_id),
        now,
    };

    let mut report = ApplyReport {
        records: 1,
        ..ApplyReport::default()
    };
    for (name, value) in msg.attrs() {
        let result = apply_vm_attr(&mut update, name, value);
        if let Some(e) = report.record(name, result) {
            warn!(vm = %msg.object_id, attribute = name, error = %e, "vm attribute rejected");
        }
    }
    if msg.get("UPDATETIME").is_none() {
        update.vm.update_time = update.now;
    }
    report
}
