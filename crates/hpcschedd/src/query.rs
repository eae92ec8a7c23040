//! `query` subcommand: dump what an RM reports.

use clap::ValueEnum;
use hpc_core::SchedConfig;
use hpcsched_wiki::{WikiClient, WikiRm};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QueryTarget {
    Nodes,
    Jobs,
}

pub async fn run(config: &SchedConfig, target: QueryTarget, rm_name: Option<&str>) -> anyhow::Result<()> {
    let (index, cfg) = match rm_name {
        Some(name) => config
            .rm
            .iter()
            .enumerate()
            .find(|(_, rm)| rm.name == name)
            .ok_or_else(|| anyhow::anyhow!("no resource manager named {name}"))?,
        None => config
            .rm
            .iter()
            .enumerate()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no resource manager configured"))?,
    };
    let rm = WikiRm::new(WikiClient::new(cfg.clone()), index);

    let records = match target {
        QueryTarget::Nodes => rm.fetch_nodes().await?,
        QueryTarget::Jobs => rm.fetch_jobs().await?,
    };
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}
