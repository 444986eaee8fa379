//! `offsyncd status`: summarize the persisted state without starting sync

use anyhow::{Context, Result};
use offsync_core::config::OfsConfig;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::daemon::open_state;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub tenant: String,
    pub state_dir: PathBuf,
    pub device_id: Option<String>,
    pub last_sync_time: u64,
    pub queued: usize,
    /// entity type → queued items
    pub queued_by_type: BTreeMap<String, usize>,
    /// Items that have failed at least once
    pub retrying: usize,
}

pub fn collect(config: &OfsConfig) -> Result<StatusReport> {
    let (tenant, state) = open_state(config)?;
    let snapshot = state.load_queue().context("reading queue")?;
    let meta = state.load_meta().context("reading sync metadata")?;

    let mut queued_by_type = BTreeMap::new();
    for item in &snapshot.items {
        *queued_by_type.entry(item.entity_type.clone()).or_insert(0) += 1;
    }

    Ok(StatusReport {
        tenant: tenant.to_string(),
        state_dir: state.dir().to_path_buf(),
        device_id: meta.client_info.map(|info| info.device_id),
        last_sync_time: meta.last_sync_time,
        queued: snapshot.items.len(),
        queued_by_type,
        retrying: snapshot.items.iter().filter(|item| item.attempt > 0).count(),
    })
}

pub fn print(report: &StatusReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("tenant:          {}", report.tenant);
    println!("state dir:       {}", report.state_dir.display());
    println!(
        "device id:       {}",
        report.device_id.as_deref().unwrap_or("(not yet registered)")
    );
    if report.last_sync_time == 0 {
        println!("last sync:       never");
    } else {
        println!("last sync:       {} (unix ms)", report.last_sync_time);
    }
    println!("queued items:    {}", report.queued);
    for (entity_type, count) in &report.queued_by_type {
        println!("  {entity_type:<14} {count}");
    }
    if report.retrying > 0 {
        println!("retrying:        {}", report.retrying);
    }
    Ok(())
}
