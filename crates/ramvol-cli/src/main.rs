//! ramvol: exercise an in-memory volume from the command line.
//!
//! Mounts a volume against the in-process vnode host, builds a small
//! hierarchy with attributes and a live query, unlinks part of it again, and
//! prints the resulting statistics as JSON on stdout.
//!
//! Usage:
//!   cargo run -p ramvol-cli
//!   cargo run -p ramvol-cli -- --config volume.toml --files 32
//!   RUST_LOG=ramvol_kernel=trace cargo run -p ramvol-cli

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use ramvol_kernel::{
    AttributeMatchQuery, MatchChange, MemoryHost, QueryHandle, Volume, VolumeConfig, VolumeHandle,
    VolumeStats, type_code,
};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

/// Mount an in-memory volume and report on it.
#[derive(Parser, Debug)]
#[command(name = "ramvol")]
#[command(about = "Mount an in-memory volume, populate it, and report its statistics")]
struct Args {
    /// Volume config (TOML). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the volume name
    #[arg(long)]
    name: Option<String>,

    /// Files to create under each sample directory
    #[arg(long, default_value_t = 8)]
    files: usize,

    /// Pretty-print the JSON report
    #[arg(long)]
    pretty: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    volume: VolumeStats,
    /// Nodes whose `status` attribute reached "done".
    done: usize,
    /// Nodes that left the "done" set again.
    reopened: usize,
    reclaimed: usize,
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => VolumeConfig::load(path)
            .with_context(|| format!("loading volume config from {}", path.display()))?,
        None => VolumeConfig::default(),
    };
    if let Some(name) = args.name.clone() {
        config = config.with_name(name);
    }

    let host = Arc::new(MemoryHost::new());
    let volume = Volume::new(VolumeHandle::from_raw(1), host.clone(), config);
    volume.mount(0).context("mounting volume")?;
    info!(name = %volume.name(), "volume mounted");

    let done = Arc::new(AtomicUsize::new(0));
    let reopened = Arc::new(AtomicUsize::new(0));
    let query: QueryHandle = {
        let (done, reopened) = (done.clone(), reopened.clone());
        Arc::new(AttributeMatchQuery::new("status", type_code::STRING, b"done", move |change| {
            match change {
                MatchChange::Entered(_) => done.fetch_add(1, Ordering::Relaxed),
                MatchChange::Left(_) => reopened.fetch_add(1, Ordering::Relaxed),
            };
        }))
        .into()
    };
    volume.add_query(&query);

    populate(&volume, args.files)?;
    let reclaimed = reclaim(&volume, &host)?;
    volume.remove_query(&query);

    let report = Report {
        volume: volume.stats(),
        done: done.load(Ordering::Relaxed),
        reopened: reopened.load(Ordering::Relaxed),
        reclaimed,
    };
    let json = if args.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{json}");

    volume.unmount();
    host.release_volume(volume.handle());
    Ok(())
}

/// Build `docs/` and `src/` with `files` entries each, tag every file with a
/// status, then drop the odd-numbered files from `src/`.
fn populate(volume: &Volume, files: usize) -> Result<()> {
    let root = volume.root().context("mounted volume has no root")?;
    let mut writer = volume.write_lock();
    writer.create_index("status", type_code::STRING)?;

    for dir_name in ["docs", "src"] {
        let dir = writer.create_directory(&root, dir_name, 0o755)?;
        for i in 0..files {
            let file = writer.create_file(&dir, &format!("{dir_name}-{i}"), 0o644)?;
            writer.write_attribute(&file, "status", type_code::STRING, b"todo".to_vec())?;
            if i % 2 == 0 {
                writer.write_attribute(&file, "status", type_code::STRING, b"done".to_vec())?;
            }
        }
    }

    let src = writer.find_entry(root.id(), "src")?.node().clone();
    for i in (1..files).step_by(2) {
        writer.unlink(&src, &format!("src-{i}"))?;
    }
    Ok(())
}

/// Hand every vnode the host released back to the volume.
fn reclaim(volume: &Volume, host: &MemoryHost) -> Result<usize> {
    let released = host.drain_reclaimable();
    let mut writer = volume.write_lock();
    for (_, node) in &released {
        writer
            .reclaim_vnode(node)
            .with_context(|| format!("reclaiming node {}", node.id()))?;
    }
    Ok(released.len())
}
