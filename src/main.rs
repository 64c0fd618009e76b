//! Massive Ingest node driver
//!
//! Hosts a set of in-memory vnodes, pushes synthetic multi-vnode write
//! requests through the dispatcher and reports how they were answered.

use anyhow::{bail, Context};
use clap::{Arg, ArgAction, Command};
use massive_ingest::core::config::{Config, WalKind};
use massive_ingest::dispatch::encode_envelope;
use massive_ingest::rpc::ChannelResponder;
use massive_ingest::{
    HandlerRegistry, MsgType, RequestHandle, VnodeHandle, VnodeId, VnodeTable, WriteMessage,
    WriteNode, WriteRequest,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

fn main() -> anyhow::Result<()> {
    let matches = Command::new("massive-ingest")
        .version(massive_ingest::VERSION)
        .about("Multi-vnode write dispatch node.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
        )
        .arg(
            Arg::new("workers")
                .long("workers")
                .value_name("N")
                .help("Number of write worker slots (0 = one per CPU)")
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .value_name("DIR")
                .help("Data directory path; selects the file WAL")
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
        )
        .arg(
            Arg::new("vnodes")
                .long("vnodes")
                .value_name("IDS")
                .default_value("1,2,3,4")
                .help("Comma separated vnode ids hosted by this node")
        )
        .arg(
            Arg::new("requests")
                .long("requests")
                .value_name("N")
                .default_value("1000")
                .help("Synthetic write requests to dispatch")
        )
        .arg(
            Arg::new("metrics")
                .long("metrics")
                .action(ArgAction::SetTrue)
                .help("Print Prometheus metrics on exit")
        )
        .get_matches();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {path}"))?,
        None => Config::default(),
    };
    apply_cli_overrides(&mut config, &matches)?;
    config.validate()?;

    massive_ingest::init_logging(&config.logging.level)?;
    info!("Starting Massive Ingest v{}", massive_ingest::VERSION);

    let vnodes = parse_vnodes(
        matches
            .get_one::<String>("vnodes")
            .map(String::as_str)
            .unwrap_or_default(),
    )?;
    let requests: u64 = matches
        .get_one::<String>("requests")
        .map(|n| n.parse())
        .transpose()
        .context("invalid request count")?
        .unwrap_or(0);

    let table = Arc::new(VnodeTable::new());
    for vnode in &vnodes {
        table.open(*vnode);
    }
    info!(vnodes = vnodes.len(), "vnodes opened");

    let rows = Arc::new(AtomicU64::new(0));
    let handlers = default_handlers(Arc::clone(&rows));
    let (responder, responses) = ChannelResponder::new();
    let node = WriteNode::new(&config, table.clone(), handlers, Arc::new(responder))?;

    let started = Instant::now();
    let mut accepted = 0u64;
    for i in 0..requests {
        let request = synthetic_request(i, &vnodes);
        match node.dispatch_write(request) {
            Ok(_) => accepted += 1,
            Err(e) => warn!(request = i, error = %e, "request rejected"),
        }
    }

    let mut ok = 0u64;
    let mut failed = 0u64;
    for _ in 0..accepted {
        match responses.recv_timeout(Duration::from_secs(10)) {
            Ok(response) if response.status.is_ok() => ok += 1,
            Ok(response) => {
                debug!(request = %response.handle, code = response.code(), "write failed");
                failed += 1;
            }
            Err(_) => bail!("timed out waiting for write responses ({ok} ok, {failed} failed)"),
        }
    }
    let elapsed = started.elapsed();

    let stats = node.stats();
    info!(
        requests = accepted,
        ok,
        failed,
        rows = rows.load(Ordering::Relaxed),
        vnode_queues = stats.vnode_queues,
        live_workers = stats.pool.live_workers,
        elapsed_ms = elapsed.as_millis() as u64,
        "synthetic load complete"
    );

    node.shutdown();
    if config.metrics.enable_prometheus || matches.get_flag("metrics") {
        println!("{}", massive_ingest::system::gather_text()?);
    }
    info!("Shutdown complete");
    Ok(())
}

/// Apply command line argument overrides to configuration
fn apply_cli_overrides(config: &mut Config, matches: &clap::ArgMatches) -> anyhow::Result<()> {
    if let Some(workers) = matches.get_one::<String>("workers") {
        config.dispatch.worker_threads = workers.parse().context("invalid worker count")?;
    }

    if let Some(data_dir) = matches.get_one::<String>("data-dir") {
        config.storage.data_dir = data_dir.into();
        config.storage.wal = WalKind::File;
    }

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }

    Ok(())
}

fn parse_vnodes(raw: &str) -> anyhow::Result<Vec<VnodeId>> {
    let vnodes = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().map(VnodeId).with_context(|| format!("invalid vnode id '{s}'")))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if vnodes.is_empty() {
        bail!("at least one vnode is required");
    }
    Ok(vnodes)
}

/// Request `i` touches `i % n + 1` consecutive vnodes starting at `i % n`.
fn synthetic_request(i: u64, vnodes: &[VnodeId]) -> WriteRequest {
    let n = vnodes.len();
    let start = i as usize % n;
    let span = start + 1;
    let payloads: Vec<(VnodeId, Vec<u8>)> = (0..span)
        .map(|k| {
            let vnode = vnodes[(start + k) % n];
            (vnode, format!("req={i} vnode={} rows=1", vnode.0).into_bytes())
        })
        .collect();
    let body = encode_envelope(payloads.iter().map(|(v, p)| (*v, p.as_slice())));
    WriteRequest::new(RequestHandle(i), MsgType::SUBMIT, body)
}

fn default_handlers(rows: Arc<AtomicU64>) -> Arc<HandlerRegistry> {
    HandlerRegistry::builder()
        .register_fn(MsgType::SUBMIT, move |_: &VnodeHandle, msg: &WriteMessage| {
            rows.fetch_add(1, Ordering::Relaxed);
            debug!(vnode = %msg.vnode_id(), bytes = msg.len(), "submit applied");
            Ok(())
        })
        .register_fn(MsgType::CREATE_TABLE, |_: &VnodeHandle, msg: &WriteMessage| {
            info!(vnode = %msg.vnode_id(), "create table applied");
            Ok(())
        })
        .register_fn(MsgType::DROP_TABLE, |_: &VnodeHandle, msg: &WriteMessage| {
            info!(vnode = %msg.vnode_id(), "drop table applied");
            Ok(())
        })
        .build()
}
