//! larchd: runs an in-process replication topology.
//!
//! Builds the relay and every configured member, wires them up with
//! sessions, and keeps them replicating until interrupted. With `--demo`
//! it also generates a synthetic write workload so the replication paths
//! (fanout, flow control, catch-up, conflict resolution) can be observed
//! through the periodic status reports.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use larch_repl::broker::{Broker, BrokerConfig};
use larch_repl::config::DaemonConfig;
use larch_repl::domain::{DomainConfig, ReplicationDomain};
use larch_repl::monitor::Monitor;
use larch_repl::pending::PendingConfig;
use larch_repl::relay::{Relay, RelayConfig};
use larch_repl::session::{Session, SessionConfig};
use larch_store::{Dn, DirectoryStore, Entry, EntryId, MemoryStore, Modification};

#[derive(Debug, Parser)]
#[command(name = "larchd", about = "Larch replication daemon")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, env = "LARCHD_CONFIG")]
    config: Option<PathBuf>,

    /// Print the default configuration as JSON and exit.
    #[arg(long)]
    print_default_config: bool,

    /// Generate a synthetic write workload across the members.
    #[arg(long)]
    demo: bool,

    /// Milliseconds between synthetic writes in demo mode.
    #[arg(long, default_value_t = 200)]
    demo_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if args.print_default_config {
        println!("{}", serde_json::to_string_pretty(&DaemonConfig::default())?);
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => DaemonConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            tracing::info!("no config file given, using defaults");
            DaemonConfig::default()
        }
    };
    let suffix = config.suffix_dn()?;
    tracing::info!(
        domain_id = config.domain_id,
        suffix = %suffix,
        members = config.members.len(),
        "larchd starting"
    );

    let relay = Arc::new(Relay::open(
        RelayConfig {
            domain_id: config.domain_id,
            server_id: config.relay.server_id,
            window: config.window,
            changelog: larch_repl::changelog::ChangelogConfig {
                sync_mode: config.sync_mode,
            },
            ..RelayConfig::default()
        },
        &config.relay.changelog_dir,
    )?);

    // Every member starts from the same baseline (the suffix root entry
    // with a deterministic id), so their generation ids agree.
    let root_id = root_entry_id(&suffix);

    let mut monitor = Monitor::new();
    monitor.set_relay(Arc::clone(&relay));
    let mut brokers: Vec<Arc<Broker>> = Vec::new();
    let mut tasks = Vec::new();

    for member in &config.members {
        let store = Arc::new(MemoryStore::new(suffix.clone()));
        store.add_entry(Entry::new(root_id, suffix.clone(), vec![]))?;
        let domain = Arc::new(ReplicationDomain::open(
            DomainConfig {
                domain_id: config.domain_id,
                replica_id: member.replica_id,
                changelog: larch_repl::changelog::ChangelogConfig {
                    sync_mode: config.sync_mode,
                },
                pending: PendingConfig::default(),
                max_replay_passes: 10,
            },
            store,
            &member.changelog_dir,
        )?);
        monitor.add_domain(Arc::clone(&domain));

        let (member_side, relay_side) = Session::new_pair(SessionConfig::default());
        tasks.push(tokio::spawn({
            let relay = Arc::clone(&relay);
            async move {
                if let Err(e) = relay.handle_peer(relay_side).await {
                    tracing::error!(error = %e, "relay peer task failed");
                }
            }
        }));

        let broker = Arc::new(
            Broker::connect(
                domain,
                member_side,
                BrokerConfig {
                    window: config.window,
                    heartbeat_ms: config.heartbeat_ms,
                    tick_ms: config.tick_ms,
                },
            )
            .await?,
        );
        tasks.push(tokio::spawn({
            let broker = Arc::clone(&broker);
            async move {
                if let Err(e) = broker.run().await {
                    tracing::error!(error = %e, "broker loop failed");
                }
            }
        }));
        brokers.push(broker);
    }

    if args.demo {
        tasks.push(tokio::spawn(demo_workload(
            brokers.clone(),
            suffix.clone(),
            args.demo_interval_ms,
        )));
    }

    let report_period = Duration::from_millis(config.report_every_ms.max(100));
    let monitor_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(report_period);
        loop {
            interval.tick().await;
            monitor.log_report();
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    monitor_task.abort();
    for task in tasks {
        task.abort();
    }
    Ok(())
}

/// Deterministic unique id for the suffix root entry, derived from the
/// suffix so every member computes the same one.
fn root_entry_id(suffix: &Dn) -> EntryId {
    let digest = blake3::hash(suffix.to_string().as_bytes());
    let mut word = [0u8; 16];
    word.copy_from_slice(&digest.as_bytes()[..16]);
    EntryId(uuid::Uuid::from_u128(u128::from_le_bytes(word)))
}

/// Random adds, modifies, and deletes spread over the members.
async fn demo_workload(brokers: Vec<Arc<Broker>>, suffix: Dn, interval_ms: u64) {
    let mut rng = StdRng::from_entropy();
    let mut serial = 0u64;
    let mut live: Vec<(usize, Dn)> = Vec::new();
    loop {
        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        let member = rng.gen_range(0..brokers.len());
        let broker = &brokers[member];
        let domain = broker.domain();
        let action = rng.gen_range(0..10);
        let result = if action < 6 || live.is_empty() {
            serial += 1;
            let dn = match Dn::parse(&format!("uid=demo{serial},{suffix}")) {
                Ok(dn) => dn,
                Err(_) => continue,
            };
            live.push((member, dn.clone()));
            domain.local_add(dn, vec![("uid".into(), format!("demo{serial}"))])
        } else if action < 9 {
            let (owner, dn) = live[rng.gen_range(0..live.len())].clone();
            let _ = owner;
            domain.local_modify(
                &dn,
                vec![Modification::replace("description", &format!("rev{serial}"))],
            )
        } else {
            let idx = rng.gen_range(0..live.len());
            let (_, dn) = live.swap_remove(idx);
            domain.local_delete(&dn)
        };
        match result {
            Ok(msg) => {
                if let Err(e) = broker.publish(&msg).await {
                    tracing::error!(error = %e, "demo publish failed");
                    return;
                }
            }
            Err(e) => {
                // Expected under concurrency: the target may not have
                // replicated to this member yet, or was already deleted.
                tracing::debug!(error = %e, "demo operation skipped");
            }
        }
    }
}
