//! In-process replication topologies for end-to-end tests.
//!
//! A [`TestTopology`] holds one relay and N members. Every member is seeded
//! with the same suffix root entry (same unique id), so parent references
//! and generation ids agree across the topology, as they would after a
//! shared import.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;

use larch_repl::broker::{Broker, BrokerConfig};
use larch_repl::domain::{DomainConfig, ReplicationDomain};
use larch_repl::relay::{Relay, RelayConfig};
use larch_repl::session::{Session, SessionConfig};
use larch_repl::update::UpdateMessage;
use larch_repl::window::WindowConfig;
use larch_repl::ReplError;
use larch_store::{Dn, DirectoryStore, Entry, EntryId, MemoryStore, Modification, Rdn};

/// Knobs for a test topology.
#[derive(Debug, Clone)]
pub struct TopologyOptions {
    /// Members to start with (more can join via [`TestTopology::add_member`]).
    pub members: usize,
    /// Flow-control window applied to every session.
    pub window: WindowConfig,
    /// Heartbeat / state-report interval. High by default so changelog
    /// trimming only happens when a test asks for it.
    pub heartbeat_ms: u64,
    /// Dependency-queue maintenance interval.
    pub tick_ms: u64,
}

impl Default for TopologyOptions {
    fn default() -> Self {
        Self {
            members: 2,
            window: WindowConfig::default(),
            heartbeat_ms: 60_000,
            tick_ms: 20,
        }
    }
}

/// One member of a topology: its domain and the broker serving it.
pub struct Member {
    /// The member's replica id.
    pub replica_id: i32,
    /// The member's replication domain.
    pub domain: Arc<ReplicationDomain>,
    /// The broker connecting the domain to the relay.
    pub broker: Arc<Broker>,
}

/// One relay plus N members, running on the current tokio runtime.
pub struct TestTopology {
    suffix: Dn,
    root_id: EntryId,
    relay: Arc<Relay>,
    members: Vec<Member>,
    options: TopologyOptions,
    dirs: Vec<TempDir>,
    tasks: Vec<JoinHandle<()>>,
}

impl TestTopology {
    /// Build a topology and connect all initial members.
    pub async fn build(options: TopologyOptions) -> Self {
        let suffix = Dn::parse("dc=example").unwrap();
        let relay_dir = tempfile::tempdir().unwrap();
        let relay = Arc::new(
            Relay::open(
                RelayConfig {
                    window: options.window,
                    ..RelayConfig::default()
                },
                relay_dir.path(),
            )
            .unwrap(),
        );
        let mut topology = Self {
            suffix,
            root_id: shared_root_id(),
            relay,
            members: Vec::new(),
            options: options.clone(),
            dirs: vec![relay_dir],
            tasks: Vec::new(),
        };
        for _ in 0..options.members {
            topology.add_member().await;
        }
        topology
    }

    /// Connect one more member, returning its index.
    pub async fn add_member(&mut self) -> usize {
        let replica_id = self.members.len() as i32 + 1;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new(self.suffix.clone()));
        store
            .add_entry(Entry::new(self.root_id, self.suffix.clone(), vec![]))
            .unwrap();
        let domain = Arc::new(
            ReplicationDomain::open(
                DomainConfig {
                    replica_id,
                    ..DomainConfig::default()
                },
                store,
                dir.path(),
            )
            .unwrap(),
        );
        self.dirs.push(dir);

        let (member_side, relay_side) = Session::new_pair(SessionConfig::default());
        let relay = Arc::clone(&self.relay);
        self.tasks.push(tokio::spawn(async move {
            let _ = relay.handle_peer(relay_side).await;
        }));

        let broker = Arc::new(
            Broker::connect(
                Arc::clone(&domain),
                member_side,
                BrokerConfig {
                    window: self.options.window,
                    heartbeat_ms: self.options.heartbeat_ms,
                    tick_ms: self.options.tick_ms,
                },
            )
            .await
            .unwrap(),
        );
        let runner = Arc::clone(&broker);
        self.tasks.push(tokio::spawn(async move {
            let _ = runner.run().await;
        }));

        self.members.push(Member {
            replica_id,
            domain,
            broker,
        });
        self.members.len() - 1
    }

    /// The topology's relay.
    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// One member by index.
    pub fn member(&self, idx: usize) -> &Member {
        &self.members[idx]
    }

    /// The domain suffix shared by every member.
    pub fn suffix(&self) -> &Dn {
        &self.suffix
    }

    /// Add an entry on one member and publish the update.
    pub async fn add(
        &self,
        member: usize,
        dn: &str,
        attrs: Vec<(String, String)>,
    ) -> Result<UpdateMessage, ReplError> {
        let m = &self.members[member];
        let msg = m.domain.local_add(Dn::parse(dn)?, attrs)?;
        m.broker.publish(&msg).await?;
        Ok(msg)
    }

    /// Modify an entry on one member and publish the update.
    pub async fn modify(
        &self,
        member: usize,
        dn: &str,
        mods: Vec<Modification>,
    ) -> Result<UpdateMessage, ReplError> {
        let m = &self.members[member];
        let msg = m.domain.local_modify(&Dn::parse(dn)?, mods)?;
        m.broker.publish(&msg).await?;
        Ok(msg)
    }

    /// Delete an entry on one member and publish the update.
    pub async fn delete(&self, member: usize, dn: &str) -> Result<UpdateMessage, ReplError> {
        let m = &self.members[member];
        let msg = m.domain.local_delete(&Dn::parse(dn)?)?;
        m.broker.publish(&msg).await?;
        Ok(msg)
    }

    /// Rename/move an entry on one member and publish the update.
    pub async fn rename(
        &self,
        member: usize,
        dn: &str,
        new_rdn: Rdn,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
    ) -> Result<UpdateMessage, ReplError> {
        let m = &self.members[member];
        let new_superior = match new_superior {
            Some(s) => Some(Dn::parse(s)?),
            None => None,
        };
        let msg = m
            .domain
            .local_modify_dn(&Dn::parse(dn)?, new_rdn, delete_old_rdn, new_superior)?;
        m.broker.publish(&msg).await?;
        Ok(msg)
    }

    /// True when every member reports the same state vector with an empty
    /// dependency queue.
    pub fn is_converged(&self) -> bool {
        let mut reports = self.members.iter().map(|m| m.domain.status_report());
        let Some(first) = reports.next() else {
            return true;
        };
        first.pending == 0 && reports.all(|r| r.pending == 0 && r.state == first.state)
    }

    /// Poll until the topology converges, panicking after `timeout`.
    pub async fn wait_converged(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_converged() {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                let states: Vec<String> = self
                    .members
                    .iter()
                    .map(|m| m.domain.status_report().state)
                    .collect();
                panic!("topology did not converge within {timeout:?}: {states:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// One member's entries as `(dn, attributes)`, sorted by DN.
    pub fn contents(&self, member: usize) -> Vec<(String, BTreeMap<String, Vec<String>>)> {
        let mut out: Vec<_> = self.members[member]
            .domain
            .store()
            .baseline()
            .into_iter()
            .map(|e| (e.dn.to_string(), e.attrs))
            .collect();
        out.sort();
        out
    }

    /// Assert that every member holds the same entries with the same
    /// attributes.
    pub fn assert_same_content(&self) {
        let first = self.contents(0);
        for i in 1..self.members.len() {
            assert_eq!(
                self.contents(i),
                first,
                "member {i} diverged from member 0"
            );
        }
    }
}

impl Drop for TestTopology {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// The fixed unique id every member assigns its suffix root, standing in
/// for the shared id a common import would establish.
pub fn shared_root_id() -> EntryId {
    EntryId(uuid::Uuid::from_u128(0x4c41_5243_4854_4553_5452_4f4f_5401))
}
