//! Catch-up and re-initialization: members that fall behind the relay's
//! journal either replay their way back or get a fresh snapshot.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::harness::{TestTopology, TopologyOptions};
    use larch_repl::generation::GenerationStatus;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn late_joiner_replays_history_from_relay_journal() {
        let mut topo = TestTopology::build(TopologyOptions::default()).await;
        for i in 0..10 {
            topo.add(
                i % 2,
                &format!("uid=h{i},dc=example"),
                vec![("uid".into(), format!("h{i}"))],
            )
            .await
            .unwrap();
        }
        topo.wait_converged(WAIT).await;

        let joiner = topo.add_member().await;
        topo.wait_converged(WAIT).await;
        topo.assert_same_content();
        assert_eq!(topo.member(joiner).domain.store().len(), 11);
        assert_eq!(
            topo.member(joiner).domain.status(),
            GenerationStatus::Normal
        );
    }

    #[tokio::test]
    async fn purged_journal_degrades_stale_joiner_until_full_init() {
        // Frequent state reports let the relay trim aggressively.
        let mut topo = TestTopology::build(TopologyOptions {
            heartbeat_ms: 50,
            ..TopologyOptions::default()
        })
        .await;
        for i in 0..8 {
            topo.add(0, &format!("uid=p{i},dc=example"), vec![])
                .await
                .unwrap();
        }
        topo.wait_converged(WAIT).await;

        // Both members acknowledge everything; the journal trims to empty.
        let deadline = tokio::time::Instant::now() + WAIT;
        while topo.relay().status_report().retained > 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "relay journal never trimmed"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // A fresh member's catch-up position predates the purge horizon:
        // it is admitted degraded and receives nothing.
        let joiner = topo.add_member().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            topo.member(joiner).domain.status(),
            GenerationStatus::BadGeneration
        );
        assert_eq!(topo.member(joiner).domain.store().len(), 1);

        // A healthy member streams its snapshot; the relay broadcasts it
        // and clears the degraded standing.
        topo.member(0).broker.send_full_init().await.unwrap();
        topo.wait_converged(WAIT).await;
        topo.assert_same_content();
        assert_eq!(topo.member(joiner).domain.store().len(), 9);
        assert_eq!(
            topo.member(joiner).domain.status(),
            GenerationStatus::Normal
        );
        assert_eq!(
            topo.member(joiner).domain.generation(),
            topo.member(0).domain.generation()
        );
    }
}
