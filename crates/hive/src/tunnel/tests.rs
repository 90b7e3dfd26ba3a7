//! Unit tests for tunnels and the tunnel registry

use super::*;
use crate::{EnvelopeIdGenerator, EventBroker, SessionInfo};
use hive_proto::{Envelope, MsgType};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;

async fn setup(config: &HiveConfig) -> (SessionRegistry, TunnelRegistry, mpsc::Receiver<Envelope>) {
    let sessions = SessionRegistry::new(Arc::new(EventBroker::new(16)));
    let (session, outbound) = Session::new(
        3,
        SessionInfo::default(),
        Arc::new(EnvelopeIdGenerator::new()),
        config,
    );
    sessions.add(Arc::new(session)).await;
    let tunnels = TunnelRegistry::new(sessions.clone(), config);
    (sessions, tunnels, outbound)
}

#[tokio::test]
async fn test_create_and_get() {
    let (_sessions, tunnels, _outbound) = setup(&HiveConfig::default()).await;

    let tunnel = tunnels.create(3).await.unwrap();
    assert_eq!(tunnel.session_id(), 3);
    assert_eq!(tunnel.state(), TunnelState::Active);

    let fetched = tunnels.get(tunnel.id()).await.unwrap();
    assert!(Arc::ptr_eq(&fetched, &tunnel));
    assert_eq!(tunnels.len().await, 1);
}

#[tokio::test]
async fn test_create_unknown_session() {
    let (_sessions, tunnels, _outbound) = setup(&HiveConfig::default()).await;

    let result = tunnels.create(404).await;
    assert!(matches!(result, Err(HiveError::SessionNotFound(404))));
    assert!(tunnels.is_empty().await);
}

#[tokio::test]
async fn test_cross_wired_ends() {
    let (_sessions, tunnels, _outbound) = setup(&HiveConfig::default()).await;
    let tunnel = tunnels.create(3).await.unwrap();

    tunnel.client_end().send("from console").await.unwrap();
    assert_eq!(tunnel.session_end().recv().await.unwrap(), Bytes::from("from console"));

    tunnel.session_end().send("from agent").await.unwrap();
    assert_eq!(tunnel.client_end().recv().await.unwrap(), Bytes::from("from agent"));

    tunnel.client_end().send(Bytes::new()).await.unwrap();
    assert_eq!(tunnel.session_end().recv().await.unwrap(), Bytes::new());
}

#[tokio::test]
async fn test_close_unknown_id() {
    let (_sessions, tunnels, mut outbound) = setup(&HiveConfig::default()).await;
    let tunnel = tunnels.create(3).await.unwrap();

    let result = tunnels.close(tunnel.id().wrapping_add(1)).await;
    assert!(matches!(result, Err(HiveError::InvalidTunnelId(_))));

    assert_eq!(tunnels.len().await, 1);
    assert!(tunnels.get(tunnel.id()).await.is_some());
    assert!(outbound.try_recv().is_err());
}

#[tokio::test]
async fn test_close_notifies_agent_and_closes_client() {
    let (_sessions, tunnels, mut outbound) = setup(&HiveConfig::default()).await;
    let tunnel = tunnels.create(3).await.unwrap();

    // Reader blocked on the console side before the close
    let reader = {
        let tunnel = tunnel.clone();
        tokio::spawn(async move { tunnel.client_end().recv().await })
    };

    tunnels.close(tunnel.id()).await.unwrap();

    let notice = outbound.recv().await.unwrap();
    assert_eq!(notice.msg_type, MsgType::TunnelClose);
    assert!(!notice.is_correlated());
    let close = TunnelClose::from_payload(&notice.data).unwrap();
    assert_eq!(close, TunnelClose::new(tunnel.id(), 3));

    assert!(timeout(Duration::from_secs(1), reader).await.unwrap().unwrap().is_none());
    assert!(tunnels.get(tunnel.id()).await.is_none());
    assert_eq!(tunnel.state(), TunnelState::Closed);
    assert!(tunnel.client_end().recv().await.is_none());
    assert!(matches!(
        tunnel.client_end().send("late").await,
        Err(HiveError::TunnelClosed(_))
    ));

    // Closing twice is an unknown id
    assert!(matches!(
        tunnels.close(tunnel.id()).await,
        Err(HiveError::InvalidTunnelId(_))
    ));
}

#[tokio::test]
async fn test_session_end_observes_client_hangup() {
    let (_sessions, tunnels, _outbound) = setup(&HiveConfig::default()).await;
    let tunnel = tunnels.create(3).await.unwrap();

    tunnel.client_end().send("last words").await.unwrap();
    tunnels.close(tunnel.id()).await.unwrap();

    // Session end is not closed itself, it drains then sees the hang-up
    assert!(!tunnel.session_end().is_closed());
    assert!(tunnel.session_end().is_peer_closed());
    assert_eq!(tunnel.session_end().recv().await.unwrap(), Bytes::from("last words"));
    assert!(tunnel.session_end().recv().await.is_none());
    assert!(tunnel.session_end().send("reply").await.is_err());
}

#[tokio::test]
async fn test_close_with_stalled_transport_keeps_tunnel() {
    let config = HiveConfig::default()
        .with_outbound_capacity(1)
        .with_send_timeout(Some(Duration::from_millis(50)));
    let (sessions, tunnels, _outbound) = setup(&config).await;
    let tunnel = tunnels.create(3).await.unwrap();

    // Occupy the only outbound slot
    let session = sessions.get(3).await.unwrap();
    session.send(MsgType::Ping, Bytes::new()).await.unwrap();

    let result = tunnels.close(tunnel.id()).await;
    assert!(matches!(result, Err(HiveError::TransportUnavailable { .. })));
    assert!(tunnels.get(tunnel.id()).await.is_some());
    assert_eq!(tunnel.state(), TunnelState::Active);
}

#[tokio::test]
async fn test_close_on_stalled_session_leaves_directory_usable() {
    let config = HiveConfig::default()
        .with_outbound_capacity(1)
        .with_send_timeout(Some(Duration::from_millis(400)));
    let (sessions, tunnels, _stalled_outbound) = setup(&config).await;
    let stalled = tunnels.create(3).await.unwrap();
    sessions.get(3).await.unwrap().send(MsgType::Ping, Bytes::new()).await.unwrap();

    let (healthy, mut healthy_outbound) = Session::new(
        4,
        SessionInfo::default(),
        Arc::new(EnvelopeIdGenerator::new()),
        &config,
    );
    sessions.add(Arc::new(healthy)).await;
    let healthy_tunnel = tunnels.create(4).await.unwrap();

    let closing = {
        let tunnels = tunnels.clone();
        let id = stalled.id();
        tokio::spawn(async move { tunnels.close(id).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!closing.is_finished());

    // Other sessions keep creating, looking up and closing tunnels meanwhile
    let quick = Duration::from_millis(100);
    let fresh = timeout(quick, tunnels.create(4)).await.unwrap().unwrap();
    assert!(timeout(quick, tunnels.get(healthy_tunnel.id())).await.unwrap().is_some());
    timeout(quick, tunnels.close(fresh.id())).await.unwrap().unwrap();
    assert_eq!(healthy_outbound.recv().await.unwrap().msg_type, MsgType::TunnelClose);

    let result = closing.await.unwrap();
    assert!(matches!(result, Err(HiveError::TransportUnavailable { session_id: 3, .. })));
    assert!(tunnels.get(stalled.id()).await.is_some());
    assert_eq!(stalled.state(), TunnelState::Active);
}

#[tokio::test]
async fn test_concurrent_closes_notify_once() {
    let (_sessions, tunnels, mut outbound) = setup(&HiveConfig::default()).await;
    let tunnel = tunnels.create(3).await.unwrap();

    let (first, second) = tokio::join!(tunnels.close(tunnel.id()), tunnels.close(tunnel.id()));

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(r, Err(HiveError::InvalidTunnelId(_)))));
    assert_eq!(outbound.recv().await.unwrap().msg_type, MsgType::TunnelClose);
    assert!(outbound.try_recv().is_err());
}

#[tokio::test]
async fn test_try_send_reports_full_buffer() {
    let config = HiveConfig::default().with_tunnel_buffer(2);
    let (_sessions, tunnels, _outbound) = setup(&config).await;
    let tunnel = tunnels.create(3).await.unwrap();

    tunnel.session_end().try_send("one").unwrap();
    tunnel.session_end().try_send("two").unwrap();
    assert!(matches!(
        tunnel.session_end().try_send("three"),
        Err(HiveError::TunnelFull(_))
    ));

    assert_eq!(tunnel.client_end().recv().await.unwrap(), Bytes::from("one"));
    tunnel.session_end().try_send("three").unwrap();

    tunnel.client_end().close();
    assert!(matches!(
        tunnel.session_end().try_send("four"),
        Err(HiveError::TunnelClosed(_))
    ));
}

#[tokio::test]
async fn test_close_with_transport_gone() {
    let (_sessions, tunnels, outbound) = setup(&HiveConfig::default()).await;
    let tunnel = tunnels.create(3).await.unwrap();
    drop(outbound);

    tunnels.close(tunnel.id()).await.unwrap();
    assert!(tunnels.get(tunnel.id()).await.is_none());
    assert!(tunnel.client_end().is_closed());
}

#[tokio::test]
async fn test_id_collision_is_redrawn() {
    let (_sessions, tunnels, _outbound) = setup(&HiveConfig::default()).await;
    let sequence = [7u64, 7, 7, 8];
    let cursor = AtomicUsize::new(0);
    let tunnels = tunnels.with_id_source(move || {
        let i = cursor.fetch_add(1, Ordering::SeqCst);
        sequence[i.min(sequence.len() - 1)]
    });

    let first = tunnels.create(3).await.unwrap();
    let second = tunnels.create(3).await.unwrap();

    assert_eq!(first.id(), 7);
    assert_eq!(second.id(), 8);
    // The first tunnel was not overwritten
    assert!(Arc::ptr_eq(&tunnels.get(7).await.unwrap(), &first));
    assert_eq!(tunnels.len().await, 2);
}

#[tokio::test]
async fn test_release_closes_both_ends() {
    let (_sessions, tunnels, mut outbound) = setup(&HiveConfig::default()).await;
    let tunnel = tunnels.create(3).await.unwrap();

    let released = tunnels.release(tunnel.id()).await.unwrap();
    assert!(Arc::ptr_eq(&released, &tunnel));
    assert!(tunnel.client_end().is_closed());
    assert!(tunnel.session_end().is_closed());
    assert!(tunnels.get(tunnel.id()).await.is_none());

    // No notice goes back to the agent
    assert!(outbound.try_recv().is_err());
    assert!(tunnels.release(tunnel.id()).await.is_none());
}

#[tokio::test]
async fn test_for_session() {
    let (_sessions, tunnels, _outbound) = setup(&HiveConfig::default()).await;
    let a = tunnels.create(3).await.unwrap();
    let b = tunnels.create(3).await.unwrap();

    let mut ids: Vec<_> = tunnels.for_session(3).await.iter().map(|t| t.id()).collect();
    ids.sort();
    let mut expected = vec![a.id(), b.id()];
    expected.sort();

    assert_eq!(ids, expected);
    assert!(tunnels.for_session(4).await.is_empty());
}

proptest! {
    #[test]
    fn test_bytes_relayed_unchanged(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..256), 1..8)
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let (_sessions, tunnels, _outbound) = setup(&HiveConfig::default()).await;
            let tunnel = tunnels.create(3).await.unwrap();

            for chunk in &chunks {
                tunnel.client_end().send(chunk.clone()).await.unwrap();
                let received = tunnel.session_end().recv().await.unwrap();
                prop_assert_eq!(received.as_ref(), chunk.as_slice());

                tunnel.session_end().send(chunk.clone()).await.unwrap();
                let received = tunnel.client_end().recv().await.unwrap();
                prop_assert_eq!(received.as_ref(), chunk.as_slice());
            }

            Ok(())
        })?;
    }
}
