use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use rstest::rstest;
use tokio::sync::mpsc::UnboundedReceiver;

use blelink::{
    ChannelObserver, FakeTransport, LinkError, OutboundRequest, SessionConfig, SessionEvent,
    SessionManager, SessionState, UsageError,
};

const ADDRESS: &str = "AA:01";

fn manager_with(transport: &Arc<FakeTransport>, config: SessionConfig) -> SessionManager {
    SessionManager::new(transport.clone(), config)
}

fn manager(transport: &Arc<FakeTransport>) -> SessionManager {
    manager_with(transport, SessionConfig::default())
}

async fn next_event(events: &mut UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("event should arrive in time")
        .expect("observer should still be alive")
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition should hold eventually");
}

async fn connect_ready(
    manager: &SessionManager,
    address: &str,
) -> anyhow::Result<UnboundedReceiver<SessionEvent>> {
    let (observer, mut events) = ChannelObserver::channel();
    manager.connect(address, observer)?.outcome().await?;
    assert_matches!(next_event(&mut events).await, SessionEvent::Connected(device) if device.address() == address);
    Ok(events)
}

#[tokio::test]
async fn connect_reaches_ready_and_reports_device() -> anyhow::Result<()> {
    let transport = Arc::new(FakeTransport::default());
    let manager = manager(&transport);

    let _events = connect_ready(&manager, ADDRESS).await?;

    assert_eq!(Some(SessionState::Ready), manager.session_state(ADDRESS));
    assert!(manager.is_connected(ADDRESS));
    assert_eq!(1, transport.open_count());
    assert_eq!(
        vec![ADDRESS.to_string()],
        manager
            .connected_devices()
            .iter()
            .map(|device| device.address().to_string())
            .collect::<Vec<_>>()
    );

    Ok(())
}

#[tokio::test]
async fn back_to_back_connects_keep_one_session() -> anyhow::Result<()> {
    let transport = Arc::new(FakeTransport::default());
    let manager = manager(&transport);
    let (first_observer, _first_events) = ChannelObserver::channel();
    let (second_observer, _second_events) = ChannelObserver::channel();

    let first = manager.connect(ADDRESS, first_observer)?;
    let second = manager.connect(ADDRESS, second_observer);

    assert_matches!(
        second,
        Err(LinkError::Usage(UsageError::AlreadyConnected { address })) if address == ADDRESS
    );
    first.outcome().await?;
    assert_eq!(1, manager.session_count());
    assert_eq!(1, transport.open_count());

    Ok(())
}

#[tokio::test]
async fn subscribe_failure_faults_and_closes_connection_once() -> anyhow::Result<()> {
    let transport = Arc::new(FakeTransport::default());
    transport.fail_subscription(ADDRESS, "notify not permitted");
    let manager = manager(&transport);
    let (observer, mut events) = ChannelObserver::channel();

    let outcome = manager.connect(ADDRESS, observer)?.outcome().await;

    assert_matches!(
        outcome,
        Err(LinkError::Subscription { address, reason })
            if address == ADDRESS && reason == "notify not permitted"
    );
    assert_matches!(next_event(&mut events).await, SessionEvent::ConnectFailed(LinkError::Subscription { .. }));
    assert_eq!(None, events.recv().await);
    assert_eq!(0, manager.session_count());
    assert_eq!(1, transport.open_count());
    assert_eq!(transport.open_count(), transport.close_count());

    Ok(())
}

#[tokio::test]
async fn open_failure_surfaces_transport_text() -> anyhow::Result<()> {
    let transport = Arc::new(FakeTransport::default());
    transport.fail_connection(ADDRESS, "peripheral unreachable");
    let manager = manager(&transport);
    let (observer, _events) = ChannelObserver::channel();

    let outcome = manager.connect(ADDRESS, observer)?.outcome().await;

    assert_matches!(
        outcome,
        Err(LinkError::Connection { reason, .. }) if reason == "peripheral unreachable"
    );
    assert_eq!(0, manager.session_count());
    assert_eq!(0, transport.close_count());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn hung_connect_times_out() -> anyhow::Result<()> {
    let transport = Arc::new(FakeTransport::default());
    transport.hang_connection(ADDRESS);
    let manager = manager_with(
        &transport,
        SessionConfig::builder()
            .connect_timeout(Duration::from_secs(2))
            .build(),
    );
    let (observer, _events) = ChannelObserver::channel();

    let outcome = manager.connect(ADDRESS, observer)?.outcome().await;

    assert_matches!(
        outcome,
        Err(LinkError::Connection { reason, .. }) if reason == "connect timed out after 2s"
    );
    assert_eq!(None, manager.session_state(ADDRESS));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn hung_subscribe_times_out_and_closes_connection() -> anyhow::Result<()> {
    let transport = Arc::new(FakeTransport::default());
    transport.hang_subscription(ADDRESS);
    let manager = manager(&transport);
    let (observer, _events) = ChannelObserver::channel();

    let outcome = manager.connect(ADDRESS, observer)?.outcome().await;

    assert_matches!(
        outcome,
        Err(LinkError::Subscription { reason, .. }) if reason == "subscribe timed out after 5s"
    );
    assert_eq!(1, transport.close_count());
    assert!(!transport.is_open(ADDRESS));

    Ok(())
}

#[tokio::test]
async fn queued_writes_reach_transport_in_submission_order() -> anyhow::Result<()> {
    let transport = Arc::new(FakeTransport::default());
    let manager = manager(&transport);
    let _events = connect_ready(&manager, ADDRESS).await?;
    transport.hold_writes();

    let receipts = ["A", "B", "C"]
        .into_iter()
        .map(|text| manager.submit(OutboundRequest::new(text)))
        .collect::<Result<Vec<_>, _>>()?;
    eventually(|| !transport.started_writes(ADDRESS).is_empty()).await;

    assert_eq!(vec![b"A".to_vec()], transport.started_writes(ADDRESS));
    assert_eq!(Some(3), manager.pending_writes(ADDRESS));

    transport.release_writes();
    for receipt in receipts {
        receipt.outcome().await?;
    }
    assert_eq!(
        vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()],
        transport.written(ADDRESS)
    );
    assert_eq!(Some(0), manager.pending_writes(ADDRESS));

    Ok(())
}

#[tokio::test]
async fn failed_write_leaves_session_ready() -> anyhow::Result<()> {
    let transport = Arc::new(FakeTransport::default());
    let manager = manager(&transport);
    let _events = connect_ready(&manager, ADDRESS).await?;
    transport.fail_next_write(ADDRESS, "gatt busy");

    let first = manager.send("one").await;
    let second = manager.send("two").await;

    assert_matches!(
        first,
        Err(LinkError::Write { address, reason }) if address == ADDRESS && reason == "gatt busy"
    );
    assert_matches!(second, Ok(()));
    assert_eq!(Some(SessionState::Ready), manager.session_state(ADDRESS));
    assert_eq!(vec![b"two".to_vec()], transport.written(ADDRESS));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn timed_out_write_fails_alone_and_session_stays_ready() -> anyhow::Result<()> {
    let transport = Arc::new(FakeTransport::default());
    let manager = manager_with(
        &transport,
        SessionConfig::builder()
            .write_timeout(Duration::from_secs(1))
            .build(),
    );
    let _events = connect_ready(&manager, ADDRESS).await?;
    transport.hold_writes();

    let stalled = manager.send("x").await;
    assert_matches!(
        stalled,
        Err(LinkError::Write { address, .. }) if address == ADDRESS
    );
    assert_eq!(Some(SessionState::Ready), manager.session_state(ADDRESS));

    transport.release_writes();
    manager.send("y").await?;
    assert_eq!(vec![b"y".to_vec()], transport.written(ADDRESS));
    assert_eq!(Some(0), manager.pending_writes(ADDRESS));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn disconnect_fails_queued_writes_after_in_flight_write_settles() -> anyhow::Result<()> {
    let transport = Arc::new(FakeTransport::default());
    let manager = manager_with(
        &transport,
        SessionConfig::builder()
            .write_timeout(Duration::from_secs(1))
            .build(),
    );
    let _events = connect_ready(&manager, ADDRESS).await?;
    transport.hold_writes();

    let mut receipts = ["A", "B", "C"]
        .into_iter()
        .map(|text| manager.submit(OutboundRequest::new(text)))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter();
    eventually(|| !transport.started_writes(ADDRESS).is_empty()).await;

    assert!(manager.disconnect(ADDRESS).await);

    let (Some(a), Some(b), Some(c)) = (receipts.next(), receipts.next(), receipts.next()) else {
        anyhow::bail!("three receipts were submitted");
    };
    assert_matches!(a.outcome().await, Err(LinkError::Write { address, .. }) if address == ADDRESS);
    for queued in [b, c] {
        assert_matches!(
            queued.outcome().await,
            Err(LinkError::Usage(UsageError::SessionClosed { address })) if address == ADDRESS
        );
    }
    assert_eq!(vec![b"A".to_vec()], transport.started_writes(ADDRESS));
    assert!(transport.written(ADDRESS).is_empty());
    assert_eq!(1, transport.close_count());

    Ok(())
}

#[tokio::test]
async fn notifications_arrive_in_order_alongside_writes() -> anyhow::Result<()> {
    let transport = Arc::new(FakeTransport::default());
    let manager = manager(&transport);
    let mut events = connect_ready(&manager, ADDRESS).await?;

    let writer = {
        let manager = manager.clone();
        tokio::spawn(async move {
            for text in ["w1", "w2", "w3"] {
                manager.send(text).await?;
            }
            Ok::<_, LinkError>(())
        })
    };
    for payload in ["N1", "N2", "N3"] {
        assert!(transport.notify(ADDRESS, payload).await);
    }

    let mut received = Vec::new();
    while received.len() < 3 {
        if let SessionEvent::Data { text, .. } = next_event(&mut events).await {
            received.push(text);
        }
    }
    writer.await??;

    assert_eq!(vec!["N1", "N2", "N3"], received);
    assert_eq!(3, transport.written(ADDRESS).len());

    Ok(())
}

#[tokio::test]
async fn undecodable_notification_is_reported_and_session_stays_ready() -> anyhow::Result<()> {
    let transport = Arc::new(FakeTransport::default());
    let manager = manager(&transport);
    let mut events = connect_ready(&manager, ADDRESS).await?;

    assert!(transport.notify(ADDRESS, vec![0xFF, 0xFE, 0x41]).await);
    assert!(transport.notify(ADDRESS, "ok").await);

    assert_matches!(
        next_event(&mut events).await,
        SessionEvent::DataError(LinkError::Decode { address, .. }) if address == ADDRESS
    );
    assert_eq!(
        SessionEvent::Data {
            address: ADDRESS.to_string(),
            text: "ok".to_string(),
        },
        next_event(&mut events).await
    );
    assert!(manager.is_connected(ADDRESS));

    Ok(())
}

#[tokio::test]
async fn link_loss_disconnects_and_removes_session() -> anyhow::Result<()> {
    let transport = Arc::new(FakeTransport::default());
    let manager = manager(&transport);
    let mut events = connect_ready(&manager, ADDRESS).await?;

    transport.drop_link(ADDRESS);

    assert_eq!(
        SessionEvent::Disconnected {
            address: ADDRESS.to_string(),
        },
        next_event(&mut events).await
    );
    assert_eq!(0, manager.session_count());
    assert_eq!(1, transport.close_count());
    assert_matches!(
        manager.send(OutboundRequest::new("late").to(ADDRESS)).await,
        Err(LinkError::Usage(UsageError::UnknownSession { .. }))
    );

    Ok(())
}

#[tokio::test]
async fn disconnect_ready_session_releases_everything() -> anyhow::Result<()> {
    let transport = Arc::new(FakeTransport::default());
    let manager = manager(&transport);
    let mut events = connect_ready(&manager, ADDRESS).await?;

    assert!(manager.disconnect(ADDRESS).await);

    assert_eq!(
        SessionEvent::Disconnected {
            address: ADDRESS.to_string(),
        },
        next_event(&mut events).await
    );
    assert_eq!(None, manager.session_state(ADDRESS));
    assert_eq!(1, transport.close_count());
    assert!(!manager.disconnect(ADDRESS).await);

    Ok(())
}

#[tokio::test]
async fn disconnect_before_handshake_starts_cancels_connect() -> anyhow::Result<()> {
    let transport = Arc::new(FakeTransport::default());
    let manager = manager(&transport);
    let (observer, mut events) = ChannelObserver::channel();

    let pending = manager.connect(ADDRESS, observer)?;
    assert!(manager.disconnect(ADDRESS).await);

    assert_matches!(
        pending.outcome().await,
        Err(LinkError::Connection { reason, .. }) if reason == "cancelled by disconnect"
    );
    assert_matches!(next_event(&mut events).await, SessionEvent::ConnectFailed(_));
    assert_eq!(0, transport.open_count());
    assert_eq!(0, manager.session_count());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_handshake_closes_opened_connection() -> anyhow::Result<()> {
    let transport = Arc::new(FakeTransport::default());
    transport.hang_subscription(ADDRESS);
    let manager = manager(&transport);
    let (observer, _events) = ChannelObserver::channel();

    let pending = manager.connect(ADDRESS, observer)?;
    eventually(|| manager.session_state(ADDRESS) == Some(SessionState::HandshakeInProgress)).await;
    assert!(manager.disconnect(ADDRESS).await);

    assert_matches!(
        pending.outcome().await,
        Err(LinkError::Connection { reason, .. }) if reason == "cancelled by disconnect"
    );
    assert_eq!(1, transport.open_count());
    assert_eq!(1, transport.close_count());
    assert_eq!(0, manager.session_count());

    Ok(())
}

#[rstest]
#[case::none(0)]
#[case::one(1)]
#[case::several(3)]
#[tokio::test]
async fn disconnect_all_empties_the_table(#[case] session_count: usize) -> anyhow::Result<()> {
    let transport = Arc::new(FakeTransport::default());
    let manager = manager(&transport);
    let mut observers = Vec::new();
    for index in 0..session_count {
        observers.push(connect_ready(&manager, &format!("AA:{index:02}")).await?);
    }

    manager.disconnect_all().await;
    manager.disconnect_all().await;

    assert_eq!(0, manager.session_count());
    assert_eq!(session_count, transport.close_count());

    Ok(())
}

#[tokio::test]
async fn untargeted_send_needs_exactly_one_ready_session() -> anyhow::Result<()> {
    let transport = Arc::new(FakeTransport::default());
    let manager = manager(&transport);

    assert_matches!(
        manager.send("hi").await,
        Err(LinkError::Usage(UsageError::NoTarget))
    );

    let _first = connect_ready(&manager, "AA:01").await?;
    manager.send("hi").await?;
    assert_eq!(vec![b"hi".to_vec()], transport.written("AA:01"));

    let _second = connect_ready(&manager, "AA:02").await?;
    assert_matches!(
        manager.send("hi").await,
        Err(LinkError::Usage(UsageError::AmbiguousTarget { count: 2 }))
    );
    manager.send(OutboundRequest::new("hi").to("AA:02")).await?;
    assert_eq!(vec![b"hi".to_vec()], transport.written("AA:02"));

    Ok(())
}

#[tokio::test]
async fn send_while_connecting_is_not_ready() -> anyhow::Result<()> {
    let transport = Arc::new(FakeTransport::default());
    transport.hang_connection(ADDRESS);
    let manager = manager(&transport);
    let (observer, _events) = ChannelObserver::channel();
    let _pending = manager.connect(ADDRESS, observer)?;
    eventually(|| manager.session_state(ADDRESS) == Some(SessionState::Connecting)).await;

    assert_matches!(
        manager.send(OutboundRequest::new("early").to(ADDRESS)).await,
        Err(LinkError::Usage(UsageError::NotReady { state: SessionState::Connecting, .. }))
    );
    assert!(transport.started_writes(ADDRESS).is_empty());

    Ok(())
}
