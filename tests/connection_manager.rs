use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use renogy_ble::frame;
use renogy_ble::manager::{ConnectionManager, ConnectionManagerConfig, SessionHandle};
use renogy_ble::mock::{MockReply, MockTransportFactory};
use renogy_ble::session::SessionState;
use renogy_ble::GatewayError;

const ADDRESS: &str = "AA:BB:CC:DD:EE:01";

fn manager(factory: &Arc<MockTransportFactory>, config: ConnectionManagerConfig) -> Arc<ConnectionManager> {
    ConnectionManager::new(factory.clone(), config)
}

#[tokio::test(start_paused = true)]
async fn concurrent_acquires_share_one_session() {
    let factory = Arc::new(MockTransportFactory::new());
    let device = factory.device(ADDRESS);
    device.set_connect_delay(Duration::from_millis(200));
    let manager = manager(&factory, ConnectionManagerConfig::default());

    let tasks = (0..8).map(|_| {
        let manager = manager.clone();
        tokio::spawn(async move { manager.acquire(ADDRESS).await })
    });
    let sessions: Vec<SessionHandle> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(device.opens(), 1);
    assert!(sessions.iter().all(|session| session.same_session(&sessions[0])));
    assert_eq!(manager.cached_sessions().await, 1);
    assert_eq!(sessions[0].state().await, SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn idle_sessions_are_swept_after_ttl() {
    let factory = Arc::new(MockTransportFactory::new());
    let device = factory.device(ADDRESS);
    let config = ConnectionManagerConfig { cache_ttl: Duration::from_secs(60), ..Default::default() };
    let manager = manager(&factory, config);

    manager.acquire(ADDRESS).await.unwrap();
    tokio::time::advance(Duration::from_secs(40)).await;
    // Reuse refreshes the entry.
    manager.acquire(ADDRESS).await.unwrap();
    tokio::time::advance(Duration::from_secs(40)).await;
    assert_eq!(manager.sweep().await, 0);
    assert_eq!(device.opens(), 1);

    tokio::time::advance(Duration::from_secs(21)).await;
    assert_eq!(manager.sweep().await, 1);
    assert!(!manager.is_cached(ADDRESS).await);
    assert_eq!(device.closes(), 1);

    manager.acquire(ADDRESS).await.unwrap();
    assert_eq!(device.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn background_sweeper_closes_expired_sessions() {
    let factory = Arc::new(MockTransportFactory::new());
    let device = factory.device(ADDRESS);
    let config = ConnectionManagerConfig {
        cache_ttl: Duration::from_secs(10),
        sweep_interval: Duration::from_secs(5),
        ..Default::default()
    };
    let manager = manager(&factory, config);
    manager.start_sweeper().await;

    manager.acquire(ADDRESS).await.unwrap();
    tokio::time::sleep(Duration::from_secs(16)).await;

    assert!(!manager.is_cached(ADDRESS).await);
    assert_eq!(device.closes(), 1);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn dead_session_is_replaced_on_acquire() {
    let factory = Arc::new(MockTransportFactory::new());
    let device = factory.device(ADDRESS);
    let manager = manager(&factory, ConnectionManagerConfig::default());

    let session = manager.acquire(ADDRESS).await.unwrap();
    device.push_reply(MockReply::Disconnect);
    let request = frame::encode_read_request(1, 0, 1).unwrap();
    let err = session.request(&request, Duration::from_secs(1)).await.err();
    assert!(matches!(err, Some(GatewayError::Disconnected(_))));
    assert_eq!(session.state().await, SessionState::Disconnected);

    let fresh = manager.acquire(ADDRESS).await.unwrap();
    assert!(!fresh.same_session(&session));
    assert_eq!(device.opens(), 2);
    assert_eq!(fresh.state().await, SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn invalidate_closes_and_forgets_the_session() {
    let factory = Arc::new(MockTransportFactory::new());
    let device = factory.device(ADDRESS);
    let manager = manager(&factory, ConnectionManagerConfig::default());

    manager.acquire(ADDRESS).await.unwrap();
    manager.invalidate(ADDRESS).await;

    assert!(!manager.is_cached(ADDRESS).await);
    assert_eq!(device.closes(), 1);
    assert!(!device.is_connected());
}

#[tokio::test(start_paused = true)]
async fn failed_connect_is_not_cached() {
    let factory = Arc::new(MockTransportFactory::new());
    let device = factory.device(ADDRESS);
    device.fail_connect(Some(GatewayError::DeviceNotFound(ADDRESS.into())));
    let manager = manager(&factory, ConnectionManagerConfig::default());

    let err = manager.acquire(ADDRESS).await.err();
    assert_eq!(err, Some(GatewayError::DeviceNotFound(ADDRESS.into())));
    assert!(!manager.is_cached(ADDRESS).await);

    device.fail_connect(None);
    manager.acquire(ADDRESS).await.unwrap();
    assert_eq!(device.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_connect_times_out() {
    let factory = Arc::new(MockTransportFactory::new());
    factory.device(ADDRESS).set_connect_delay(Duration::from_secs(60));
    let config = ConnectionManagerConfig { connect_timeout: Duration::from_secs(5), ..Default::default() };
    let manager = manager(&factory, config);

    let err = manager.acquire(ADDRESS).await.err();
    assert_eq!(err, Some(GatewayError::ConnectTimeout(Duration::from_secs(5))));
}

#[tokio::test(start_paused = true)]
async fn full_slots_evict_least_recently_used_idle_session() {
    let factory = Arc::new(MockTransportFactory::new());
    let config = ConnectionManagerConfig { max_sessions: 2, ..Default::default() };
    let manager = manager(&factory, config);

    manager.acquire("A").await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    manager.acquire("B").await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    manager.acquire("C").await.unwrap();

    assert_eq!(manager.cached_sessions().await, 2);
    assert!(!manager.is_cached("A").await);
    assert_eq!(factory.device("A").closes(), 1);
    assert!(manager.is_cached("B").await);
    assert!(manager.is_cached("C").await);
}

#[tokio::test(start_paused = true)]
async fn busy_sessions_are_never_evicted() {
    let factory = Arc::new(MockTransportFactory::new());
    let config = ConnectionManagerConfig { max_sessions: 2, ..Default::default() };
    let manager = manager(&factory, config);

    let mut in_flight = Vec::new();
    for address in ["A", "B"] {
        factory.device(address).push_reply(MockReply::Silence);
        let session = manager.acquire(address).await.unwrap();
        in_flight.push(tokio::spawn(async move {
            let request = frame::encode_read_request(1, 0, 1).unwrap();
            session.request(&request, Duration::from_secs(30)).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(manager.acquire("C").await.err(), Some(GatewayError::NoConnectionSlot));
    assert_eq!(factory.device("A").closes(), 0);
    assert_eq!(factory.device("B").closes(), 0);

    for task in in_flight {
        assert_eq!(task.await.unwrap(), Err(GatewayError::ResponseTimeout(Duration::from_secs(30))));
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_everything_and_refuses_new_sessions() {
    let factory = Arc::new(MockTransportFactory::new());
    let manager = manager(&factory, ConnectionManagerConfig::default());
    manager.acquire("A").await.unwrap();
    manager.acquire("B").await.unwrap();

    manager.shutdown().await;

    assert_eq!(manager.cached_sessions().await, 0);
    assert_eq!(factory.device("A").closes(), 1);
    assert_eq!(factory.device("B").closes(), 1);
    assert_eq!(manager.acquire("A").await.err(), Some(GatewayError::ShuttingDown));
}

#[tokio::test(start_paused = true)]
async fn leased_sessions_are_not_evicted_for_other_devices() {
    let factory = Arc::new(MockTransportFactory::new());
    let config = ConnectionManagerConfig { max_sessions: 2, ..Default::default() };
    let manager = manager(&factory, config);

    // A is the oldest, but a poll still holds it between requests.
    let lease = manager.acquire("A").await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    manager.acquire("B").await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    manager.acquire("C").await.unwrap();

    assert_eq!(factory.device("A").closes(), 0);
    assert_eq!(factory.device("B").closes(), 1);
    assert!(manager.is_cached("A").await);

    let request = frame::encode_read_request(1, 0, 1).unwrap();
    lease.request(&request, Duration::from_secs(1)).await.unwrap();

    let _second = manager.acquire("C").await.unwrap();
    assert_eq!(manager.acquire("D").await.err(), Some(GatewayError::NoConnectionSlot));
}

#[tokio::test(start_paused = true)]
async fn leased_sessions_outlive_the_ttl() {
    let factory = Arc::new(MockTransportFactory::new());
    let device = factory.device(ADDRESS);
    let config = ConnectionManagerConfig { cache_ttl: Duration::from_secs(60), ..Default::default() };
    let manager = manager(&factory, config);

    let lease = manager.acquire(ADDRESS).await.unwrap();
    tokio::time::advance(Duration::from_secs(90)).await;
    assert_eq!(manager.sweep().await, 0);
    assert_eq!(device.closes(), 0);

    drop(lease);
    assert_eq!(manager.sweep().await, 1);
    assert_eq!(device.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn sweep_evicts_dead_sessions_before_their_ttl() {
    let factory = Arc::new(MockTransportFactory::new());
    let device = factory.device(ADDRESS);
    let manager = manager(&factory, ConnectionManagerConfig::default());

    let session = manager.acquire(ADDRESS).await.unwrap();
    device.push_reply(MockReply::Disconnect);
    let request = frame::encode_read_request(1, 0, 1).unwrap();
    assert!(session.request(&request, Duration::from_secs(1)).await.is_err());
    drop(session);

    assert_eq!(manager.sweep().await, 1);
    assert_eq!(device.closes(), 1);
    assert!(!manager.is_cached(ADDRESS).await);
}
