//! Liveness probing against real local listeners.

mod common;

use std::time::Duration;

use tandem::{HealthChecker, Strategy, spawn_health_checker};
use tokio::net::TcpListener;

use common::*;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[tokio::test]
async fn reachable_backend_is_marked_alive() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let pool = pool_of(Strategy::RoundRobin, &[&addr.to_string()]);
    pool.all()[0].set_alive(false);

    let checker = HealthChecker::new(vec![pool.clone()], PROBE_TIMEOUT);
    assert!(checker.check_backend(&pool.all()[0]).await);
    assert!(pool.all()[0].is_alive());
}

#[tokio::test]
async fn unreachable_backend_is_marked_dead() {
    init_tracing();
    let addr = closed_addr().await;
    let pool = pool_of(Strategy::LeastConnections, &[&addr.to_string()]);

    let checker = HealthChecker::new(vec![pool.clone()], PROBE_TIMEOUT);
    assert!(!checker.check_backend(&pool.all()[0]).await);
    assert!(!pool.all()[0].is_alive());
}

#[tokio::test]
async fn sweep_covers_every_pool() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let up = listener.local_addr().unwrap().to_string();
    let down = closed_addr().await.to_string();

    let rr = pool_of(Strategy::RoundRobin, &[&up, &down]);
    let lc = pool_of(Strategy::LeastConnections, &[&down, &up]);
    rr.all()[0].set_alive(false);
    lc.all()[1].set_alive(false);

    HealthChecker::new(vec![rr.clone(), lc.clone()], PROBE_TIMEOUT)
        .check_all()
        .await;

    assert!(rr.all()[0].is_alive());
    assert!(!rr.all()[1].is_alive());
    assert!(!lc.all()[0].is_alive());
    assert!(lc.all()[1].is_alive());
}

#[tokio::test]
async fn background_checker_revives_backend() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let pool = pool_of(Strategy::RoundRobin, &[&addr.to_string()]);
    pool.all()[0].set_alive(false);

    let handle = spawn_health_checker(
        HealthChecker::new(vec![pool.clone()], PROBE_TIMEOUT),
        Duration::from_millis(50),
    );

    let revived = tokio::time::timeout(Duration::from_secs(2), async {
        while !pool.all()[0].is_alive() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    handle.abort();

    assert!(revived.is_ok(), "backend was never marked alive");
}

#[tokio::test]
async fn first_sweep_waits_one_interval() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let pool = pool_of(Strategy::RoundRobin, &[&addr.to_string()]);
    pool.all()[0].set_alive(false);

    let handle = spawn_health_checker(
        HealthChecker::new(vec![pool.clone()], PROBE_TIMEOUT),
        Duration::from_secs(60),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.abort();

    assert!(!pool.all()[0].is_alive());
}

#[tokio::test]
async fn same_backend_follows_listener_up_down_up() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let pool = pool_of(Strategy::RoundRobin, &[&addr.to_string()]);
    let backend = &pool.all()[0];
    let checker = HealthChecker::new(vec![pool.clone()], PROBE_TIMEOUT);

    assert!(checker.check_backend(backend).await);
    assert!(backend.is_alive());

    drop(listener);
    assert!(!checker.check_backend(backend).await);
    assert!(!backend.is_alive());

    let _listener = TcpListener::bind(addr).await.unwrap();
    assert!(checker.check_backend(backend).await);
    assert!(backend.is_alive());
}
