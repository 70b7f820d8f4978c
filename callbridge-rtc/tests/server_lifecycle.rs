//! Server lifecycle integration tests

use callbridge_rtc::{Metrics, NullMetrics, Server, ServerConfig, SessionConfig, SessionId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn server_config(port: u16) -> ServerConfig {
    ServerConfig {
        ice_address_udp: "127.0.0.1".to_string(),
        ice_port_udp: port,
        ..Default::default()
    }
}

fn session_config(id: &str) -> SessionConfig {
    SessionConfig {
        group_id: "g1".into(),
        call_id: "c1".into(),
        user_id: format!("user-{id}").into(),
        session_id: id.into(),
    }
}

fn null_metrics() -> Arc<dyn Metrics> {
    Arc::new(NullMetrics)
}

#[tokio::test]
async fn test_start_add_close_stop() {
    let server = Server::new(server_config(37850), null_metrics()).unwrap();
    server.start().await.unwrap();

    let closed = Arc::new(AtomicBool::new(false));
    let closed_cb = Arc::clone(&closed);

    server
        .add_session(
            session_config("s1"),
            None,
            Some(Box::new(move || {
                closed_cb.store(true, Ordering::SeqCst);
                Ok(())
            })),
        )
        .await
        .unwrap();
    assert_eq!(server.session_count(), 1);

    server.close_session(&SessionId::from("s1")).await.unwrap();
    assert_eq!(server.session_count(), 0);
    assert!(closed.load(Ordering::SeqCst));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_session_rejected() {
    let server = Server::new(server_config(37851), null_metrics()).unwrap();
    server.start().await.unwrap();

    server
        .add_session(session_config("s1"), None, None)
        .await
        .unwrap();
    assert!(server
        .add_session(session_config("s1"), None, None)
        .await
        .is_err());

    server.close_session(&SessionId::from("s1")).await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_drains_active_sessions() {
    let server = Server::new(server_config(37852), null_metrics()).unwrap();
    server.start().await.unwrap();

    server
        .add_session(session_config("s1"), None, None)
        .await
        .unwrap();

    let stopper = Arc::clone(&server);
    let stop_handle = tokio::spawn(async move { stopper.stop().await });

    // Stop must still be pending while the session lives.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!stop_handle.is_finished());

    server.close_session(&SessionId::from("s1")).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), stop_handle)
        .await
        .expect("stop did not finish after drain")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_close_unknown_session() {
    let server = Server::new(server_config(37853), null_metrics()).unwrap();
    assert!(server.close_session(&SessionId::from("nope")).await.is_err());
}
