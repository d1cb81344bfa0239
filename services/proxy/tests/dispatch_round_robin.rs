mod harness;

use std::time::Duration;

use harness::{app, free_port, orchestrator, read_reply, wait_bound, MockDispatch, TcpBackend};
use skp_proxy::RoutingTable;
use tokio::net::TcpStream;
use tokio::time::timeout;

#[tokio::test]
async fn connections_alternate_and_extra_port_goes_to_kernel() {
    let first = TcpBackend::tagged("backend-1").await.unwrap();
    let second = TcpBackend::tagged("backend-2").await.unwrap();
    let dispatch = MockDispatch::new();
    let mut orchestrator = orchestrator(Some(&dispatch));

    let primary = free_port().await;
    let extra = free_port().await;
    orchestrator
        .start(RoutingTable::from_apps([app(
            "web",
            vec![primary, extra],
            vec![first.target(), second.target()],
        )]))
        .await;

    let bound = wait_bound(&orchestrator, "web").await;
    assert_eq!(bound.local_addr.port(), primary);

    assert_eq!(read_reply(bound.local_addr).await.unwrap(), b"backend-1");
    assert_eq!(read_reply(bound.local_addr).await.unwrap(), b"backend-2");
    assert_eq!(read_reply(bound.local_addr).await.unwrap(), b"backend-1");

    // Only the first port is listened on.
    let extra_addr = format!("127.0.0.1:{extra}");
    let dial = timeout(Duration::from_millis(500), TcpStream::connect(&extra_addr)).await;
    assert!(!matches!(dial, Ok(Ok(_))), "extra port must not be listened on");

    assert!(
        harness::eventually(|| dispatch.pins().len() == 4).await,
        "pins: {:?}",
        dispatch.pins()
    );
    assert_eq!(dispatch.loader.ports(), vec![extra]);
    assert!(dispatch.loader.socket_set());

    orchestrator.stop_all().await;
    assert!(dispatch.pins().is_empty(), "pins left: {:?}", dispatch.pins());
    assert!(orchestrator.running_apps().is_empty());
}

#[tokio::test]
async fn cancellation_unpins_every_app() {
    let backend = TcpBackend::echo().await.unwrap();
    let dispatch = MockDispatch::new();
    let mut orchestrator = orchestrator(Some(&dispatch));

    let (web, web_extra, api) = (free_port().await, free_port().await, free_port().await);
    orchestrator
        .start(RoutingTable::from_apps([
            app("web", vec![web, web_extra], vec![backend.target()]),
            app("api", vec![api], vec![backend.target()]),
        ]))
        .await;

    wait_bound(&orchestrator, "web").await;
    wait_bound(&orchestrator, "api").await;
    assert!(harness::eventually(|| dispatch.pins().len() == 8).await);
    assert_eq!(orchestrator.running_apps(), vec!["api", "web"]);

    orchestrator.stop_all().await;
    assert!(dispatch.pins().is_empty(), "pins left: {:?}", dispatch.pins());
}

#[tokio::test]
async fn dispatch_failure_does_not_stop_forwarding() {
    let backend = TcpBackend::tagged("ok").await.unwrap();
    let dispatch = MockDispatch::new();
    let mut orchestrator = orchestrator(Some(&dispatch));

    // "web" passes; a name that cannot be a pin suffix fails dispatch setup.
    let (good, bad) = (free_port().await, free_port().await);
    orchestrator
        .start(RoutingTable::from_apps([
            app("web", vec![good], vec![backend.target()]),
            app("bad/name", vec![bad], vec![backend.target()]),
        ]))
        .await;

    let good_bound = wait_bound(&orchestrator, "web").await;
    let bad_bound = wait_bound(&orchestrator, "bad/name").await;

    assert_eq!(read_reply(good_bound.local_addr).await.unwrap(), b"ok");
    assert_eq!(read_reply(bad_bound.local_addr).await.unwrap(), b"ok");
    assert!(harness::eventually(|| dispatch.pins().len() == 4).await);
    assert!(dispatch.pins().iter().all(|p| p.ends_with("-web")));

    orchestrator.stop_all().await;
    assert!(dispatch.pins().is_empty());
}
