use crate::fixtures::{builder, channel, registries, SCHEME};
use ginepro_balancer::balancer::{DoneInfo, PickInfo};
use ginepro_balancer::{CallOptions, Channel, ChannelError, ConnectivityState, Registries};
use std::sync::Arc;
use std::time::Duration;
use tests::manual_resolver::ManualResolver;
use tests::test_balancers::PickFirstBuilder;
use tests::test_connector::TestConnector;
use tests::{assert_pending, eventually, wait_for_state, TEST_TIMEOUT};
use tonic::Code;

const BACKEND: &str = "10.0.0.1:5000";

#[tokio::test]
async fn pick_waits_for_a_ready_sub_conn() {
    // Arrange
    let resolver = ManualResolver::new(SCHEME);
    let connector = TestConnector::reaching([BACKEND]);
    let channel = channel(&resolver, &connector);

    let pick = tokio::spawn({
        let channel = channel.clone();
        async move {
            channel
                .pick(PickInfo::new("/echo.Echo/UnaryEcho"), CallOptions::default())
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pick.is_finished());

    // Act
    resolver.update_state(&[BACKEND], None);

    // Assert
    let call = tokio::time::timeout(TEST_TIMEOUT, pick)
        .await
        .expect("pick never completed")
        .unwrap()
        .expect("pick failed");
    assert_eq!(connector.address_of(call.transport()).as_deref(), Some(BACKEND));
    assert_eq!(channel.state(), ConnectivityState::Ready);
}

#[tokio::test]
async fn passthrough_targets_dial_the_endpoint() {
    // Arrange
    let mut registries = Registries::with_defaults();
    registries.balancers_mut().register(PickFirstBuilder::default());
    let connector = TestConnector::reaching(["10.0.0.7:443"]);

    // Act
    let channel = Channel::builder("10.0.0.7:443")
        .registries(registries)
        .connector(Arc::new(connector.clone()))
        .build()
        .unwrap();
    let call = tokio::time::timeout(
        TEST_TIMEOUT,
        channel.pick(PickInfo::new("/echo.Echo/UnaryEcho"), CallOptions::default()),
    )
    .await
    .unwrap()
    .unwrap();

    // Assert
    assert_eq!(channel.target().scheme, "passthrough");
    assert_eq!(connector.address_of(call.transport()).as_deref(), Some("10.0.0.7:443"));
}

#[tokio::test]
async fn connection_errors_fail_fast_unless_waiting_for_ready() {
    // Arrange
    let resolver = ManualResolver::new(SCHEME).with_initial_state(&[BACKEND], None);
    let connector = TestConnector::default();
    let channel = channel(&resolver, &connector);
    wait_for_state(&channel, ConnectivityState::TransientFailure).await;

    // Act
    let fail_fast = channel
        .pick(PickInfo::new("/echo.Echo/UnaryEcho"), CallOptions::default())
        .await
        .unwrap_err();
    let bounded = channel
        .pick(
            PickInfo::new("/echo.Echo/UnaryEcho"),
            CallOptions::default()
                .wait_for_ready(true)
                .timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

    // Assert
    assert_eq!(fail_fast.code(), Code::Unavailable);
    assert!(fail_fast.message().contains("connection refused"));
    assert_eq!(bounded.code(), Code::DeadlineExceeded);
    assert_pending(
        channel.pick(
            PickInfo::new("/echo.Echo/UnaryEcho"),
            CallOptions::default().wait_for_ready(true),
        ),
        Duration::from_millis(100),
    )
    .await;

    let waiting = tokio::spawn({
        let channel = channel.clone();
        async move {
            channel
                .pick(
                    PickInfo::new("/echo.Echo/UnaryEcho"),
                    CallOptions::default().wait_for_ready(true),
                )
                .await
        }
    });
    connector.set_reachable(BACKEND, true);
    let call = tokio::time::timeout(TEST_TIMEOUT, waiting)
        .await
        .expect("wait-for-ready pick never completed")
        .unwrap()
        .expect("pick failed");
    assert_eq!(connector.address_of(call.transport()).as_deref(), Some(BACKEND));
}

#[tokio::test]
async fn sub_conn_retries_the_whole_address_list() {
    // Arrange
    let resolver = ManualResolver::new(SCHEME).with_initial_state(&["a:1", "b:1", "c:1"], None);
    let connector = TestConnector::default();
    let _channel = channel(&resolver, &connector);

    // Act
    eventually(|| connector.attempts().len() >= 6).await;

    // Assert
    assert_eq!(
        connector.attempts()[..6],
        ["a:1", "b:1", "c:1", "a:1", "b:1", "c:1"]
    );
}

#[tokio::test]
async fn done_is_reported_exactly_once() {
    // Arrange
    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
    let resolver = ManualResolver::new(SCHEME).with_initial_state(&[BACKEND], None);
    let connector = TestConnector::reaching([BACKEND]);
    let mut registries = registries(&resolver);
    registries
        .balancers_mut()
        .register(PickFirstBuilder::report_done_to(done_tx));
    let channel = builder(registries, &connector).build().unwrap();

    // Act
    let finished = channel
        .pick(PickInfo::new("/echo.Echo/UnaryEcho"), CallOptions::default())
        .await
        .unwrap();
    finished.finish(DoneInfo {
        bytes_sent: true,
        bytes_received: true,
        ..Default::default()
    });
    let abandoned = channel
        .pick(PickInfo::new("/echo.Echo/UnaryEcho"), CallOptions::default())
        .await
        .unwrap();
    drop(abandoned);

    // Assert
    let first = done_rx.recv().await.unwrap();
    assert!(first.err.is_none());
    assert!(first.bytes_sent && first.bytes_received);

    let second = done_rx.recv().await.unwrap();
    assert_eq!(second.err.map(|status| status.code()), Some(Code::Cancelled));

    assert!(done_rx.try_recv().is_err());
}

#[tokio::test]
async fn lost_connection_is_re_established() {
    // Arrange
    let resolver = ManualResolver::new(SCHEME).with_initial_state(&[BACKEND], None);
    let connector = TestConnector::reaching([BACKEND]);
    let channel = channel(&resolver, &connector);
    wait_for_state(&channel, ConnectivityState::Ready).await;

    // Act
    connector.transports_to(BACKEND)[0].kill();

    // Assert
    eventually(|| connector.transports_to(BACKEND).len() == 2).await;
    let call = channel
        .pick(PickInfo::new("/echo.Echo/UnaryEcho"), CallOptions::default())
        .await
        .unwrap();
    let new_transport = connector.transports_to(BACKEND)[1].clone();
    assert_eq!(
        Arc::as_ptr(call.transport()) as *const (),
        Arc::as_ptr(&new_transport) as *const ()
    );
}

#[tokio::test]
async fn close_shuts_everything_down() {
    // Arrange
    let resolver = ManualResolver::new(SCHEME).with_initial_state(&[BACKEND], None);
    let connector = TestConnector::reaching([BACKEND]);
    let channel = channel(&resolver, &connector);
    wait_for_state(&channel, ConnectivityState::Ready).await;

    // Act
    channel.close();

    // Assert
    wait_for_state(&channel, ConnectivityState::Shutdown).await;
    eventually(|| resolver.is_closed()).await;
    eventually(|| connector.transports_to(BACKEND)[0].is_drained()).await;

    let err = channel
        .pick(PickInfo::new("/echo.Echo/UnaryEcho"), CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);
}

#[tokio::test]
async fn close_releases_pending_picks() {
    // Arrange
    let resolver = ManualResolver::new(SCHEME);
    let connector = TestConnector::default();
    let channel = channel(&resolver, &connector);
    let pick = tokio::spawn({
        let channel = channel.clone();
        async move {
            channel
                .pick(
                    PickInfo::new("/echo.Echo/UnaryEcho"),
                    CallOptions::default().wait_for_ready(true),
                )
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!pick.is_finished());

    // Act
    channel.close();

    // Assert
    let err = tokio::time::timeout(TEST_TIMEOUT, pick)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);
}

#[tokio::test]
async fn build_fails_without_a_connector() {
    let resolver = ManualResolver::new(SCHEME);

    let err = Channel::builder("test:///backend")
        .registries(registries(&resolver))
        .build()
        .unwrap_err();

    assert!(matches!(err, ChannelError::MissingConnector));
}

#[tokio::test]
async fn build_fails_when_the_default_policy_is_unknown() {
    let resolver = ManualResolver::new(SCHEME);

    let err = builder(registries(&resolver), &TestConnector::default())
        .default_balancer("no_such_policy")
        .build()
        .unwrap_err();

    assert!(matches!(err, ChannelError::UnknownBalancer(name) if name == "no_such_policy"));
}

#[tokio::test]
async fn build_fails_when_the_default_scheme_is_unknown() {
    let resolver = ManualResolver::new(SCHEME);
    let mut registries = registries(&resolver);
    registries.resolvers_mut().set_default_scheme("dns");

    let err = Channel::builder("my.service:5000")
        .registries(registries)
        .connector(Arc::new(TestConnector::default()))
        .build()
        .unwrap_err();

    assert!(matches!(err, ChannelError::UnknownScheme(scheme) if scheme == "dns"));
}
