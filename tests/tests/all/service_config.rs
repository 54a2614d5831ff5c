use crate::fixtures::{builder, channel, registries, ROUND_ROBIN_CONFIG, SCHEME};
use ginepro_balancer::balancer::PickInfo;
use ginepro_balancer::{CallOptions, ConnectivityState};
use std::collections::HashSet;
use tests::manual_resolver::ManualResolver;
use tests::test_balancers::{PICK_FIRST, ROUND_ROBIN};
use tests::test_connector::TestConnector;
use tests::{eventually, wait_for_state, TEST_TIMEOUT};
use tonic::Code;

const A: &str = "10.0.0.1:5000";
const B: &str = "10.0.0.2:5000";

#[tokio::test]
async fn policy_change_replaces_the_balancer() {
    // Steps:
    //  1. Start without a service config, so pick_first connects to the first address.
    //  2. Push a service config selecting round robin.
    // What we want to test:
    //  The pick_first SubConn is drained and calls are spread over both addresses.

    // Arrange
    let resolver = ManualResolver::new(SCHEME).with_initial_state(&[A, B], None);
    let connector = TestConnector::reaching([A, B]);
    let channel = channel(&resolver, &connector);
    wait_for_state(&channel, ConnectivityState::Ready).await;
    assert!(connector.transports_to(B).is_empty());

    // Act
    resolver.update_state(&[A, B], Some(ROUND_ROBIN_CONFIG));

    // Assert
    eventually(|| connector.transports_to(A)[0].is_drained()).await;

    let spread = async {
        let mut seen = HashSet::new();
        while seen.len() < 2 {
            let call = channel
                .pick(PickInfo::new("/echo.Echo/UnaryEcho"), CallOptions::default())
                .await
                .unwrap();
            seen.insert(connector.address_of(call.transport()).unwrap());
        }
        seen
    };
    let seen = tokio::time::timeout(TEST_TIMEOUT, spread)
        .await
        .expect("calls never reached both addresses");
    assert!(seen.contains(A) && seen.contains(B));
    assert_eq!(
        channel.service_config().lb_config.as_ref().map(|c| c.name.as_str()),
        Some(ROUND_ROBIN)
    );
}

#[tokio::test]
async fn balancer_config_reaches_the_policy() {
    // Arrange
    let resolver = ManualResolver::new(SCHEME).with_initial_state(
        &[A],
        Some(r#"{"loadBalancingConfig": [{"unknown_policy": {}}, {"test_failing": {"code": 7, "message": "denied"}}]}"#),
    );
    let connector = TestConnector::reaching([A]);
    let channel = channel(&resolver, &connector);

    // Act
    let err = tokio::time::timeout(
        TEST_TIMEOUT,
        channel.pick(PickInfo::new("/echo.Echo/UnaryEcho"), CallOptions::default()),
    )
    .await
    .unwrap()
    .unwrap_err();

    // Assert
    assert_eq!(err.code(), Code::PermissionDenied);
    assert_eq!(err.message(), "denied");
}

#[tokio::test]
async fn invalid_service_config_keeps_the_previous_one() {
    // Arrange
    let resolver = ManualResolver::new(SCHEME).with_initial_state(&[A], Some(ROUND_ROBIN_CONFIG));
    let connector = TestConnector::reaching([A]);
    let channel = channel(&resolver, &connector);
    wait_for_state(&channel, ConnectivityState::Ready).await;

    // Act
    resolver.update_state(&[A], Some(r#"{"loadBalancingConfig": [{"no_such_policy": {}}]}"#));
    resolver.update_state(&[A], Some("{not json"));

    // Assert
    let config = channel.service_config();
    assert_eq!(config.raw(), ROUND_ROBIN_CONFIG);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!connector.transports_to(A)[0].is_drained());
    assert_eq!(channel.state(), ConnectivityState::Ready);
}

#[tokio::test]
async fn default_service_config_applies_until_the_resolver_provides_one() {
    // Arrange
    let resolver = ManualResolver::new(SCHEME).with_initial_state(&[A, B], None);
    let connector = TestConnector::reaching([A, B]);

    // Act
    let channel = builder(registries(&resolver), &connector)
        .default_service_config(ROUND_ROBIN_CONFIG)
        .build()
        .unwrap();

    // Assert
    eventually(|| !connector.transports_to(A).is_empty() && !connector.transports_to(B).is_empty()).await;
    assert_eq!(
        channel.service_config().lb_config.as_ref().map(|c| c.name.as_str()),
        Some(ROUND_ROBIN)
    );

    resolver.update_state(&[A, B], Some(r#"{"loadBalancingPolicy": "pick_first"}"#));
    assert_eq!(
        channel.service_config().lb_config.as_ref().map(|c| c.name.as_str()),
        Some(PICK_FIRST)
    );
}

#[tokio::test]
async fn disabled_service_config_ignores_the_resolver() {
    // Arrange
    let resolver = ManualResolver::new(SCHEME).with_initial_state(
        &[A],
        Some(r#"{"loadBalancingConfig": [{"test_failing": {"code": 7}}]}"#),
    );
    let connector = TestConnector::reaching([A]);

    // Act
    let channel = builder(registries(&resolver), &connector)
        .disable_service_config()
        .build()
        .unwrap();

    // Assert
    let call = tokio::time::timeout(
        TEST_TIMEOUT,
        channel.pick(PickInfo::new("/echo.Echo/UnaryEcho"), CallOptions::default()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(connector.address_of(call.transport()).as_deref(), Some(A));
}

#[tokio::test]
async fn method_config_applies_to_picks() {
    // Arrange
    let resolver = ManualResolver::new(SCHEME).with_initial_state(
        &[A],
        Some(
            r#"{"methodConfig": [{
                "name": [{"service": "echo.Echo"}],
                "waitForReady": true,
                "timeout": "0.1s"
            }]}"#,
        ),
    );
    let connector = TestConnector::default();
    let channel = channel(&resolver, &connector);
    wait_for_state(&channel, ConnectivityState::TransientFailure).await;

    // Act
    let configured = channel
        .pick(PickInfo::new("/echo.Echo/UnaryEcho"), CallOptions::default())
        .await
        .unwrap_err();
    let overridden = channel
        .pick(
            PickInfo::new("/echo.Echo/UnaryEcho"),
            CallOptions::default().wait_for_ready(false),
        )
        .await
        .unwrap_err();

    // Assert
    assert_eq!(configured.code(), Code::DeadlineExceeded);
    assert_eq!(overridden.code(), Code::Unavailable);
}
