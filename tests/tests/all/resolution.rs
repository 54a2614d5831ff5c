use crate::fixtures::{channel, SCHEME};
use ginepro_balancer::balancer::PickInfo;
use ginepro_balancer::{CallOptions, ConnectivityState};
use tests::manual_resolver::ManualResolver;
use tests::test_balancers::FAILING;
use tests::test_connector::TestConnector;
use tests::{wait_for_state, TEST_TIMEOUT};
use tonic::Code;

#[tokio::test]
async fn bad_resolver_state_requests_re_resolution() {
    // Steps:
    //  1. The resolver reports no addresses, which the balancer rejects.
    //  2. The channel asks the resolver for new data after a backoff.
    //  3. Repeat once more.
    // What we want to test:
    //  Each rejected state leads to one delayed re-resolution.

    // Arrange
    let resolver = ManualResolver::new(SCHEME);
    let connector = TestConnector::default();
    let channel = channel(&resolver, &connector);

    // Act
    resolver.update_state(&[], None);
    tokio::time::timeout(TEST_TIMEOUT, resolver.resolve_now_requested())
        .await
        .expect("no re-resolution after a rejected state");
    resolver.update_state(&[], None);
    tokio::time::timeout(TEST_TIMEOUT, resolver.resolve_now_requested())
        .await
        .expect("no re-resolution after a second rejected state");

    // Assert
    assert_eq!(resolver.resolve_now_calls(), 2);
    wait_for_state(&channel, ConnectivityState::TransientFailure).await;
    let err = channel
        .pick(PickInfo::new("/echo.Echo/UnaryEcho"), CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert!(err.message().contains("zero addresses"));
}

#[tokio::test]
async fn accepted_state_does_not_request_re_resolution() {
    // Arrange
    let resolver = ManualResolver::new(SCHEME);
    let connector = TestConnector::reaching(["10.0.0.1:5000"]);
    let channel = channel(&resolver, &connector);

    // Act
    resolver.update_state(&["10.0.0.1:5000"], None);
    wait_for_state(&channel, ConnectivityState::Ready).await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // Assert
    assert_eq!(resolver.resolve_now_calls(), 0);
}

#[tokio::test]
async fn other_balancer_errors_do_not_request_re_resolution() {
    // Arrange
    let resolver = ManualResolver::new(SCHEME);
    let connector = TestConnector::reaching(["10.0.0.1:5000"]);
    let channel = channel(&resolver, &connector);

    // Act
    // The legacy field selects the policy without a config, which it refuses.
    resolver.update_state(&["10.0.0.1:5000"], Some(r#"{"loadBalancingPolicy": "test_failing"}"#));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // Assert
    assert_eq!(
        channel.service_config().lb_config.as_ref().map(|c| c.name.as_str()),
        Some(FAILING)
    );
    assert_eq!(resolver.resolve_now_calls(), 0);
}

#[tokio::test]
async fn resolver_errors_reach_the_balancer() {
    // Arrange
    let resolver = ManualResolver::new(SCHEME);
    let connector = TestConnector::default();
    let channel = channel(&resolver, &connector);

    // Act
    resolver.report_error("name server unreachable");

    // Assert
    wait_for_state(&channel, ConnectivityState::TransientFailure).await;
    let err = channel
        .pick(PickInfo::new("/echo.Echo/UnaryEcho"), CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert!(err.message().contains("name server unreachable"));

    tokio::time::timeout(TEST_TIMEOUT, resolver.resolve_now_requested())
        .await
        .expect("no re-resolution after a resolver error");
}
