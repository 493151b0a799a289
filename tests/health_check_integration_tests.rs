//! Health supervisor integration: live probes against scratch backends and
//! the hysteresis state machine end to end.

use gatehouse::balancer::TargetRuntime;
use gatehouse::config::{HealthCheckConfig, HealthConfig};
use gatehouse::health::{checker, HealthChecker, HealthState, ProbeOutcome};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn spec(failure_threshold: u32, success_threshold: u32) -> HealthCheckConfig {
    HealthCheckConfig {
        enabled: true,
        path: "/health".to_string(),
        interval: Duration::from_millis(50),
        timeout: Duration::from_millis(500),
        failure_threshold,
        success_threshold,
    }
}

/// Backend whose health endpoint flips between 200 and 500 via a switch.
async fn spawn_health_backend(healthy: Arc<AtomicBool>) -> SocketAddr {
    let make_svc = make_service_fn(move |_| {
        let healthy = Arc::clone(&healthy);
        async move {
            Ok::<_, Infallible>(service_fn(move |_req| {
                let healthy = Arc::clone(&healthy);
                async move {
                    let status = if healthy.load(Ordering::SeqCst) {
                        StatusCode::OK
                    } else {
                        StatusCode::INTERNAL_SERVER_ERROR
                    };
                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(status)
                            .body(Body::from("probe"))
                            .unwrap(),
                    )
                }
            }))
        }
    });

    let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(async move {
        let _ = server.await;
    });
    addr
}

async fn wait_for_state(
    target: &TargetRuntime,
    wanted: HealthState,
    deadline: Duration,
) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if target.health_state() == wanted {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn supervisor_marks_live_backend_healthy() {
    let healthy = Arc::new(AtomicBool::new(true));
    let addr = spawn_health_backend(Arc::clone(&healthy)).await;

    let checker = Arc::new(HealthChecker::new(HealthConfig {
        enabled: true,
        interval: Duration::from_millis(50),
        timeout: Duration::from_millis(500),
        port: 0,
    }));
    let target = Arc::new(TargetRuntime::new(&format!("http://{}", addr), 1).unwrap());
    checker.register_targets(vec![("api".to_string(), spec(2, 2), Arc::clone(&target))]);

    let handle = Arc::clone(&checker).start();
    assert!(
        wait_for_state(&target, HealthState::Healthy, Duration::from_secs(5)).await,
        "target never became healthy"
    );
    handle.stop().await;
}

#[tokio::test]
async fn supervisor_flips_backend_down_and_back_up() {
    let healthy = Arc::new(AtomicBool::new(true));
    let addr = spawn_health_backend(Arc::clone(&healthy)).await;

    let checker = Arc::new(HealthChecker::new(HealthConfig {
        enabled: true,
        interval: Duration::from_millis(50),
        timeout: Duration::from_millis(500),
        port: 0,
    }));
    let target = Arc::new(TargetRuntime::new(&format!("http://{}", addr), 1).unwrap());
    checker.register_targets(vec![("api".to_string(), spec(2, 2), Arc::clone(&target))]);

    let handle = Arc::clone(&checker).start();
    assert!(wait_for_state(&target, HealthState::Healthy, Duration::from_secs(5)).await);

    healthy.store(false, Ordering::SeqCst);
    assert!(
        wait_for_state(&target, HealthState::Unhealthy, Duration::from_secs(5)).await,
        "target never became unhealthy"
    );

    healthy.store(true, Ordering::SeqCst);
    assert!(
        wait_for_state(&target, HealthState::Healthy, Duration::from_secs(5)).await,
        "target never recovered"
    );
    handle.stop().await;
}

#[tokio::test]
async fn unreachable_backend_goes_unhealthy_with_recorded_error() {
    let checker = Arc::new(HealthChecker::new(HealthConfig {
        enabled: true,
        interval: Duration::from_millis(50),
        timeout: Duration::from_millis(200),
        port: 0,
    }));
    // Nothing listens here
    let target = Arc::new(TargetRuntime::new("http://127.0.0.1:1", 1).unwrap());
    checker.register_targets(vec![("api".to_string(), spec(1, 1), Arc::clone(&target))]);

    let handle = Arc::clone(&checker).start();
    assert!(wait_for_state(&target, HealthState::Unhealthy, Duration::from_secs(5)).await);

    let report = &checker.reports()[0];
    assert!(report.last_error.is_some());
    handle.stop().await;
}

#[test]
fn hysteresis_exact_sequence() {
    // failure_threshold=3, success_threshold=2 walk-through
    let target = TargetRuntime::new("http://127.0.0.1:9001", 1).unwrap();
    let spec = spec(3, 2);
    target.set_health_state(HealthState::Healthy);

    let ok = || ProbeOutcome::Ok {
        rtt: Duration::from_millis(1),
    };
    let fail = || ProbeOutcome::Fail {
        reason: "503".to_string(),
    };

    checker::apply_outcome(&target, &spec, "api", fail());
    checker::apply_outcome(&target, &spec, "api", fail());
    checker::apply_outcome(&target, &spec, "api", ok());
    assert_eq!(target.health_state(), HealthState::Healthy);

    checker::apply_outcome(&target, &spec, "api", fail());
    checker::apply_outcome(&target, &spec, "api", fail());
    checker::apply_outcome(&target, &spec, "api", fail());
    assert_eq!(target.health_state(), HealthState::Unhealthy);

    checker::apply_outcome(&target, &spec, "api", ok());
    assert_eq!(target.health_state(), HealthState::Unhealthy);

    checker::apply_outcome(&target, &spec, "api", ok());
    assert_eq!(target.health_state(), HealthState::Healthy);
}

#[test]
fn probing_disabled_targets_stay_eligible() {
    // Fail-open: a target that is never probed keeps serving
    let target = TargetRuntime::new("http://127.0.0.1:9001", 1).unwrap();
    assert_eq!(target.health_state(), HealthState::Unknown);
    assert!(target.is_eligible());
}
