//! Cooldown fast-path: once a venue is cooling down, REST calls fail
//! locally without touching the network.

use crossarb::infrastructure::venue::{cooldown_minutes, NoopSigner, RestClient};
use crossarb::{VenueError, VenueId};
use std::sync::Arc;
use std::time::Instant;

fn client() -> RestClient {
    // The host is unroutable on purpose: any request that escapes the
    // cooldown gate would surface as a transport error instead.
    RestClient::new(
        VenueId::Binance,
        "https://127.0.0.1:1",
        Arc::new(NoopSigner),
        None,
    )
}

#[tokio::test]
async fn requests_fail_fast_during_cooldown() {
    let rest = client();
    rest.start_cooldown(30);

    let started = Instant::now();
    let result = rest.get_json("/api/v3/depth", &[], false).await;
    let elapsed = started.elapsed();

    match result {
        Err(VenueError::Cooldown {
            venue,
            remaining_secs,
        }) => {
            assert_eq!(venue, VenueId::Binance);
            assert!(remaining_secs > 0);
        }
        other => panic!("expected cooldown error, got {other:?}"),
    }
    // Fast path: no connect attempt, so this returns immediately.
    assert!(elapsed.as_millis() < 100);
}

#[tokio::test]
async fn post_and_delete_share_the_gate() {
    let rest = client();
    rest.start_cooldown(1);

    assert!(matches!(
        rest.post_form("/order", &[], true).await,
        Err(VenueError::Cooldown { .. })
    ));
    assert!(matches!(
        rest.delete_json("/order", &[], true).await,
        Err(VenueError::Cooldown { .. })
    ));
}

#[test]
fn rate_limit_statuses_map_to_the_documented_windows() {
    assert_eq!(cooldown_minutes(429, r#"{"retryAfter": 120}"#), 2);
    assert_eq!(cooldown_minutes(418, ""), 120);
    assert_eq!(cooldown_minutes(403, ""), 60);
}
