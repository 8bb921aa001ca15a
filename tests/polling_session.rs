//! Long-poll session scenarios against a mock HTTP server.
//!
//! The listener endpoint is matched on the digest the client sends, so each
//! round of the poll loop hits a distinct expectation and the sequencing is
//! deterministic.

use std::time::Duration;

use httptest::{cycle, matchers::*, responders::status_code, Expectation, Server};
use tokio::sync::mpsc;

use remote_config_client::{
    callback, md5_hex, ClientOptions, ConfigDescriptor, ConfigIdentity, ConfigurationClient,
    ServerAddressPool,
};

const CONFIG_PATH: &str = "/v1/cs/configs";
const LISTENER_PATH: &str = "/v1/cs/configs/listener";

fn options() -> ClientOptions {
    ClientOptions {
        long_poll_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

fn descriptor() -> ConfigDescriptor {
    ConfigDescriptor::new(ConfigIdentity::with_group("ns", "grp", "app").unwrap())
}

/// The listener form field the client sends when its local digest is `hash`.
fn listening_field(hash: &str) -> String {
    format!("app\u{2}grp\u{2}{hash}\u{2}ns\u{1}")
}

/// The listener response body reporting the entry as changed.
fn changed_body() -> String {
    "app\u{2}grp\u{2}ns\u{1}".to_string()
}

fn client_for(server: &Server) -> ConfigurationClient {
    let pool = ServerAddressPool::fixed(vec![server.url_str("").parse().unwrap()]).unwrap();
    ConfigurationClient::polling(options(), pool).unwrap()
}

#[tokio::test]
async fn first_sync_is_suppressed_and_real_change_notifies_once() {
    let server = Server::run();

    // round 1: the entry was never synced (empty digest); the server reports
    // it as changed right away
    server.expect(
        Expectation::matching(all_of![
            request::method_path("POST", LISTENER_PATH),
            request::body(url_decoded(contains((
                "Listening-Configs",
                listening_field("")
            )))),
        ])
        .times(1)
        .respond_with(status_code(200).body(changed_body())),
    );
    // round 2: primed with v1; a real change lands
    server.expect(
        Expectation::matching(all_of![
            request::method_path("POST", LISTENER_PATH),
            request::body(url_decoded(contains((
                "Listening-Configs",
                listening_field(&md5_hex("v1"))
            )))),
        ])
        .times(1)
        .respond_with(status_code(200).body(changed_body())),
    );
    // round 3+: synced at v2, nothing new
    server.expect(
        Expectation::matching(all_of![
            request::method_path("POST", LISTENER_PATH),
            request::body(url_decoded(contains((
                "Listening-Configs",
                listening_field(&md5_hex("v2"))
            )))),
        ])
        .times(0..)
        .respond_with(status_code(200).body("")),
    );
    // the two re-fetches triggered by the two reported changes
    server.expect(
        Expectation::matching(request::method_path("GET", CONFIG_PATH))
            .times(2)
            .respond_with(cycle![
                status_code(200).body("v1"),
                status_code(200).body("v2"),
            ]),
    );

    let client = client_for(&server);
    client.init().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let subscription = client
        .subscribe(
            &descriptor(),
            callback(move |changed| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(changed.content().unwrap_or_default().to_string());
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    // the v1 priming round must be silent; the first notification carries v2
    let first = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no change notification arrived")
        .unwrap();
    assert_eq!(first, "v2");

    // no further notifications while the server stays quiet
    let extra = tokio::time::timeout(Duration::from_millis(1500), rx.recv()).await;
    assert!(extra.is_err(), "unexpected extra notification: {extra:?}");

    subscription.unsubscribe().await;
    client.shutdown();
}

#[tokio::test]
async fn already_synced_subscription_notifies_on_first_change() {
    let server = Server::run();

    server.expect(
        Expectation::matching(all_of![
            request::method_path("POST", LISTENER_PATH),
            request::body(url_decoded(contains((
                "Listening-Configs",
                listening_field(&md5_hex("v1"))
            )))),
        ])
        .times(1)
        .respond_with(status_code(200).body(changed_body())),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method_path("POST", LISTENER_PATH),
            request::body(url_decoded(contains((
                "Listening-Configs",
                listening_field(&md5_hex("v2"))
            )))),
        ])
        .times(0..)
        .respond_with(status_code(200).body("")),
    );
    server.expect(
        Expectation::matching(request::method_path("GET", CONFIG_PATH))
            .times(1)
            .respond_with(status_code(200).body("v2")),
    );

    let client = client_for(&server);
    client.init().await.unwrap();

    // the subscription starts from a synced v1 snapshot, so the very first
    // reported change is a real one and must notify
    let seeded = descriptor().with_content("v1", md5_hex("v1"));
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let subscription = client
        .subscribe(
            &seeded,
            callback(move |changed| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(changed.content().unwrap_or_default().to_string());
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no change notification arrived")
        .unwrap();
    assert_eq!(first, "v2");

    subscription.unsubscribe().await;
    client.shutdown();
}
