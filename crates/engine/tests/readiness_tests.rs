//! Integration tests for readiness polling against real probes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use provision_engine::{http_ready, txt_record_resolves, Poller, TxtResolver};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Resolver that answers on a given attempt and errors before it.
struct EventuallyResolves {
    ready_on: u32,
    calls: AtomicU32,
}

#[async_trait]
impl TxtResolver for EventuallyResolves {
    async fn lookup_txt(&self, _name: &str) -> anyhow::Result<Vec<String>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n < self.ready_on {
            anyhow::bail!("no records found");
        }
        Ok(vec!["domain record propagated".into()])
    }
}

#[tokio::test(start_paused = true)]
async fn test_dns_probe_ready_on_third_attempt() {
    let resolver = Arc::new(EventuallyResolves {
        ready_on: 3,
        calls: AtomicU32::new(0),
    });
    let poller = Poller::dns();
    let start = tokio::time::Instant::now();

    let probe_resolver = Arc::clone(&resolver);
    let ready = poller
        .is_ready("kubefirst-liveness.example.com", move || {
            let resolver = Arc::clone(&probe_resolver);
            async move { txt_record_resolves(resolver.as_ref(), "kubefirst-liveness.example.com").await }
        })
        .await;

    assert!(ready);
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 3);
    assert_eq!(start.elapsed(), poller.interval() * 2);
}

#[tokio::test]
async fn test_http_probe_ready_after_five_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(5)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .with_priority(2)
        .mount(&server)
        .await;

    let grace = Duration::from_millis(200);
    let poller = Poller::new(Duration::from_millis(10), 200).with_grace(grace);
    let client = reqwest::Client::new();
    let url = format!("{}/", server.uri());

    let start = Instant::now();
    let ready = poller
        .is_ready(&url, || http_ready(&client, &url))
        .await;

    assert!(ready);
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 6);
    // Five interval sleeps plus the grace sleep after the first 200.
    assert!(start.elapsed() >= grace + Duration::from_millis(50));
}

#[tokio::test]
async fn test_http_probe_exhaustion_reports_target() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let poller = Poller::new(Duration::from_millis(5), 4);
    let client = reqwest::Client::new();
    let url = format!("{}/", server.uri());

    let err = poller
        .poll(&url, || http_ready(&client, &url))
        .await
        .unwrap_err();

    assert_eq!(server.received_requests().await.unwrap().len(), 4);
    assert!(err.to_string().contains(&url));
    assert!(err.to_string().contains("4 attempts"));
}
