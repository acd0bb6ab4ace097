use proxy_feed::{Aggregator, Config, HarvestError, Protocol, ProtocolHint, Source};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn source(url: String, protocol: ProtocolHint) -> Source {
    Source {
        url,
        source_type: Some("txt".into()),
        protocol,
        enabled: true,
    }
}

fn config(sources: Vec<Source>) -> Config {
    Config {
        interval_seconds: 60,
        sources,
        user_agent: String::new(),
    }
}

#[tokio::test]
async fn fetches_and_dedups_across_sources() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200).set_body_string("1.1.1.1:80\n2.2.2.2:8080"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b"))
        .respond_with(ResponseTemplate::new(200).set_body_string("2.2.2.2:8080\n3.3.3.3:3128"))
        .mount(&server)
        .await;

    let agg = Aggregator::new(config(vec![
        source(format!("{}/a", server.uri()), ProtocolHint::Auto),
        source(format!("{}/b", server.uri()), ProtocolHint::Auto),
    ]));

    let (candidates, reports) = agg.aggregate().await.unwrap();
    assert_eq!(candidates.len(), 3);
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[&format!("{}/a", server.uri())].proxies_found, 2);
}

#[tokio::test]
async fn socks5_url_infers_protocol() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/socks5.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("198.51.100.2:1080"))
        .mount(&server)
        .await;

    let agg = Aggregator::new(config(vec![source(
        format!("{}/socks5.txt", server.uri()),
        ProtocolHint::Auto,
    )]));

    let (candidates, _) = agg.aggregate().await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].protocol, Protocol::Socks5);
    assert_eq!(candidates[0].address, "198.51.100.2:1080");
}

#[tokio::test]
async fn failing_source_is_reported_not_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/good"))
        .respond_with(ResponseTemplate::new(200).set_body_string("1.1.1.1:80"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let agg = Aggregator::new(config(vec![
        source(format!("{}/good", server.uri()), ProtocolHint::Auto),
        source(format!("{}/broken", server.uri()), ProtocolHint::Auto),
    ]));

    let (candidates, reports) = agg.aggregate().await.unwrap();
    assert_eq!(candidates.len(), 1);
    let broken = &reports[&format!("{}/broken", server.uri())];
    assert_eq!(broken.proxies_found, 0);
    assert!(broken.error.contains("500"));
}

#[tokio::test]
async fn disabled_sources_are_skipped_and_empty_set_errors() {
    let server = MockServer::start().await;
    let mut disabled = source(format!("{}/x", server.uri()), ProtocolHint::Auto);
    disabled.enabled = false;

    let agg = Aggregator::new(config(vec![disabled]));
    match agg.aggregate().await {
        Err(HarvestError::NoSources) => {}
        other => panic!("expected NoSources, got {other:?}"),
    }
}

#[tokio::test]
async fn sends_configured_user_agent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ua"))
        .and(header("user-agent", "proxy-pool/1.0"))
        .respond_with(ResponseTemplate::new(200).set_body_string("9.9.9.9:9090"))
        .expect(1)
        .mount(&server)
        .await;

    let mut cfg = config(vec![source(format!("{}/ua", server.uri()), ProtocolHint::Auto)]);
    cfg.user_agent = "proxy-pool/1.0".into();

    let (candidates, _) = Aggregator::new(cfg).aggregate().await.unwrap();
    assert_eq!(candidates.len(), 1);
}

#[tokio::test]
async fn comments_and_garbage_are_ignored() {
    let server = MockServer::start().await;
    let body = "# comment\n\nhello world\n10.0.0.1:3128\n999.1.1.1 nonsense\n";
    Mock::given(method("GET"))
        .and(path("/mixed"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let agg = Aggregator::new(config(vec![source(
        format!("{}/mixed", server.uri()),
        ProtocolHint::Auto,
    )]));

    let (candidates, _) = agg.aggregate().await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].address, "10.0.0.1:3128");
}
