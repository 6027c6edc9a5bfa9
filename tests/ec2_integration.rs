//! Integration tests for the EC2 datasource using wiremock

use cloud_init_rs::config::Ec2Config;
use cloud_init_rs::datasources::Datasource;
use cloud_init_rs::datasources::ec2::Ec2;
use cloud_init_rs::userdata::{HttpFetcher, UserDataProcessor};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn settings(url: &str) -> Ec2Config {
    Ec2Config {
        metadata_urls: vec![url.to_string()],
        max_wait: 2,
        timeout: 1,
        sleep: 0,
        strict_id: false,
    }
}

async fn mount_get(server: &MockServer, route: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

/// IMDSv2: token first, then every request carries it
#[tokio::test]
async fn test_ec2_probe_with_token() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/latest/api/token"))
        .and(header("X-aws-ec2-metadata-token-ttl-seconds", "300"))
        .respond_with(ResponseTemplate::new(200).set_body_string("test-token"))
        .mount(&mock_server)
        .await;

    for (route, body) in [
        ("/latest/meta-data/instance-id", "i-1234567890abcdef0"),
        ("/latest/meta-data/local-hostname", "ip-172-31-0-1.ec2.internal"),
        ("/latest/meta-data/instance-type", "t3.micro"),
        ("/latest/meta-data/placement/availability-zone", "us-east-1a"),
        ("/latest/user-data", "#cloud-config\nhostname: web\n"),
    ] {
        Mock::given(method("GET"))
            .and(path(route))
            .and(header("X-aws-ec2-metadata-token", "test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&mock_server)
            .await;
    }

    let data = Ec2::new(settings(&mock_server.uri()))
        .probe()
        .await
        .unwrap()
        .expect("EC2 should be detected");

    assert_eq!(data.instance_id, "i-1234567890abcdef0");
    assert_eq!(data.metadata["local-hostname"], "ip-172-31-0-1.ec2.internal");
    assert_eq!(data.metadata["instance-type"], "t3.micro");
    assert_eq!(data.metadata["availability-zone"], "us-east-1a");
    assert_eq!(data.metadata["region"], "us-east-1");
    assert_eq!(data.user_data, b"#cloud-config\nhostname: web\n");
    assert_eq!(data.vendor_data, None);
}

/// Without a token endpoint the datasource falls back to IMDSv1
#[tokio::test]
async fn test_ec2_probe_imdsv1_fallback() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/latest/api/token"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&mock_server)
        .await;
    mount_get(&mock_server, "/latest/meta-data/instance-id", "i-v1only").await;

    let data = Ec2::new(settings(&mock_server.uri()))
        .probe()
        .await
        .unwrap()
        .expect("EC2 should be detected");

    assert_eq!(data.instance_id, "i-v1only");
    // No user-data route mounted: 404 means none configured
    assert!(data.user_data.is_empty());
    assert!(!data.metadata.contains_key("local-hostname"));
}

/// A service that never answers is "not this platform"
#[tokio::test]
async fn test_ec2_unreachable_is_not_applicable() {
    let mock_server = MockServer::start().await;
    let uri = mock_server.uri();
    drop(mock_server);

    let found = Ec2::new(settings(&uri)).probe().await.unwrap();
    assert!(found.is_none());
}

/// A service that answers but has no instance-id is an error
#[tokio::test]
async fn test_ec2_unauthorized_probe_then_missing_id() {
    let mock_server = MockServer::start().await;

    // 401 on the probe path still counts as "service is up"
    Mock::given(method("GET"))
        .and(path("/latest/meta-data/instance-id"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    let result = Ec2::new(settings(&mock_server.uri())).probe().await;
    assert!(result.is_err());
}

/// DMI evidence lets a strict probe through
#[tokio::test]
async fn test_ec2_strict_id_with_dmi() {
    let mock_server = MockServer::start().await;
    mount_get(&mock_server, "/latest/meta-data/instance-id", "i-strict").await;

    let dmi = TempDir::new().unwrap();
    std::fs::write(dmi.path().join("sys_vendor"), "Amazon EC2\n").unwrap();

    let mut strict = settings(&mock_server.uri());
    strict.strict_id = true;

    let data = Ec2::new(strict)
        .with_dmi_dir(dmi.path())
        .probe()
        .await
        .unwrap()
        .expect("EC2 should be detected");
    assert_eq!(data.instance_id, "i-strict");
}

/// `#include` targets are fetched over HTTP in order
#[tokio::test]
async fn test_include_over_http() {
    let mock_server = MockServer::start().await;
    mount_get(&mock_server, "/one", "#!/bin/sh\necho one\n").await;
    mount_get(&mock_server, "/two", "#cloud-config\nruncmd: [ls]\n").await;

    let user_data = format!(
        "#include\n{uri}/one\n{uri}/two\n?{uri}/missing\n",
        uri = mock_server.uri()
    );

    let fetcher = HttpFetcher::new(Duration::from_secs(2)).unwrap();
    let message = UserDataProcessor::new(&fetcher)
        .process(user_data.as_bytes())
        .await
        .unwrap();

    let types: Vec<&str> = message
        .parts()
        .iter()
        .map(|p| p.content_type.as_str())
        .collect();
    assert_eq!(types, vec!["text/x-shellscript", "text/cloud-config"]);
    assert_eq!(message.parts()[1].payload, b"runcmd: [ls]\n");
}

/// A required include that 404s fails the whole user-data
#[tokio::test]
async fn test_required_include_failure() {
    let mock_server = MockServer::start().await;

    let user_data = format!("#include {}/nothing-here\n", mock_server.uri());
    let fetcher = HttpFetcher::new(Duration::from_secs(2)).unwrap();
    let result = UserDataProcessor::new(&fetcher)
        .process(user_data.as_bytes())
        .await;

    assert!(result.is_err());
}
