use jobfeed_adapters::{FixtureSourceProvider, SearchQuery, SourceProvider};
use jobfeed_core::RawValue;

fn query(term: &str, sites: &[&str], max_results: u64) -> SearchQuery {
    SearchQuery {
        sites: sites.iter().map(|s| s.to_string()).collect(),
        term: term.to_string(),
        location: "USA".into(),
        country: "USA".into(),
        max_results,
        max_age_hours: 72,
        proxy: None,
        user_agent: None,
    }
}

#[tokio::test]
async fn fixture_provider_filters_sites_and_caps_results() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("rust-developer.json"),
        r#"[
            {"site":"indeed","title":"Rust Developer","job_url":"https://example.test/1","company":"Acme"},
            {"site":"linkedin","title":"Rust Engineer","job_url":"https://example.test/2","company":"nan"},
            {"site":"google","title":"Ignored","job_url":"https://example.test/3"},
            {"site":"indeed","title":"Another","job_url":"https://example.test/4","min_amount":90000}
        ]"#,
    )
    .expect("write fixture");

    let provider = FixtureSourceProvider::new(dir.path());
    let listings = provider
        .fetch(&query("Rust Developer", &["indeed", "linkedin"], 100))
        .await
        .expect("fetch");
    assert_eq!(listings.len(), 3);
    assert_eq!(listings[2].get("min_amount"), Some(&RawValue::Number(90000.0)));

    let capped = provider
        .fetch(&query("Rust Developer", &["indeed", "linkedin"], 1))
        .await
        .expect("fetch capped");
    assert_eq!(capped.len(), 1);
}

#[tokio::test]
async fn missing_fixture_is_an_empty_result() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = FixtureSourceProvider::new(dir.path());
    let listings = provider
        .fetch(&query("cobol", &["indeed"], 10))
        .await
        .expect("fetch");
    assert!(listings.is_empty());
}

#[tokio::test]
async fn malformed_fixture_is_a_provider_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("broken.json"), "{not json").expect("write fixture");
    let provider = FixtureSourceProvider::new(dir.path());
    assert!(provider.fetch(&query("broken", &[], 10)).await.is_err());
}
