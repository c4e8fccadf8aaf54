use std::path::{Path, PathBuf};

use lrt_adapters::{
    bundle_from_pages, load_snapshot_bundle, ExtractionRules, FetchedPage, SelectorAdapter,
};
use lrt_core::EntityKind;

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/legisladores/sample")
}

const RULES: &str = r#"{
  "row_selector": "table#data-integrantes tbody tr",
  "fields": [
    { "field": "image_url", "selector": "td:nth-child(1) img", "attr": "src", "absolute_url": true },
    { "field": "name", "selector": "td:nth-child(2) a" },
    { "field": "profile_url", "selector": "td:nth-child(2) a", "attr": "href", "absolute_url": true },
    { "field": "affiliation", "selector": "td:nth-child(3) a" },
    { "field": "mandate_start", "selector": "td:nth-child(4)" },
    { "field": "mandate_end", "selector": "td:nth-child(5)" },
    { "field": "extracted_on", "fetched_date": true }
  ]
}"#;

#[test]
fn listing_html_parses_to_the_captured_bundle() {
    let expected = load_snapshot_bundle(fixture_dir().join("bundle.json")).unwrap();
    let html = std::fs::read_to_string(fixture_dir().join("listing.html")).unwrap();
    let rules: ExtractionRules = serde_json::from_str(RULES).unwrap();
    let adapter = SelectorAdapter::new(
        "legisladores",
        EntityKind::Legislator,
        vec![expected.captured_from_url.clone()],
        rules,
    )
    .unwrap();

    let page = FetchedPage::from_html(&expected.captured_from_url, &html, expected.fetched_at);
    let bundle = bundle_from_pages(&adapter, &[page], expected.fetched_at).unwrap();

    assert_eq!(bundle, expected);
}
