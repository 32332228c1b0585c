use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;

use aggsync_client::{HttpRuleStore, RetryPolicy};
use aggsync_engine::{AggregationRules, ErrorKind};

#[tokio::test]
async fn stalled_listing_fails_connect_as_remote_unavailable() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/aggregations/segmented_rules");
            then.status(200).json_body(json!([])).delay(Duration::from_secs(2));
        })
        .await;

    let store = HttpRuleStore::new(&server.base_url())
        .unwrap()
        .with_retry_policy(RetryPolicy::none())
        .with_timeout(Duration::from_millis(200));

    let err = match AggregationRules::connect(Arc::new(store)).await {
        Ok(_) => panic!("connect should time out"),
        Err(e) => e,
    };
    assert_eq!(err.kind(), ErrorKind::RemoteUnavailable);
}
