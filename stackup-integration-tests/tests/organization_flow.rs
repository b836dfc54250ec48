//! End-to-end scenario against a real Docker engine.
//!
//! Container names are fixed network aliases, so the whole flow runs as one
//! test with explicit steps instead of several tests racing for the same
//! names.
//!
//! Run with `cargo test -p stackup-integration-tests -- --ignored`. The
//! service images are resolved through `STACKUP_SERVICE_REGISTRY` and
//! `STACKUP_SERVICE_TAG`; `STACKUP_BEARER_TOKEN` authorizes the HTTP check.

use std::error::Error;
use std::time::Duration;

use stackup::probe::{public_table_count, schema_exists, tenant_schema_name};
use stackup::{
    eventually, stays_false, AdminEvent, LogicalDatabase, Phase, PollPolicy, PublishError,
    PublishOutcome, PublishRequest, RoutingKey,
};
use stackup_integration_tests::{OrganizationSuite, ORGANIZATION_QUEUE, UNROUTED_QUEUE};

const BOOTSTRAPPED: [&str; 2] = ["orders", "articles"];
const STRAY_WINDOW: Duration = Duration::from_secs(15);
const STRAY_INTERVAL: Duration = Duration::from_secs(1);
const CONSUMER_WAIT: Duration = Duration::from_secs(3);

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a Docker engine and the service images"]
async fn organization_created_event_provisions_tenant_schema_and_serves_articles() {
    // Given: network, broker, database and services up in dependency order
    let mut suite = OrganizationSuite::start()
        .await
        .expect("organization suite should come up");
    assert_eq!(suite.environment().phase(), Phase::ServicesReady);

    // When/Then: the scenario runs; teardown happens whatever it reports
    let outcome = exercise(&suite).await;
    let report = suite.stop().await;
    outcome.expect("scenario should pass");

    // Then: everything was released and a second teardown is a no-op
    assert!(report.is_clean(), "teardown failures: {:?}", report.failures);
    assert_eq!(suite.environment().phase(), Phase::Stopped);
    assert!(suite.stop().await.is_empty());
    assert!(suite.service_url("articleservice").is_none());
}

async fn exercise(suite: &OrganizationSuite) -> Result<(), Box<dyn Error>> {
    bootstrapped_databases_are_empty(suite).await?;

    let articles = suite.external_descriptor(&LogicalDatabase::try_new("articles")?)?;
    let policy = suite.settle_policy();
    let publisher = suite.publisher().await?;

    // Matching routing key: the tenant schema appears
    let created = AdminEvent::organization_created("TestOrganization", "test1234")?;
    let request = PublishRequest::topic(
        RoutingKey::organization_created(),
        ORGANIZATION_QUEUE,
        created.to_payload()?,
    );
    assert_eq!(publisher.publish(&request).await?, PublishOutcome::Routed);

    let schema = tenant_schema_name("TestOrganization");
    assert_eq!(schema, "schema_testorganization");
    eventually("tenant schema created", &policy, || {
        schema_exists(&articles, &schema)
    })
    .await?;

    // The article service answers once the tenant exists
    let base_url = suite
        .service_url("articleservice")
        .ok_or("articleservice has no mapped HTTP port")?;
    let url = format!("{base_url}/api/Article");
    let probe = suite.http_probe();
    eventually("article listing succeeds", &policy, || probe.succeeds(&url)).await?;

    // Non-matching routing key, on a queue of its own that nobody consumes
    let consumer_wait = PollPolicy::with_deadline(CONSUMER_WAIT);
    let missing = publisher
        .wait_for_consumers(UNROUTED_QUEUE, &consumer_wait)
        .await;
    assert!(
        matches!(&missing, Err(PublishError::NoConsumer { queue, .. }) if queue == UNROUTED_QUEUE),
        "undeclared queue should report no consumer, got {missing:?}"
    );

    let stray = AdminEvent::organization_created("UnroutedOrganization", "unrouted")?;
    let request = PublishRequest::topic(
        RoutingKey::raw("stackup.unrelated.event"),
        UNROUTED_QUEUE,
        stray.to_payload()?,
    );
    assert_eq!(publisher.publish(&request).await?, PublishOutcome::Routed);

    let idle = publisher
        .wait_for_consumers(UNROUTED_QUEUE, &consumer_wait)
        .await;
    assert!(
        matches!(&idle, Err(PublishError::NoConsumer { .. })),
        "stray queue must stay unconsumed, got {idle:?}"
    );

    // No schema appears, however long we look
    let stray_schema = tenant_schema_name("UnroutedOrganization");
    stays_false("stray schema created", STRAY_WINDOW, STRAY_INTERVAL, || {
        schema_exists(&articles, &stray_schema)
    })
    .await?;

    publisher.close().await?;
    Ok(())
}

async fn bootstrapped_databases_are_empty(suite: &OrganizationSuite) -> Result<(), Box<dyn Error>> {
    for name in BOOTSTRAPPED {
        let database = LogicalDatabase::try_new(name)?;
        let descriptor = suite.external_descriptor(&database)?;
        assert_ne!(descriptor.host(), "postgres", "{name} must use the mapped host");

        let tables = public_table_count(&descriptor).await?;
        assert_eq!(tables, 0, "{name} should start without tables");
    }
    Ok(())
}
