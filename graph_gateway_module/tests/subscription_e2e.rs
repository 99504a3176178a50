mod test_support;

use chrono::{Duration, Utc};
use mockito::Matcher;
use serde_json::json;

use graph_gateway_module::metadata::{keys, MetadataPatch};
use graph_gateway_module::subscription::parse_client_state;
use graph_gateway_module::webhook::WebhookNotification;
use graph_gateway_module::GatewayError;
use test_support::{
    start_mockito_server, test_config, Harness, MemoryTicketStore, StaticCredentialStore,
    WEBHOOK_URL,
};

fn harness(config: graph_gateway_module::GatewayConfig, tenants: &[&str]) -> Harness {
    let harness = Harness::new(
        config,
        StaticCredentialStore::delegated(tenants),
        MemoryTicketStore::default(),
    );
    for tenant in tenants {
        harness.connect(tenant, Some("remote-1"));
    }
    harness
}

#[tokio::test]
async fn failed_renewal_falls_back_to_create() {
    let Some(mut server) = start_mockito_server("failed_renewal_falls_back_to_create").await else {
        return;
    };
    let expires = Utc::now() + Duration::hours(48);
    let renew = server
        .mock("PATCH", "/subscriptions/sub-old")
        .with_status(404)
        .with_body(r#"{"error":{"code":"ResourceNotFound","message":"The object was not found."}}"#)
        .expect(1)
        .create_async()
        .await;
    let create = server
        .mock("POST", "/subscriptions")
        .match_body(Matcher::PartialJson(json!({
            "changeType": "created",
            "notificationUrl": WEBHOOK_URL,
            "resource": "me/mailFolders('Inbox')/messages",
            "clientState": "graphmail:org-1:abc123",
        })))
        .with_status(201)
        .with_body(
            json!({"id": "sub-new", "expirationDateTime": expires.to_rfc3339()}).to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let harness = harness(test_config(&server.url()), &["org-1"]);
    harness.patch(
        "org-1",
        MetadataPatch::new()
            .set(keys::MAIL_SUBSCRIPTION_ID, "sub-old")
            .set_time(keys::MAIL_SUBSCRIPTION_EXPIRES_AT, Utc::now() + Duration::minutes(10))
            .set(keys::MAIL_WEBHOOK_CLIENT_STATE, "graphmail:org-1:abc123"),
    );

    let info = harness.gateway.ensure_mail_subscription("org-1").await.unwrap();
    assert_eq!(info.subscription_id, "sub-new");

    let meta = harness.metadata("org-1");
    assert_eq!(meta.mail_subscription_id.as_deref(), Some("sub-new"));
    assert!(meta.mail_subscription_expires_at.unwrap() > Utc::now() + Duration::hours(47));
    assert_eq!(
        meta.mail_webhook_client_state.as_deref(),
        Some("graphmail:org-1:abc123")
    );
    assert_eq!(meta.graph_consecutive_failures, 0);
    renew.assert_async().await;
    create.assert_async().await;
}

#[tokio::test]
async fn fresh_subscription_is_reused_without_network() {
    let Some(mut server) = start_mockito_server("fresh_subscription_is_reused_without_network").await
    else {
        return;
    };
    let renew = server
        .mock("PATCH", Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    let create = server
        .mock("POST", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let harness = harness(test_config(&server.url()), &["org-1"]);
    harness.patch(
        "org-1",
        MetadataPatch::new()
            .set(keys::MAIL_SUBSCRIPTION_ID, "sub-1")
            .set_time(keys::MAIL_SUBSCRIPTION_EXPIRES_AT, Utc::now() + Duration::hours(30))
            .set(keys::MAIL_WEBHOOK_CLIENT_STATE, "graphmail:org-1:abc123"),
    );

    let info = harness.gateway.ensure_mail_subscription("org-1").await.unwrap();
    assert_eq!(info.subscription_id, "sub-1");
    assert_eq!(
        harness.metadata("org-1").mail_webhook_client_state.as_deref(),
        Some("graphmail:org-1:abc123")
    );
    renew.assert_async().await;
    create.assert_async().await;
}

#[tokio::test]
async fn new_client_state_recreates_the_subscription() {
    let Some(mut server) = start_mockito_server("new_client_state_recreates_the_subscription").await
    else {
        return;
    };
    let expires = Utc::now() + Duration::hours(48);
    let renew = server
        .mock("PATCH", Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    let create = server
        .mock("POST", "/subscriptions")
        .match_body(Matcher::Regex(
            r#""clientState":"graphmail:org-1:[0-9a-f]{32}""#.to_string(),
        ))
        .with_status(201)
        .with_body(
            json!({"id": "sub-new", "expirationDateTime": expires.to_rfc3339()}).to_string(),
        )
        .expect(2)
        .create_async()
        .await;

    let harness = harness(test_config(&server.url()), &["org-1"]);

    // No stored secret: the live subscription echoes a value we cannot verify.
    harness.patch(
        "org-1",
        MetadataPatch::new()
            .set(keys::MAIL_SUBSCRIPTION_ID, "sub-1")
            .set_time(keys::MAIL_SUBSCRIPTION_EXPIRES_AT, Utc::now() + Duration::minutes(10)),
    );
    let info = harness.gateway.ensure_mail_subscription("org-1").await.unwrap();
    assert_eq!(info.subscription_id, "sub-new");
    let state = harness.metadata("org-1").mail_webhook_client_state.unwrap();
    assert_eq!(parse_client_state(&state).unwrap().tenant_id, "org-1");

    let accepted = harness
        .gateway
        .validate_webhook_notifications(&[WebhookNotification {
            subscription_id: Some("sub-new".to_string()),
            client_state: Some(state),
            ..Default::default()
        }])
        .await
        .unwrap();
    assert_eq!(accepted, vec!["org-1".to_string()]);

    // A secret minted under another prefix is replaced too, even while the
    // subscription is far from expiry.
    harness.patch(
        "org-1",
        MetadataPatch::new()
            .set(keys::MAIL_SUBSCRIPTION_ID, "sub-2")
            .set_time(keys::MAIL_SUBSCRIPTION_EXPIRES_AT, Utc::now() + Duration::hours(30))
            .set(keys::MAIL_WEBHOOK_CLIENT_STATE, "legacy:org-1:abc123"),
    );
    let info = harness.gateway.ensure_mail_subscription("org-1").await.unwrap();
    assert_eq!(info.subscription_id, "sub-new");
    let state = harness.metadata("org-1").mail_webhook_client_state.unwrap();
    assert_eq!(parse_client_state(&state).unwrap().prefix, "graphmail");

    renew.assert_async().await;
    create.assert_async().await;
}

#[tokio::test]
async fn insecure_or_local_webhook_urls_are_rejected() {
    for url in ["http://example.com/webhook", "https://localhost/webhook"] {
        let mut config = test_config("http://127.0.0.1:9");
        config.webhook_url = Some(url.to_string());
        let harness = harness(config, &["org-1"]);

        let err = harness
            .gateway
            .ensure_mail_subscription("org-1")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)), "{url}: {err}");
        // Rejected locally; not a Graph failure.
        assert_eq!(harness.metadata("org-1").graph_consecutive_failures, 0);
    }
}

#[tokio::test]
async fn batch_renewal_picks_due_and_unsubscribed_tenants() {
    let Some(mut server) = start_mockito_server("batch_renewal_picks_due_and_unsubscribed_tenants")
        .await
    else {
        return;
    };
    let expires = Utc::now() + Duration::hours(48);
    let renew = server
        .mock("PATCH", "/subscriptions/sub-due")
        .with_status(200)
        .with_body(json!({"id": "sub-due", "expirationDateTime": expires.to_rfc3339()}).to_string())
        .expect(1)
        .create_async()
        .await;
    let create = server
        .mock("POST", "/subscriptions")
        .with_status(201)
        .with_body(json!({"id": "sub-fresh", "expirationDateTime": expires.to_rfc3339()}).to_string())
        .expect(1)
        .create_async()
        .await;

    let harness = harness(test_config(&server.url()), &["org-due", "org-new", "org-later"]);
    harness.patch(
        "org-due",
        MetadataPatch::new()
            .set(keys::MAIL_SUBSCRIPTION_ID, "sub-due")
            .set_time(keys::MAIL_SUBSCRIPTION_EXPIRES_AT, Utc::now() + Duration::minutes(20))
            .set(keys::MAIL_WEBHOOK_CLIENT_STATE, "graphmail:org-due:abc123"),
    );
    harness.patch(
        "org-later",
        MetadataPatch::new()
            .set(keys::MAIL_SUBSCRIPTION_ID, "sub-later")
            .set_time(keys::MAIL_SUBSCRIPTION_EXPIRES_AT, Utc::now() + Duration::hours(40))
            .set(keys::MAIL_WEBHOOK_CLIENT_STATE, "graphmail:org-later:abc123"),
    );

    // Horizon below the floor is raised to 30 minutes.
    let summary = harness
        .gateway
        .renew_expiring_mail_subscriptions(Some(5))
        .await
        .unwrap();
    assert_eq!(summary.scanned, 3);
    assert_eq!(summary.renewed, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(
        harness.metadata("org-new").mail_subscription_id.as_deref(),
        Some("sub-fresh")
    );
    renew.assert_async().await;
    create.assert_async().await;
}
