mod test_support;

use mockito::Matcher;
use serde_json::json;

use graph_gateway_module::metadata::{keys, MetadataPatch};
use graph_gateway_module::notify::{TicketCard, TicketMail, WorkspaceMail};
use graph_gateway_module::GatewayError;
use send_notifications_module::AdaptiveCard;
use test_support::{
    start_mockito_server, test_config, Harness, MemoryTicketStore, StaticCredentialStore,
};

const SENDER: &str = "support@contoso.com";

fn ticket_mail() -> TicketMail {
    TicketMail {
        ticket_id: "t-42".to_string(),
        ticket_code: Some("ENG-000042".to_string()),
        to: vec!["jane@contoso.com".to_string()],
        subject: "Printer jammed".to_string(),
        html_body: "<p>We are on it.</p>".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn denied_send_as_retries_as_signed_in_user() {
    let Some(mut server) = start_mockito_server("denied_send_as_retries_as_signed_in_user").await
    else {
        return;
    };
    let denied = server
        .mock("POST", "/me/sendMail")
        .match_body(Matcher::PartialJson(json!({
            "message": {"from": {"emailAddress": {"address": SENDER}}}
        })))
        .with_status(403)
        .with_body(r#"{"error":{"code":"ErrorSendAsDenied","message":"Send-as denied."}}"#)
        .expect(1)
        .create_async()
        .await;
    let fallback = server
        .mock("POST", "/me/sendMail")
        .match_header("authorization", "Bearer delegated-token")
        .match_body(Matcher::PartialJson(json!({
            "message": {"subject": "[ENG-000042] Printer jammed"}
        })))
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    let harness = Harness::new(
        test_config(&server.url()),
        StaticCredentialStore::delegated(&["org-1"]),
        MemoryTicketStore::default(),
    );
    harness.connect("org-1", Some("remote-1"));
    harness
        .store
        .set_notification_sender_email("org-1", Some(SENDER))
        .unwrap();

    harness
        .gateway
        .send_ticket_mail("org-1", ticket_mail())
        .await
        .unwrap();
    denied.assert_async().await;
    fallback.assert_async().await;
}

#[tokio::test]
async fn service_identity_sends_from_the_sender_mailbox() {
    let Some(mut server) = start_mockito_server("service_identity_sends_from_the_sender_mailbox")
        .await
    else {
        return;
    };
    let token = server
        .mock("POST", "/remote-1/oauth2/v2.0/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".to_string(), "client_credentials".to_string()),
            Matcher::UrlEncoded("client_id".to_string(), "client-id".to_string()),
        ]))
        .with_status(200)
        .with_body(r#"{"access_token":"app-token","expires_in":3600,"token_type":"Bearer"}"#)
        .expect(1)
        .create_async()
        .await;
    let send = server
        .mock(
            "POST",
            Matcher::Regex(r"^/users/support(%40|@)contoso\.com/sendMail$".to_string()),
        )
        .match_header("authorization", "Bearer app-token")
        .match_body(Matcher::PartialJson(json!({
            "message": {
                "internetMessageHeaders": [
                    {"name": "X-Ticket-Id", "value": "t-42"}
                ]
            }
        })))
        .with_status(202)
        .expect(2)
        .create_async()
        .await;

    let mut config = test_config(&server.url());
    config.service_identity_enabled = true;
    config.default_sender_mailbox = Some(SENDER.to_string());
    let harness = Harness::new(
        config,
        StaticCredentialStore::delegated(&[]).with_app_credentials(),
        MemoryTicketStore::default(),
    );
    harness.connect("org-1", Some("remote-1"));

    // The second send reuses the cached app token.
    for _ in 0..2 {
        harness
            .gateway
            .send_ticket_mail("org-1", ticket_mail())
            .await
            .unwrap();
    }
    token.assert_async().await;
    send.assert_async().await;
}

#[tokio::test]
async fn strict_mode_does_not_fall_back() {
    let Some(mut server) = start_mockito_server("strict_mode_does_not_fall_back").await else {
        return;
    };
    let _token = server
        .mock("POST", "/remote-1/oauth2/v2.0/token")
        .with_status(401)
        .with_body(
            r#"{"error":"invalid_client","error_description":"AADSTS7000215: Invalid client secret.\r\nTrace ID: abc"}"#,
        )
        .create_async()
        .await;
    let send = server
        .mock("POST", Matcher::Any)
        .match_body(Matcher::Regex("toRecipients".to_string()))
        .expect(0)
        .create_async()
        .await;

    let mut config = test_config(&server.url());
    config.service_identity_enabled = true;
    config.service_identity_strict = true;
    config.default_sender_mailbox = Some(SENDER.to_string());
    let harness = Harness::new(
        config,
        StaticCredentialStore::delegated(&["org-1"]).with_app_credentials(),
        MemoryTicketStore::default(),
    );
    harness.connect("org-1", Some("remote-1"));

    let err = harness
        .gateway
        .send_workspace_mail(
            "org-1",
            WorkspaceMail {
                to: vec!["jane@contoso.com".to_string()],
                subject: "Invite".to_string(),
                html_body: "<p>Join</p>".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::StrictAuthFailure { .. }));
    let text = err.to_string();
    assert!(text.contains("AADSTS7000215"));
    assert!(!text.contains("Trace ID"));
    send.assert_async().await;
}

#[tokio::test]
async fn strict_mode_without_remote_tenant_fails_before_any_token() {
    let Some(mut server) =
        start_mockito_server("strict_mode_without_remote_tenant_fails_before_any_token").await
    else {
        return;
    };
    let network = server
        .mock("POST", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    for enabled in [true, false] {
        let mut config = test_config(&server.url());
        config.service_identity_enabled = enabled;
        config.service_identity_strict = true;
        config.default_sender_mailbox = Some(SENDER.to_string());
        let harness = Harness::new(
            config,
            StaticCredentialStore::delegated(&["org-1"]).with_app_credentials(),
            MemoryTicketStore::default(),
        );
        harness.connect("org-1", None);

        let err = harness
            .gateway
            .send_ticket_mail("org-1", ticket_mail())
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                GatewayError::StrictAuthFailure {
                    remote_tenant_id: None,
                    ..
                }
            ),
            "enabled={enabled}: {err}"
        );
    }
    network.assert_async().await;
}

#[tokio::test]
async fn non_strict_failure_falls_back_to_delegated() {
    let Some(mut server) = start_mockito_server("non_strict_failure_falls_back_to_delegated").await
    else {
        return;
    };
    let _token = server
        .mock("POST", "/remote-1/oauth2/v2.0/token")
        .with_status(400)
        .with_body(r#"{"error":"unauthorized_client","error_description":"No consent."}"#)
        .create_async()
        .await;
    let send = server
        .mock("POST", "/me/sendMail")
        .match_header("authorization", "Bearer delegated-token")
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    let mut config = test_config(&server.url());
    config.service_identity_enabled = true;
    let harness = Harness::new(
        config,
        StaticCredentialStore::delegated(&["org-1"]).with_app_credentials(),
        MemoryTicketStore::default(),
    );
    harness.connect("org-1", Some("remote-1"));

    harness
        .gateway
        .send_ticket_mail("org-1", ticket_mail())
        .await
        .unwrap();
    send.assert_async().await;
}

#[tokio::test]
async fn chat_card_without_destination_is_a_no_op() {
    let Some(mut server) = start_mockito_server("chat_card_without_destination_is_a_no_op").await
    else {
        return;
    };
    let any = server
        .mock("POST", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let harness = Harness::new(
        test_config(&server.url()),
        StaticCredentialStore::delegated(&["org-1"]),
        MemoryTicketStore::default(),
    );
    harness.connect("org-1", Some("remote-1"));

    let sent = harness
        .gateway
        .send_workspace_chat_card("org-1", &AdaptiveCard::new("Digest", "3 tickets opened"))
        .await
        .unwrap();
    assert!(!sent);
    any.assert_async().await;
}

#[tokio::test]
async fn ticket_card_posts_to_the_configured_channel() {
    let Some(mut server) = start_mockito_server("ticket_card_posts_to_the_configured_channel").await
    else {
        return;
    };
    let post = server
        .mock("POST", "/teams/team-1/channels/chan-1/messages")
        .match_body(Matcher::Regex("application/vnd.microsoft.card.adaptive".to_string()))
        .with_status(201)
        .with_body(r#"{"id":"1700000000000"}"#)
        .expect(1)
        .create_async()
        .await;

    let harness = Harness::new(
        test_config(&server.url()),
        StaticCredentialStore::delegated(&["org-1"]),
        MemoryTicketStore::default(),
    );
    harness.connect("org-1", Some("remote-1"));
    harness.patch(
        "org-1",
        MetadataPatch::new()
            .set(keys::NOTIFICATION_TEAM_ID, "team-1")
            .set(keys::NOTIFICATION_CHANNEL_ID, "chan-1"),
    );

    let sent = harness
        .gateway
        .send_ticket_chat_card(
            "org-1",
            TicketCard {
                ticket_id: "t-42".to_string(),
                ticket_code: Some("ENG-000042".to_string()),
                title: "Printer jammed".to_string(),
                summary: "Escalated to facilities".to_string(),
                facts: vec![("Priority".to_string(), "High".to_string())],
            },
        )
        .await
        .unwrap();
    assert!(sent);
    post.assert_async().await;
}
