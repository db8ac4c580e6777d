//! Unit tests for provider API payloads

use super::*;

#[test]
fn test_summary_flattens_status() {
    let summary = ProviderSummary {
        provider: Provider::Google,
        oauth_configured: true,
        status: ConnectionStatus {
            connected: true,
            provider_email: Some("a@example.com".to_string()),
            scopes: Some(vec!["email".to_string()]),
        },
    };

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["provider"], "google");
    assert_eq!(json["oauth_configured"], true);
    assert_eq!(json["connected"], true);
    assert_eq!(json["provider_email"], "a@example.com");
    assert_eq!(json["scopes"][0], "email");
}

#[test]
fn test_disconnected_summary_omits_details() {
    let summary = ProviderSummary {
        provider: Provider::Slack,
        oauth_configured: false,
        status: ConnectionStatus::disconnected(),
    };

    let json = serde_json::to_string(&summary).unwrap();
    assert!(json.contains("\"connected\":false"));
    assert!(!json.contains("provider_email"));
    assert!(!json.contains("scopes"));
}

#[test]
fn test_token_response_serialization() {
    let response = AccessTokenResponse {
        connected: true,
        access_token: "ya29.token".to_string(),
        expires_at: DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc),
        provider_email: None,
    };

    let json = serde_json::to_string(&response).unwrap();
    assert!(json.contains("\"access_token\":\"ya29.token\""));
    assert!(json.contains("\"expires_at\":\"2026-03-01T10:00:00Z\""));
    assert!(!json.contains("provider_email"));
}

#[test]
fn test_store_response_keeps_null_email() {
    let response = StoreTokensResponse {
        success: true,
        provider_email: None,
    };
    assert_eq!(
        serde_json::to_string(&response).unwrap(),
        r#"{"success":true,"provider_email":null}"#
    );
}
