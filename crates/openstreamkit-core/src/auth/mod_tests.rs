//! Tests for credential types

use super::*;
use chrono::{Duration as ChronoDuration, TimeZone};

fn scope(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|s| s.to_string()).collect()
}

fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

// ============================================================================
// Credential Construction
// ============================================================================

mod construction {
    use super::*;

    #[test]
    fn test_new_accepts_valid_window() {
        let issued = fixed_time();
        let credential = Credential::new(
            "access",
            "refresh",
            scope(&["events:subscribe"]),
            issued,
            issued + ChronoDuration::hours(1),
        )
        .expect("valid credential");

        assert_eq!(credential.issued_at(), issued);
        assert!(credential.scope().contains("events:subscribe"));
    }

    #[test]
    fn test_new_rejects_expiry_before_issue() {
        let issued = fixed_time();

        let result = Credential::new("a", "r", scope(&[]), issued, issued);

        assert!(matches!(
            result,
            Err(ValidationError::InvalidFormat { ref field, .. }) if field == "expires_at"
        ));
    }

    #[test]
    fn test_new_rejects_empty_tokens() {
        let issued = fixed_time();
        let expires = issued + ChronoDuration::hours(1);

        assert!(Credential::new("", "r", scope(&[]), issued, expires).is_err());
        assert!(Credential::new("a", "", scope(&[]), issued, expires).is_err());
    }
}

// ============================================================================
// Expiry Checks
// ============================================================================

mod expiry {
    use super::*;

    fn credential_expiring_at(expires_at: DateTime<Utc>) -> Credential {
        Credential::new(
            "a",
            "r",
            scope(&[]),
            expires_at - ChronoDuration::hours(2),
            expires_at,
        )
        .unwrap()
    }

    #[test]
    fn test_expires_within_margin() {
        let now = fixed_time();
        let credential = credential_expiring_at(now + ChronoDuration::seconds(30));

        assert!(credential.expires_within(Duration::from_secs(60), now));
        assert!(!credential.expires_within(Duration::from_secs(10), now));
    }

    #[test]
    fn test_already_expired_counts_as_expiring() {
        let now = fixed_time();
        let credential = credential_expiring_at(now - ChronoDuration::seconds(1));

        assert!(credential.expires_within(Duration::ZERO, now));
        assert!(credential.is_expired_at(now));
    }
}

// ============================================================================
// Secret Handling
// ============================================================================

mod secrets {
    use super::*;

    #[test]
    fn test_debug_output_redacts_tokens() {
        let issued = fixed_time();
        let credential = Credential::new(
            "super-secret-access",
            "super-secret-refresh",
            scope(&[]),
            issued,
            issued + ChronoDuration::hours(1),
        )
        .unwrap();

        let debug = format!("{:?} {:?}", credential, credential.bearer());

        assert!(!debug.contains("super-secret-access"));
        assert!(!debug.contains("super-secret-refresh"));
        assert!(debug.contains("<REDACTED>"));
    }

    #[test]
    fn test_bearer_token_sets_authorization_header() {
        let issued = fixed_time();
        let credential = Credential::new(
            "token-value",
            "r",
            scope(&[]),
            issued,
            issued + ChronoDuration::hours(1),
        )
        .unwrap();

        let request = credential
            .bearer()
            .apply(reqwest::Client::new().get("http://localhost/"))
            .build()
            .unwrap();

        assert_eq!(
            request.headers().get("authorization").unwrap(),
            "Bearer token-value"
        );
    }
}

// ============================================================================
// Error Classification
// ============================================================================

mod errors {
    use super::*;

    #[test]
    fn test_refresh_error_classification() {
        let retryable = RefreshError::Retryable {
            message: "503".to_string(),
            status: Some(503),
        };
        let terminal = RefreshError::Terminal {
            message: "invalid_grant".to_string(),
            status: Some(400),
        };

        assert!(retryable.is_transient());
        assert!(!retryable.is_terminal());
        assert!(terminal.is_terminal());
        assert!(!CredentialError::RefreshFailed(terminal).is_transient());
        assert!(CredentialError::RefreshFailed(retryable).is_transient());
    }

    #[test]
    fn test_authorization_errors_require_login() {
        assert!(CredentialError::NotAuthorized.requires_authorization());
        assert!(CredentialError::ReauthorizationRequired {
            reason: "revoked".to_string()
        }
        .requires_authorization());
        assert!(!CredentialError::Storage(TokenStoreError::Closed).requires_authorization());
    }

    #[test]
    fn test_auth_state_degraded_flag() {
        assert!(!AuthState::NotAuthorized.is_degraded());
        assert!(AuthState::ReauthorizationRequired {
            reason: "x".to_string()
        }
        .is_degraded());
    }
}
