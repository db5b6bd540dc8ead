use lumen_license::{FailureClass, LicenseError};

#[test]
fn error_display_invalid_format() {
    let err = LicenseError::InvalidFormat("bad format".into());
    assert!(format!("{err}").contains("invalid license key format"));
}

#[test]
fn error_display_network_unavailable() {
    let err = LicenseError::NetworkUnavailable("connection refused".into());
    let msg = format!("{err}");
    assert!(msg.contains("unreachable"));
    assert!(msg.contains("connection refused"));
}

#[test]
fn error_display_rejected() {
    let err = LicenseError::Rejected("revoked".into());
    assert_eq!(format!("{err}"), "license rejected by authority: revoked");
}

#[test]
fn error_display_signature_invalid() {
    assert!(format!("{}", LicenseError::SignatureInvalid).contains("signature"));
}

#[test]
fn error_display_activation_limit() {
    let err = LicenseError::ActivationLimitExceeded { max: 3 };
    assert!(format!("{err}").contains("max 3"));
}

#[test]
fn error_display_expired() {
    let err = LicenseError::Expired("2025-01-01".into());
    assert!(format!("{err}").contains("expired"));
}

#[test]
fn error_display_not_activated() {
    assert!(format!("{}", LicenseError::NotActivated).contains("not activated"));
}

#[test]
fn error_display_storage() {
    let err = LicenseError::Storage("disk full".into());
    assert!(format!("{err}").contains("disk full"));
}

#[test]
fn classes() {
    assert_eq!(LicenseError::InvalidFormat(String::new()).class(), FailureClass::Validation);
    assert_eq!(LicenseError::NetworkUnavailable(String::new()).class(), FailureClass::Network);
    assert_eq!(LicenseError::ActivationRequiresNetwork.class(), FailureClass::Network);
    assert_eq!(LicenseError::Rejected(String::new()).class(), FailureClass::Rejection);
    assert_eq!(LicenseError::SignatureInvalid.class(), FailureClass::Rejection);
    assert_eq!(LicenseError::PayloadExpired(String::new()).class(), FailureClass::Rejection);
    assert_eq!(
        LicenseError::ActivationLimitExceeded { max: 1 }.class(),
        FailureClass::Business
    );
    assert_eq!(LicenseError::Unauthorized.class(), FailureClass::Business);
    assert_eq!(LicenseError::Cancelled.class(), FailureClass::Business);
    assert_eq!(LicenseError::Config(String::new()).class(), FailureClass::Internal);
}

#[test]
fn only_network_failures_are_retryable() {
    assert!(LicenseError::NetworkUnavailable("timeout".into()).is_retryable());
    assert!(!LicenseError::ActivationRequiresNetwork.is_retryable());
    assert!(!LicenseError::Rejected("no".into()).is_retryable());
    assert!(!LicenseError::SignatureInvalid.is_retryable());
    assert!(!LicenseError::Storage("io".into()).is_retryable());
}

#[test]
fn from_serde_json_error() {
    let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
    let err: LicenseError = json_err.into();
    assert!(matches!(err, LicenseError::Serialization(_)));
}

#[test]
fn errors_are_cloneable_and_comparable() {
    let err = LicenseError::Rejected("revoked".into());
    assert_eq!(err.clone(), err);
    assert_ne!(err, LicenseError::Rejected("other".into()));
}

#[test]
fn error_debug() {
    let debug = format!("{:?}", LicenseError::Cancelled);
    assert!(debug.contains("Cancelled"));
}
