use lumen_license::{DeviceFingerprint, DeviceInfo};

#[test]
fn device_info_collection() {
    let info = DeviceInfo::collect();
    assert!(!info.os_name.is_empty());
    assert!(!info.arch.is_empty());
    assert!(!info.hostname.is_empty());
    assert!(!info.os_version.is_empty());
}

#[test]
fn device_info_serde() {
    let info = DeviceInfo::collect();
    let json = serde_json::to_string(&info).unwrap();
    let parsed: DeviceInfo = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, info);
}

#[test]
fn fingerprint_stability() {
    let fp1 = DeviceFingerprint::generate();
    let fp2 = DeviceFingerprint::generate();
    assert_eq!(fp1, fp2);
    assert!(fp1.matches_current());
}

#[test]
fn fingerprint_format() {
    let fp = DeviceFingerprint::from_components(&["linux", "x86_64", "build-01"]);
    assert!(fp.id().starts_with("dev-"));
    // 16 digest bytes, unpadded base64url
    assert_eq!(fp.id().len(), 4 + 22);
    assert!(fp.id()[4..].chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
}

#[test]
fn fingerprint_depends_on_components() {
    let a = DeviceFingerprint::from_components(&["linux", "x86_64", "host-a"]);
    let b = DeviceFingerprint::from_components(&["linux", "x86_64", "host-b"]);
    assert_ne!(a, b);
    assert!(!a.matches_current());
}

#[test]
fn fingerprint_separates_components() {
    let joined = DeviceFingerprint::from_components(&["ab", "c"]);
    let shifted = DeviceFingerprint::from_components(&["a", "bc"]);
    assert_ne!(joined, shifted);
}

#[test]
fn fingerprint_serializes_as_plain_string() {
    let fp = DeviceFingerprint::from_components(&["x"]);
    let json = serde_json::to_string(&fp).unwrap();
    assert_eq!(json, format!("\"{}\"", fp.id()));

    let parsed: DeviceFingerprint = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, fp);
}

#[test]
fn fingerprint_into_string() {
    let fp = DeviceFingerprint::from_components(&["x"]);
    let id = fp.id().to_string();
    let s: String = fp.into();
    assert_eq!(s, id);
}
