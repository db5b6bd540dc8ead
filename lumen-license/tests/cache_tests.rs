mod common;

use chrono::Duration;
use common::{claims_at, sign_claims, start_time, test_keypair, KEY};
use lumen_license::{LicenseCache, LicenseRecord, LicenseStatus};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;

fn sample_record() -> LicenseRecord {
    let (sk, _) = test_keypair();
    let now = start_time();
    LicenseRecord {
        license_key: KEY.to_string(),
        status: LicenseStatus::Valid,
        customer_id: Some("cus_42".into()),
        customer_name: Some("Acme Analytics".into()),
        product: Some("Lumen".into()),
        product_id: Some("prod_lumen".into()),
        features: BTreeSet::from(["export".to_string(), "sso".to_string()]),
        expires_at: Some(now + Duration::days(365)),
        verified_at: Some(now - Duration::minutes(1)),
        issued_at: Some(now),
        activations: 1,
        max_activations: 2,
        device_id: Some("dev-a".into()),
        is_offline: false,
        cached_response: Some(sign_claims(&sk, &claims_at(now))),
    }
}

#[test]
fn store_and_load() {
    let cache = LicenseCache::open_in_memory().unwrap();
    let record = sample_record();

    cache.store(&record).unwrap();

    assert_eq!(cache.load().unwrap(), Some(record.clone()));
    assert_eq!(cache.reload().unwrap(), Some(record));
}

#[test]
fn store_replaces_previous_record() {
    let cache = LicenseCache::open_in_memory().unwrap();
    cache.store(&sample_record()).unwrap();

    let mut next = sample_record();
    next.license_key = "WXYZ-9876-QRST".into();
    next.status = LicenseStatus::Locked;
    next.features.clear();
    next.expires_at = None;
    cache.store(&next).unwrap();

    assert_eq!(cache.reload().unwrap(), Some(next));
}

#[test]
fn empty_record_round_trips() {
    let cache = LicenseCache::open_in_memory().unwrap();
    let empty = LicenseRecord::empty();

    cache.store(&empty).unwrap();

    let loaded = cache.reload().unwrap().unwrap();
    assert_eq!(loaded, empty);
    assert!(!loaded.is_activated());
}

#[test]
fn persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("license.db");
    let record = sample_record();

    {
        let cache = LicenseCache::open(&path).unwrap();
        cache.store(&record).unwrap();
    }

    let reopened = LicenseCache::open(&path).unwrap();
    assert_eq!(reopened.load().unwrap(), Some(record));
}

#[test]
fn mark_offline_updates_row_and_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("license.db");
    let cache = LicenseCache::open(&path).unwrap();
    cache.store(&sample_record()).unwrap();

    cache.mark_offline(true).unwrap();

    assert!(cache.load().unwrap().unwrap().is_offline);
    drop(cache);
    let reopened = LicenseCache::open(&path).unwrap();
    assert!(reopened.load().unwrap().unwrap().is_offline);
}

#[test]
fn clear_removes_record() {
    let cache = LicenseCache::open_in_memory().unwrap();
    cache.store(&sample_record()).unwrap();

    cache.clear().unwrap();

    assert_eq!(cache.load().unwrap(), None);
    assert_eq!(cache.reload().unwrap(), None);
}

#[test]
fn every_status_round_trips() {
    let cache = LicenseCache::open_in_memory().unwrap();
    for status in [
        LicenseStatus::Unknown,
        LicenseStatus::Valid,
        LicenseStatus::Invalid,
        LicenseStatus::Expired,
        LicenseStatus::GraceOffline,
        LicenseStatus::Locked,
    ] {
        let mut record = sample_record();
        record.status = status;
        cache.store(&record).unwrap();
        assert_eq!(cache.reload().unwrap().unwrap().status, status);
    }
}

#[test]
fn keeps_single_row_across_stores() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("license.db");
    let cache = LicenseCache::open(&path).unwrap();
    for activations in 0..3 {
        let mut record = sample_record();
        record.activations = activations;
        cache.store(&record).unwrap();
    }
    drop(cache);

    let conn = rusqlite::Connection::open(&path).unwrap();
    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM license_record", [], |row| row.get(0))
        .unwrap();
    assert_eq!(rows, 1);
}

#[test]
fn row_id_survives_replacement() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("license.db");
    let cache = LicenseCache::open(&path).unwrap();
    let read_id = || -> String {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.query_row("SELECT id FROM license_record", [], |row| row.get(0))
            .unwrap()
    };

    cache.store(&sample_record()).unwrap();
    let first = read_id();
    cache.store(&sample_record()).unwrap();

    assert_eq!(read_id(), first);
}

#[test]
fn opens_cache_written_without_issue_time() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("license.db");
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE license_record (
                id TEXT PRIMARY KEY,
                license_key TEXT NOT NULL,
                status TEXT NOT NULL,
                customer_name TEXT,
                product TEXT,
                product_id TEXT,
                customer_id TEXT,
                features TEXT NOT NULL,
                expires_at TEXT,
                verified_at TEXT,
                activations INTEGER NOT NULL,
                max_activations INTEGER NOT NULL,
                cached_response TEXT,
                device_id TEXT,
                is_offline INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            INSERT INTO license_record VALUES (
                'row-1', 'ABCD-1234-EFGH', 'valid', NULL, NULL, NULL, NULL, '[]',
                NULL, '2026-01-01T00:00:00+00:00', 1, 2, NULL, 'dev-a', 0,
                '2026-01-01T00:00:00+00:00', '2026-01-01T00:00:00+00:00'
            );",
        )
        .unwrap();
    }

    let cache = LicenseCache::open(&path).unwrap();
    let loaded = cache.load().unwrap().unwrap();
    assert_eq!(loaded.license_key, KEY);
    assert_eq!(loaded.issued_at, None);
    assert!(loaded.verified_at.is_some());

    let mut updated = loaded.clone();
    updated.issued_at = Some(start_time());
    cache.store(&updated).unwrap();
    drop(cache);
    let reopened = LicenseCache::open(&path).unwrap();
    assert_eq!(reopened.load().unwrap(), Some(updated));
}

#[test]
fn shared_across_threads() {
    let cache = std::sync::Arc::new(LicenseCache::open_in_memory().unwrap());
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let cache = std::sync::Arc::clone(&cache);
            std::thread::spawn(move || {
                let mut record = sample_record();
                record.activations = i;
                cache.store(&record).unwrap();
                cache.load().unwrap().unwrap()
            })
        })
        .collect();

    for handle in handles {
        let seen = handle.join().unwrap();
        assert_eq!(seen.license_key, KEY);
    }
}
