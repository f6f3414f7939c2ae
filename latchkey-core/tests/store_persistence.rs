//! Cache store persistence tests: restart survival, prefix isolation,
//! and tamper handling.

mod common;

use common::{base_token, public_key, sign, DEVICE_ID, KID, LICENSE_KEY};
use latchkey_core::{CacheStore, License};

fn sample_license() -> License {
    License {
        license_key: LICENSE_KEY.into(),
        device_id: DEVICE_ID.into(),
        activation_id: "act-99".into(),
        activated_at: 1_750_000_000,
        last_validated: Some(1_750_000_100),
        last_validated_online: Some(1_750_000_100),
        validation: None,
    }
}

#[test]
fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = CacheStore::open("app", Some(dir.path().to_path_buf())).unwrap();
        store.set_license(&sample_license()).unwrap();
        store.set_offline_token(&sign(base_token(1_750_000_000, None))).unwrap();
        store.set_public_key(KID, &public_key()).unwrap();
        store.set_last_seen(1_750_000_200).unwrap();
    }

    let store = CacheStore::open("app", Some(dir.path().to_path_buf())).unwrap();
    let license = store.license().unwrap();
    assert_eq!(license.activation_id, "act-99");
    assert_eq!(license.last_validated_online, Some(1_750_000_100));

    let token = store.offline_token().unwrap();
    assert_eq!(token.token.license_key, LICENSE_KEY);
    assert!(token.canonical_matches());

    assert_eq!(store.public_key(KID).unwrap(), public_key());
    assert_eq!(store.last_seen(), Some(1_750_000_200));
}

#[test]
fn prefixes_are_isolated() {
    let dir = tempfile::tempdir().unwrap();

    let store_a = CacheStore::open("tenant-a", Some(dir.path().to_path_buf())).unwrap();
    let store_b = CacheStore::open("tenant-b", Some(dir.path().to_path_buf())).unwrap();

    store_a.set_license(&sample_license()).unwrap();
    store_a.set_last_seen(123).unwrap();

    assert!(store_b.license().is_none());
    assert!(store_b.last_seen().is_none());

    // Clearing one prefix leaves the other intact.
    store_b.set_last_seen(456).unwrap();
    store_a.clear();

    let reopened_a = CacheStore::open("tenant-a", Some(dir.path().to_path_buf())).unwrap();
    let reopened_b = CacheStore::open("tenant-b", Some(dir.path().to_path_buf())).unwrap();
    assert!(reopened_a.license().is_none());
    assert_eq!(reopened_b.last_seen(), Some(456));
}

#[test]
fn tampered_entries_read_as_absent() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = CacheStore::open("app", Some(dir.path().to_path_buf())).unwrap();
        store.set_license(&sample_license()).unwrap();
    }

    // Flip the last byte of every cache file; the AEAD tag no longer
    // verifies.
    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let path = entry.unwrap().path();
        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0x01;
        std::fs::write(&path, &data).unwrap();
    }

    let store = CacheStore::open("app", Some(dir.path().to_path_buf())).unwrap();
    assert!(store.license().is_none());
}

#[test]
fn truncated_entries_read_as_absent() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = CacheStore::open("app", Some(dir.path().to_path_buf())).unwrap();
        store.set_last_seen(789).unwrap();
    }

    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let path = entry.unwrap().path();
        std::fs::write(&path, b"short").unwrap();
    }

    let store = CacheStore::open("app", Some(dir.path().to_path_buf())).unwrap();
    assert!(store.last_seen().is_none());
}

#[test]
fn entries_are_encrypted_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::open("app", Some(dir.path().to_path_buf())).unwrap();
    store.set_license(&sample_license()).unwrap();

    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let data = std::fs::read(entry.unwrap().path()).unwrap();
        let text = String::from_utf8_lossy(&data);
        assert!(!text.contains(LICENSE_KEY));
        assert!(!text.contains("act-99"));
    }
}

#[test]
fn overwrite_replaces_entity() {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::open("app", Some(dir.path().to_path_buf())).unwrap();

    store.set_last_seen(100).unwrap();
    store.set_last_seen(200).unwrap();
    assert_eq!(store.last_seen(), Some(200));

    let reopened = CacheStore::open("app", Some(dir.path().to_path_buf())).unwrap();
    assert_eq!(reopened.last_seen(), Some(200));
}
