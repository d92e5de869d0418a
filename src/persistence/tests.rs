use super::sled_store::SledStorage;
use super::storage::{MemoryStorage, QueueStorage};
use tempfile::tempdir;

#[test]
fn test_memory_storage_contract() {
    let storage = MemoryStorage::new();
    assert_eq!(storage.get_item("queue").unwrap(), None);

    storage.set_item("queue", "[]").unwrap();
    assert_eq!(storage.get_item("queue").unwrap().as_deref(), Some("[]"));

    storage.remove_item("queue").unwrap();
    assert_eq!(storage.get_item("queue").unwrap(), None);
    assert!(storage.is_empty());
}

#[test]
fn test_memory_storage_clones_share_state() {
    let storage = MemoryStorage::new();
    let view = storage.clone();
    storage.set_item("k", "v").unwrap();
    assert_eq!(view.get_item("k").unwrap().as_deref(), Some("v"));
    assert_eq!(view.len(), 1);
}

#[test]
fn test_sled_storage_contract() {
    let dir = tempdir().unwrap();
    let storage = SledStorage::open(dir.path().to_str().unwrap()).unwrap();

    assert_eq!(storage.get_item("queue").unwrap(), None);
    storage.set_item("queue", r#"[{"id":"a"}]"#).unwrap();
    assert_eq!(
        storage.get_item("queue").unwrap().as_deref(),
        Some(r#"[{"id":"a"}]"#)
    );
    storage.set_item("queue", "[]").unwrap();
    assert_eq!(storage.get_item("queue").unwrap().as_deref(), Some("[]"));
    assert_eq!(storage.len(), 1);

    storage.remove_item("queue").unwrap();
    assert!(storage.is_empty());
}
