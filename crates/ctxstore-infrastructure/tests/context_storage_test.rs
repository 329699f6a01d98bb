//! End-to-end behaviour of `ContextStorage` over the drivers that need no
//! external service.

use std::collections::BTreeMap;

use ctxstore_core::{
    Context, ContextStorage, DbDriver, FieldConfig, FieldName, ReadPolicy, StorageError, Subscript,
    WritePolicy,
};
use ctxstore_infrastructure::StorageFactory;
use ctxstore_shared::config::{FieldSettings, SubscriptSetting};
use ctxstore_shared::StorageSettings;
use serde_json::json;
use tempfile::TempDir;

async fn open(connection: String) -> ContextStorage {
    StorageFactory::new()
        .open(&StorageSettings::new(connection))
        .await
        .unwrap()
}

async fn memory() -> ContextStorage {
    open("memory://".to_string()).await
}

async fn json_file(dir: &TempDir) -> ContextStorage {
    open(format!("json://{}", dir.path().join("contexts.json").display())).await
}

#[cfg(feature = "sqlite")]
async fn sqlite(dir: &TempDir) -> ContextStorage {
    open(format!("sqlite://{}", dir.path().join("contexts.db").display())).await
}

/// Five turns built in memory, two misc keys, some framework data.
fn conversation(id: &str) -> Context {
    let mut ctx = Context::new(id);
    for turn in 0..5 {
        ctx.add_request(json!({ "text": format!("question {}", turn) }));
        ctx.add_label(json!(format!("intent_{}", turn % 2)));
        ctx.add_response(json!({ "text": format!("answer {}", turn) }));
    }
    ctx.set_misc("lang", json!("en"));
    ctx.set_misc("profile", json!({ "name": "Ada", "visits": 3 }));
    ctx.framework_data = json!({ "slots": { "city": "Oslo" } });
    ctx
}

/// The same conversation, stored one turn per read/write cycle.
async fn seed(storage: &ContextStorage, id: &str) -> Context {
    let mut last = None;
    for turn in 0..5 {
        let mut ctx = storage.read(id).await.unwrap();
        ctx.add_request(json!({ "text": format!("question {}", turn) }));
        ctx.add_label(json!(format!("intent_{}", turn % 2)));
        ctx.add_response(json!({ "text": format!("answer {}", turn) }));
        if turn == 0 {
            ctx.set_misc("lang", json!("en"));
            ctx.set_misc("profile", json!({ "name": "Ada", "visits": 3 }));
            ctx.framework_data = json!({ "slots": { "city": "Oslo" } });
        }
        let report = storage.write(&mut ctx).await.unwrap();
        assert_eq!(report.written(FieldName::Requests), 1);
        last = Some(ctx);
    }
    last.unwrap()
}

fn turn_keys(ctx: &Context, field: FieldName) -> Vec<i64> {
    ctx.field_keys(field)
        .into_iter()
        .filter_map(|k| k.as_turn())
        .collect()
}

async fn check_round_trip(storage: &ContextStorage) {
    let ctx = seed(storage, "round-trip").await;

    let loaded = storage.read("round-trip").await.unwrap();
    assert!(loaded.is_persisted());
    assert_eq!(loaded.current_turn_id, 5);
    assert_eq!(loaded.created_at, ctx.created_at);
    assert_eq!(loaded.updated_at, ctx.updated_at);
    assert_eq!(turn_keys(&loaded, FieldName::Requests), vec![2, 3, 4]);
    assert_eq!(turn_keys(&loaded, FieldName::Responses), vec![2, 3, 4]);
    assert_eq!(loaded.last_request(), Some(&json!({ "text": "question 4" })));
    assert_eq!(loaded.last_label(), Some(&json!("intent_0")));
    assert_eq!(loaded.misc, ctx.misc);
    assert_eq!(loaded.framework_data, ctx.framework_data);
}

async fn check_write_honours_subscript(storage: &ContextStorage) {
    let mut ctx = conversation("bulk");
    let report = storage.write(&mut ctx).await.unwrap();
    assert!(report.main_updated);
    assert_eq!(report.written(FieldName::Requests), 3);
    assert_eq!(report.written(FieldName::Labels), 3);
    assert_eq!(report.written(FieldName::Misc), 2);

    let everything = FieldConfig::new(FieldName::Requests)
        .with_subscript(Subscript::All)
        .unwrap();
    let loaded = storage.read_with("bulk", &[everything]).await.unwrap();
    assert_eq!(turn_keys(&loaded, FieldName::Requests), vec![2, 3, 4]);
    assert_eq!(loaded.current_turn_id, 5);
}

async fn check_unchanged_write_is_quiet(storage: &ContextStorage) {
    seed(storage, "quiet").await;

    let mut loaded = storage.read("quiet").await.unwrap();
    let report = storage.write(&mut loaded).await.unwrap();
    assert!(report.main_updated);
    assert_eq!(report.total_written(), 0);
    assert_eq!(report.deleted(FieldName::Misc), 0);

    // Same context object, written twice in a row.
    let report = storage.write(&mut loaded).await.unwrap();
    assert_eq!(report.total_written(), 0);
}

async fn check_timestamps_are_monotonic(storage: &ContextStorage) {
    let ctx = seed(storage, "clock").await;
    let created = ctx.created_at;
    let mut previous = ctx.updated_at;
    for _ in 0..3 {
        let mut loaded = storage.read("clock").await.unwrap();
        storage.write(&mut loaded).await.unwrap();
        assert!(loaded.updated_at > previous);
        assert_eq!(loaded.created_at, created);
        previous = loaded.updated_at;
    }
}

async fn check_new_turn_appends_only_itself(storage: &ContextStorage) {
    seed(storage, "append").await;

    let mut loaded = storage.read("append").await.unwrap();
    let turn = loaded.add_request(json!({ "text": "question 5" }));
    loaded.add_response(json!({ "text": "answer 5" }));
    assert_eq!(turn, 5);

    let report = storage.write(&mut loaded).await.unwrap();
    assert_eq!(report.written(FieldName::Requests), 1);
    assert_eq!(report.written(FieldName::Responses), 1);
    assert_eq!(report.written(FieldName::Labels), 0);
    assert_eq!(report.written(FieldName::Misc), 0);

    let again = storage.read("append").await.unwrap();
    assert_eq!(again.current_turn_id, 6);
    assert_eq!(turn_keys(&again, FieldName::Requests), vec![3, 4, 5]);
}

async fn check_subscript_override(storage: &ContextStorage) {
    seed(storage, "override").await;

    let everything = FieldConfig::new(FieldName::Requests)
        .with_subscript(Subscript::All)
        .unwrap();
    let full = storage.read_with("override", &[everything]).await.unwrap();
    assert_eq!(turn_keys(&full, FieldName::Requests), vec![0, 1, 2, 3, 4]);

    let first_two = FieldConfig::new(FieldName::Responses)
        .with_subscript(Subscript::from_count(-2))
        .unwrap();
    let picked = FieldConfig::new(FieldName::Misc)
        .with_subscript(Subscript::keys(["lang", "missing"]))
        .unwrap();
    let partial = storage
        .read_with("override", &[first_two, picked])
        .await
        .unwrap();
    assert_eq!(turn_keys(&partial, FieldName::Responses), vec![0, 1]);
    assert_eq!(partial.misc.len(), 1);
    assert_eq!(partial.get_misc("lang"), Some(&json!("en")));

    // The override is per call.
    let default = storage.read("override").await.unwrap();
    assert_eq!(turn_keys(&default, FieldName::Requests), vec![2, 3, 4]);
}

async fn check_misc_changes_and_removals(storage: &ContextStorage) {
    seed(storage, "misc").await;

    let mut loaded = storage.read("misc").await.unwrap();
    loaded.set_misc("lang", json!("nb"));
    loaded.misc.remove("profile");
    loaded.set_misc("theme", json!("dark"));

    let report = storage.write(&mut loaded).await.unwrap();
    assert_eq!(report.written(FieldName::Misc), 2);
    assert_eq!(report.deleted(FieldName::Misc), 1);

    let again = storage.read("misc").await.unwrap();
    assert_eq!(again.get_misc("lang"), Some(&json!("nb")));
    assert_eq!(again.get_misc("theme"), Some(&json!("dark")));
    assert_eq!(again.get_misc("profile"), None);
}

async fn check_turn_history_is_never_deleted_by_append(storage: &ContextStorage) {
    seed(storage, "history").await;

    let mut loaded = storage.read("history").await.unwrap();
    loaded.requests.clear();
    let report = storage.write(&mut loaded).await.unwrap();
    assert_eq!(report.deleted(FieldName::Requests), 0);

    let everything = FieldConfig::new(FieldName::Requests)
        .with_subscript(Subscript::All)
        .unwrap();
    let full = storage.read_with("history", &[everything]).await.unwrap();
    assert_eq!(full.requests.len(), 5);
}

async fn check_delete_and_clear(storage: &ContextStorage) {
    for id in ["gone-1", "gone-2", "gone-3"] {
        let mut ctx = conversation(id);
        storage.write(&mut ctx).await.unwrap();
    }

    storage.delete("gone-1").await.unwrap();
    storage.delete("gone-1").await.unwrap();
    assert!(!storage.contains("gone-1").await.unwrap());
    assert!(storage.contains("gone-2").await.unwrap());

    let fresh = storage.read("gone-1").await.unwrap();
    assert!(!fresh.is_persisted());
    assert!(fresh.requests.is_empty());
    assert!(fresh.misc.is_empty());
    assert_eq!(fresh.current_turn_id, 0);

    storage.clear_all().await.unwrap();
    assert!(!storage.contains("gone-2").await.unwrap());
    assert!(!storage.contains("gone-3").await.unwrap());
}

/// A user talks to the bot over three separate requests.
async fn check_dialogue_scenario(storage: &ContextStorage) {
    let mut ctx = storage.read("dialogue").await.unwrap();
    assert!(!ctx.is_persisted());
    ctx.add_request(json!("hi"));
    ctx.add_label(json!("greeting"));
    ctx.add_response(json!("hello, how can I help?"));
    ctx.set_misc("user_name", json!("Ada"));
    storage.write(&mut ctx).await.unwrap();

    let mut ctx = storage.read("dialogue").await.unwrap();
    assert_eq!(ctx.last_response(), Some(&json!("hello, how can I help?")));
    ctx.add_request(json!("weather in Oslo?"));
    ctx.add_label(json!("weather"));
    ctx.add_response(json!("sunny"));
    ctx.framework_data = json!({ "slot_city": "Oslo" });
    storage.write(&mut ctx).await.unwrap();

    let mut ctx = storage.read("dialogue").await.unwrap();
    assert_eq!(ctx.current_turn_id, 2);
    assert_eq!(ctx.get_misc("user_name"), Some(&json!("Ada")));
    assert_eq!(ctx.framework_data, json!({ "slot_city": "Oslo" }));
    assert_eq!(ctx.requests.get(&0), Some(&json!("hi")));
    assert_eq!(ctx.last_label(), Some(&json!("weather")));
    ctx.add_request(json!("thanks"));
    ctx.add_response(json!("bye"));
    storage.write(&mut ctx).await.unwrap();

    let ctx = storage.read("dialogue").await.unwrap();
    assert_eq!(ctx.current_turn_id, 3);
    assert_eq!(turn_keys(&ctx, FieldName::Requests), vec![0, 1, 2]);
    assert_eq!(turn_keys(&ctx, FieldName::Labels), vec![0, 1]);
}

/// One object written twice, then read back with only the latest turn.
async fn check_second_turn_skips_unchanged_misc(storage: &ContextStorage) {
    let mut ctx = Context::new("u1");
    ctx.requests.insert(0, json!("hi"));
    ctx.responses.insert(0, json!("hello"));
    ctx.set_misc("lang", json!("en"));
    let first = storage.write(&mut ctx).await.unwrap();
    assert_eq!(first.written(FieldName::Misc), 1);

    ctx.requests.insert(1, json!("bye"));
    ctx.responses.insert(1, json!("see ya"));
    let second = storage.write(&mut ctx).await.unwrap();
    assert_eq!(second.written(FieldName::Misc), 0);
    assert_eq!(second.written(FieldName::Requests), 1);
    assert_eq!(second.written(FieldName::Responses), 1);

    let latest = [FieldName::Requests, FieldName::Responses].map(|field| {
        FieldConfig::new(field)
            .with_subscript(Subscript::Last(1))
            .unwrap()
    });
    let loaded = storage.read_with("u1", &latest).await.unwrap();
    assert_eq!(loaded.requests, BTreeMap::from([(1, json!("bye"))]));
    assert_eq!(loaded.responses, BTreeMap::from([(1, json!("see ya"))]));
    assert_eq!(loaded.misc, BTreeMap::from([("lang".to_string(), json!("en"))]));
}

/// A context rebuilt from scratch for a stored id does not restart it.
async fn check_rebuilt_context_keeps_history(storage: &ContextStorage) {
    let mut first = Context::new("rebuilt");
    first.add_request(json!("hi"));
    first.set_misc("lang", json!("en"));
    storage.write(&mut first).await.unwrap();
    let created = first.created_at;

    let mut second = Context::new("rebuilt");
    second.add_request(json!("hi"));
    second.add_request(json!("bye"));
    second.set_misc("lang", json!("en"));
    let report = storage.write(&mut second).await.unwrap();
    assert_eq!(report.written(FieldName::Requests), 1);
    assert_eq!(report.written(FieldName::Misc), 0);
    assert_eq!(second.created_at, created);

    let stored = storage.read("rebuilt").await.unwrap();
    assert_eq!(stored.created_at, created);
    assert!(stored.updated_at > first.updated_at);
    assert_eq!(stored.current_turn_id, 2);
    assert_eq!(turn_keys(&stored, FieldName::Requests), vec![0, 1]);
}

async fn check_all(storage: &ContextStorage) {
    check_round_trip(storage).await;
    check_write_honours_subscript(storage).await;
    check_unchanged_write_is_quiet(storage).await;
    check_timestamps_are_monotonic(storage).await;
    check_new_turn_appends_only_itself(storage).await;
    check_subscript_override(storage).await;
    check_misc_changes_and_removals(storage).await;
    check_turn_history_is_never_deleted_by_append(storage).await;
    check_delete_and_clear(storage).await;
    check_dialogue_scenario(storage).await;
    check_second_turn_skips_unchanged_misc(storage).await;
    check_rebuilt_context_keeps_history(storage).await;
}

#[tokio::test]
async fn test_memory_backend() {
    check_all(&memory().await).await;
}

#[tokio::test]
async fn test_json_backend() {
    let dir = tempfile::tempdir().unwrap();
    check_all(&json_file(&dir).await).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_sqlite_backend() {
    let dir = tempfile::tempdir().unwrap();
    check_all(&sqlite(&dir).await).await;
}

#[tokio::test]
async fn test_json_backend_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = conversation("durable");
    json_file(&dir).await.write(&mut ctx).await.unwrap();

    let reopened = json_file(&dir).await;
    let loaded = reopened.read("durable").await.unwrap();
    assert_eq!(loaded.current_turn_id, 5);
    assert_eq!(loaded.misc, ctx.misc);
}

#[tokio::test]
async fn test_update_policy_rewrites_and_deletes_turns() {
    let storage = memory().await;
    seed(&storage, "rewrite").await;

    let update = FieldConfig::new(FieldName::Labels).with_write(WritePolicy::Update);
    let schema = storage.schema().clone().with_field(update).unwrap();
    let storage = ContextStorage::new(storage.driver().clone(), schema);

    let mut loaded = storage.read("rewrite").await.unwrap();
    loaded.labels.remove(&2);
    let report = storage.write(&mut loaded).await.unwrap();
    assert_eq!(report.written(FieldName::Labels), 2);
    assert_eq!(report.deleted(FieldName::Labels), 1);

    let again = storage.read("rewrite").await.unwrap();
    assert_eq!(turn_keys(&again, FieldName::Labels), vec![1, 3, 4]);
}

#[tokio::test]
async fn test_ignored_field_is_neither_read_nor_written() {
    let storage = memory().await;
    let ignored = FieldConfig::new(FieldName::Misc)
        .with_read(ReadPolicy::Ignore)
        .with_write(WritePolicy::Ignore);
    let schema = storage.schema().clone().with_field(ignored).unwrap();
    let storage = ContextStorage::new(storage.driver().clone(), schema);

    let mut ctx = conversation("ignored");
    let report = storage.write(&mut ctx).await.unwrap();
    assert_eq!(report.written(FieldName::Misc), 0);

    let loaded = storage.read("ignored").await.unwrap();
    assert!(loaded.misc.is_empty());
    assert_eq!(
        storage
            .driver()
            .load_field_keys("ignored", FieldName::Misc)
            .await
            .unwrap()
            .len(),
        0
    );
}

#[tokio::test]
async fn test_invalid_settings_fail_at_construction() {
    let settings = StorageSettings::new("memory://").with_field(
        "misc",
        FieldSettings {
            subscript: Some(SubscriptSetting::Count(2)),
            ..Default::default()
        },
    );
    let err = StorageFactory::new().open(&settings).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidConfig(_)));

    let unknown = StorageSettings::new("memory://")
        .with_field("history", FieldSettings::default());
    assert!(StorageFactory::new().open(&unknown).await.is_err());
}
