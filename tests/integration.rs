//! Integration tests for docflow
//!
//! Full flows from logic output through consolidation, writes and view
//! materialization, against the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use docflow::dispatch::patch::{patch_fn, PatchConfig};
use docflow::dispatch::{logic_fn, ACTION_TYPE_FIELD};
use docflow::storage::document::{Fields, Value};
use docflow::storage::memory::MemoryStore;
use docflow::{
    Action, ActionType, DocumentStore, Engine, EngineConfig, IntentAction, Instruction, LogicConfig, LogicResult,
    SchemaRegistry, Version, WriteIntent,
};

const FRIENDS: &str = r#"
entities: [user, friend]
structure:
  users:
    user:
      friends:
        friend: ["View:user:name,email"]
"#;

const SERVERS: &str = r#"
entities: [user, server, member]
structure:
  users:
    user:
  servers:
    server:
      members:
        member: ["View:user:name:syncCreate=true"]
"#;

/// Helper to build an engine over a fresh store
fn setup(schema: &str, config: EngineConfig) -> (MemoryStore, Engine) {
    let store = MemoryStore::new();
    let schema = SchemaRegistry::from_yaml_str(schema).expect("schema should compile");
    let engine = Engine::builder(schema, Arc::new(store.clone()))
        .config(config)
        .build()
        .expect("engine should build");
    (store, engine)
}

fn fields(pairs: &[(&str, &str)]) -> Fields {
    pairs.iter().map(|(k, v)| (k.to_string(), Value::from(*v))).collect()
}

fn page(intents: Vec<WriteIntent>) -> Vec<LogicResult> {
    vec![LogicResult::finished("test", intents)]
}

async fn field(store: &MemoryStore, path: &str, key: &str) -> Option<Value> {
    store.get(path).await.unwrap().and_then(|d| d.get(key).cloned())
}

// =============================================================================
// Schema Tests
// =============================================================================

#[test]
fn test_friends_schema_compiles() {
    let schema = SchemaRegistry::from_yaml_str(FRIENDS).unwrap();

    assert_eq!(schema.doc_path("user"), Some("users/{userId}"));
    assert_eq!(schema.doc_path("friend"), Some("users/{userId}/friends/{friendId}"));
    assert_eq!(schema.entity_of("users/u1/friends/u2"), Some("friend"));

    let views = schema.view_definitions();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].src_entity, "user");
    assert_eq!(views[0].src_props, vec!["name", "email"]);
    assert_eq!(views[0].dest_entity, "friend");
    assert_eq!(views[0].version, Version::ZERO);
}

// =============================================================================
// Consolidation Tests
// =============================================================================

#[tokio::test]
async fn test_consolidation_merges_and_reports_conflict() {
    let (_store, engine) = setup(FRIENDS, EngineConfig::default());

    let results = vec![
        LogicResult::finished(
            "a",
            vec![WriteIntent::merge("p", fields(&[])).field("a", 1i64).instruction("b", Instruction::Increment(1))],
        ),
        LogicResult::finished(
            "b",
            vec![WriteIntent::merge("p", fields(&[])).field("c", 2i64).instruction("b", Instruction::Increment(-1))],
        ),
    ];
    let writes = engine.consolidate(&results).await.unwrap();

    let survivor = &writes.writes["p"];
    assert_eq!(survivor.action, IntentAction::Merge);
    let doc = survivor.doc.as_ref().unwrap();
    assert_eq!(doc["a"], Value::Int(1));
    assert_eq!(doc["c"], Value::Int(2));
    assert_eq!(survivor.instructions["b"], Instruction::Increment(-1));
    assert_eq!(writes.conflicts.len(), 1);
}

#[tokio::test]
async fn test_recursive_delete_honors_skipped_entities() {
    let (store, engine) = setup(FRIENDS, EngineConfig::default());
    store.put("users/u1", fields(&[("name", "Ada")])).await.unwrap();
    store.put("users/u1/friends/f1", Fields::new()).await.unwrap();
    store.put("users/u1/friends/f2", Fields::new()).await.unwrap();
    store.put("users/u2", Fields::new()).await.unwrap();

    engine
        .distribute(&page(vec![WriteIntent::recursive_delete("users/u1").skip_entity("friend")]))
        .await
        .unwrap();
    assert_eq!(
        store.paths().unwrap(),
        vec!["users/u1/friends/f1", "users/u1/friends/f2", "users/u2"]
    );

    engine
        .distribute(&page(vec![WriteIntent::recursive_delete("users/u1/friends/f1")]))
        .await
        .unwrap();
    assert_eq!(store.paths().unwrap(), vec!["users/u1/friends/f2", "users/u2"]);
}

// =============================================================================
// View Materialization Tests
// =============================================================================

#[tokio::test]
async fn test_view_round_trip() {
    let (store, engine) = setup(FRIENDS, EngineConfig::default());

    engine
        .distribute(&page(vec![WriteIntent::create(
            "users/u1",
            fields(&[("name", "Ada"), ("email", "ada@x")]),
        )]))
        .await
        .unwrap();
    engine
        .distribute(&page(vec![WriteIntent::create("users/u2/friends/u1", Fields::new())]))
        .await
        .unwrap();

    assert_eq!(field(&store, "users/u2/friends/u1", "name").await, Some(Value::from("Ada")));
    let link = "users/u1/@views/users+u2+friends+u1";
    assert!(store.exists(link).await.unwrap());

    let report = engine
        .distribute(&page(vec![WriteIntent::delete("users/u1")]))
        .await
        .unwrap();

    let deletes: Vec<&str> = report
        .view_results
        .iter()
        .flat_map(|r| r.documents.iter())
        .filter(|d| d.action == IntentAction::Delete)
        .map(|d| d.dst_path.as_str())
        .collect();
    assert_eq!(deletes, vec!["users/u2/friends/u1", link]);
    assert!(store.paths().unwrap().is_empty());
}

#[tokio::test]
async fn test_sync_create_provisions_views_for_new_sources() {
    let (store, engine) = setup(SERVERS, EngineConfig::default());

    engine
        .distribute(&page(vec![
            WriteIntent::create("users/u1", fields(&[("name", "Ada")])),
            WriteIntent::create("servers/s1", Fields::new()),
            WriteIntent::create("servers/s1/members/u1", Fields::new()),
        ]))
        .await
        .unwrap();

    assert_eq!(field(&store, "servers/s1/members/u1", "name").await, Some(Value::from("Ada")));
    assert!(store.exists("@syncCreateViews/servers+s1").await.unwrap());

    engine
        .distribute(&page(vec![WriteIntent::create("users/u2", fields(&[("name", "Bob")]))]))
        .await
        .unwrap();

    assert_eq!(field(&store, "servers/s1/members/u2", "name").await, Some(Value::from("Bob")));
    assert!(store.exists("users/u2/@views/servers+s1+members+u2").await.unwrap());
    let registrations = store
        .paths()
        .unwrap()
        .into_iter()
        .filter(|p| p.starts_with("@syncCreateViews/"))
        .count();
    assert_eq!(registrations, 1);
}

#[tokio::test]
async fn test_paged_views_continue_until_done() {
    let config = EngineConfig {
        view_page_size: 1,
        ..EngineConfig::default()
    };
    let (store, engine) = setup(FRIENDS, config);

    engine
        .distribute(&page(vec![WriteIntent::create("users/u1", fields(&[("name", "Ada")]))]))
        .await
        .unwrap();
    engine
        .distribute(&page(vec![
            WriteIntent::create("users/a/friends/u1", Fields::new()),
            WriteIntent::create("users/b/friends/u1", Fields::new()),
            WriteIntent::create("users/c/friends/u1", Fields::new()),
        ]))
        .await
        .unwrap();

    engine
        .distribute(&page(vec![WriteIntent::merge("users/u1", fields(&[("name", "Grace")]))]))
        .await
        .unwrap();

    for friend in ["users/a/friends/u1", "users/b/friends/u1", "users/c/friends/u1"] {
        assert_eq!(field(&store, friend, "name").await, Some(Value::from("Grace")), "{}", friend);
    }
}

#[tokio::test]
async fn test_long_view_lists_outlast_the_depth_limit() {
    let config = EngineConfig {
        view_page_size: 2,
        max_view_depth: 4,
        ..EngineConfig::default()
    };
    let (store, engine) = setup(FRIENDS, config);

    engine
        .distribute(&page(vec![WriteIntent::create("users/u1", fields(&[("name", "Ada")]))]))
        .await
        .unwrap();
    let friends: Vec<String> = (0..40).map(|i| format!("users/f{:02}/friends/u1", i)).collect();
    engine
        .distribute(&page(
            friends.iter().map(|f| WriteIntent::create(f.clone(), Fields::new())).collect(),
        ))
        .await
        .unwrap();

    engine
        .distribute(&page(vec![WriteIntent::merge("users/u1", fields(&[("name", "Grace")]))]))
        .await
        .unwrap();

    let mut stale = 0;
    for friend in &friends {
        if field(&store, friend, "name").await != Some(Value::from("Grace")) {
            stale += 1;
        }
    }
    assert_eq!(stale, 0);
}

// =============================================================================
// Dispatch Tests
// =============================================================================

#[tokio::test]
async fn test_business_logic_drives_views() {
    let store = MemoryStore::new();
    let schema = SchemaRegistry::from_yaml_str(FRIENDS).unwrap();
    let befriend = LogicConfig::new(
        "befriend",
        logic_fn(|action, _, _| {
            let friend = action.document.get("friend").and_then(Value::as_str).unwrap_or_default();
            let dest = format!("{}/friends/{}", action.path, friend);
            Ok(LogicResult::finished("befriend", vec![WriteIntent::create(dest, Fields::new())]))
        }),
    )
    .action_types([ActionType::Update])
    .modified_fields(["friend"]);
    let engine = Engine::builder(schema, Arc::new(store.clone()))
        .logic(befriend)
        .build()
        .unwrap();
    store.put("users/u1", fields(&[("name", "Ada")])).await.unwrap();
    store.put("users/u2", Fields::new()).await.unwrap();

    let action =
        Action::new("evt1", ActionType::Update, "user", "users/u2").document(fields(&[("friend", "u1")]));
    let results = engine.dispatch_business_logic(&action).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(field(&store, "users/u2/friends/u1", "name").await, Some(Value::from("Ada")));
}

#[tokio::test]
async fn test_patches_stamp_version_and_update_views() {
    let store = MemoryStore::new();
    let schema = SchemaRegistry::from_yaml_str(FRIENDS).unwrap();
    let capitalize = PatchConfig::new(
        "capitalize",
        Version::new(1, 0, 0),
        patch_fn(|path, doc| {
            let name = doc.get("name").and_then(Value::as_str).unwrap_or_default().to_uppercase();
            Ok(LogicResult::finished("capitalize", vec![WriteIntent::merge(path, Fields::new()).field("name", name)]))
        }),
    )
    .entities(["user"]);
    let engine = Engine::builder(schema, Arc::new(store.clone()))
        .patch(capitalize)
        .build()
        .unwrap();

    engine
        .distribute(&page(vec![
            WriteIntent::create("users/u1", fields(&[("name", "ada")])),
            WriteIntent::create("users/u2/friends/u1", Fields::new()),
        ]))
        .await
        .unwrap();
    assert_eq!(field(&store, "users/u2/friends/u1", "name").await, Some(Value::from("ada")));

    // Below the patch version nothing runs
    let results = engine.dispatch_patch_logic(Version::new(0, 9, 0), "users/u1").await.unwrap();
    assert!(results.is_empty());

    engine.dispatch_patch_logic(Version::new(1, 0, 0), "users/u1").await.unwrap();
    assert_eq!(field(&store, "users/u1", "@dataVersion").await, Some(Value::from("1.0.0")));
    assert_eq!(field(&store, "users/u2/friends/u1", "name").await, Some(Value::from("ADA")));
}

#[tokio::test]
async fn test_retry_worker_redelivers_simulated_forms() {
    let config = EngineConfig {
        retry: docflow::config::RetrySettings {
            base_delay_ms: 10,
            max_attempts: 5,
            capacity: 10,
            poll_interval_ms: 5,
        },
        ..EngineConfig::default()
    };
    let store = MemoryStore::new();
    let schema = SchemaRegistry::from_yaml_str(FRIENDS).unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let flaky = LogicConfig::new(
        "flaky",
        logic_fn(move |action, _, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(LogicResult::cancel_then_retry("flaky"));
            }
            let write = WriteIntent::merge(action.path.clone(), action.document.clone());
            Ok(LogicResult::finished("flaky", vec![write]))
        }),
    )
    .action_types([ActionType::Update]);
    let trigger = LogicConfig::new(
        "trigger",
        logic_fn(|_, _, _| {
            let form = WriteIntent::simulate_submit_form("users/u9", Fields::new())
                .field(ACTION_TYPE_FIELD, "update")
                .field("name", "Queued");
            Ok(LogicResult::finished("trigger", vec![form]))
        }),
    )
    .action_types([ActionType::Create]);

    let engine = Arc::new(
        Engine::builder(schema, Arc::new(store.clone()))
            .config(config)
            .logic(flaky)
            .logic(trigger)
            .build()
            .unwrap(),
    );
    let worker = engine.clone().spawn_retry_worker();

    let action = Action::new("evt1", ActionType::Create, "user", "users/u1");
    engine.dispatch_business_logic(&action).await.unwrap();
    assert!(!store.exists("users/u9").await.unwrap());

    let mut delivered = false;
    for _ in 0..100 {
        if store.exists("users/u9").await.unwrap() {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    worker.abort();

    assert!(delivered, "retry worker never redelivered the form");
    assert_eq!(field(&store, "users/u9", "name").await, Some(Value::from("Queued")));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}
