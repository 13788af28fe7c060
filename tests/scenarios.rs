//! End-to-end integration tests against the public `Engine` API, one per
//! literal scenario named in the spec's testable-properties section.
//! Each test opens its own in-memory engine so scenarios never interact.

use contextd::model::RelationshipType;
use contextd::relationships::Direction;
use contextd::repository::{QueryOptions, SaveInput};
use contextd::session::NewSession;
use contextd::watcher::WatcherFilter;
use contextd::Engine;
use std::time::Duration;

fn save(engine: &Engine, session_id: &str, key: &str, value: &str, private: bool) {
    engine
        .items()
        .save(
            session_id,
            "general",
            SaveInput {
                key: key.to_string(),
                value: value.to_string(),
                is_private: Some(private),
                ..Default::default()
            },
        )
        .unwrap();
}

#[test]
fn scenario_a_privacy() {
    let engine = Engine::open_memory("actor").unwrap();
    let s1 = engine.sessions().create(NewSession::default()).unwrap().id;
    let s2 = engine.sessions().create(NewSession::default()).unwrap().id;

    save(&engine, &s1, "p", "v1", false);
    save(&engine, &s1, "s", "secret", true);

    let from_s2 = engine
        .items()
        .query(QueryOptions { viewer_session_id: s2.clone(), ..Default::default() })
        .unwrap();
    let keys_s2: Vec<_> = from_s2.items.iter().map(|i| i.key.as_str()).collect();
    assert_eq!(keys_s2, vec!["p"]);

    let from_s1 = engine
        .items()
        .query(QueryOptions { viewer_session_id: s1.clone(), ..Default::default() })
        .unwrap();
    let mut keys_s1: Vec<_> = from_s1.items.iter().map(|i| i.key.as_str()).collect();
    keys_s1.sort_unstable();
    assert_eq!(keys_s1, vec!["p", "s"]);
}

#[test]
fn scenario_b_filtered_search() {
    let engine = Engine::open_memory("actor").unwrap();
    let s = engine.sessions().create(NewSession::default()).unwrap().id;

    engine.items().save(&s, "general", SaveInput {
        key: "auth_high_task".to_string(), value: "auth work".to_string(),
        category: Some("task".to_string()), priority: Some("high".to_string()),
        channel: Some("feature-auth".to_string()), ..Default::default()
    }).unwrap();
    engine.items().save(&s, "general", SaveInput {
        key: "auth_normal_task".to_string(), value: "auth work too".to_string(),
        category: Some("task".to_string()), priority: Some("normal".to_string()),
        channel: Some("feature-auth".to_string()), ..Default::default()
    }).unwrap();
    engine.items().save(&s, "general", SaveInput {
        key: "auth_config_high".to_string(), value: "auth config".to_string(),
        category: Some("note".to_string()), priority: Some("high".to_string()),
        channel: Some("main-config".to_string()), ..Default::default()
    }).unwrap();

    let result = engine.items().query(QueryOptions {
        query: Some("auth".to_string()),
        viewer_session_id: s,
        category: Some("task".to_string()),
        priorities: Some(vec!["high".to_string()]),
        ..Default::default()
    }).unwrap();

    let keys: Vec<_> = result.items.iter().map(|i| i.key.as_str()).collect();
    assert_eq!(keys, vec!["auth_high_task"]);
}

#[test]
fn scenario_c_pagination_defaults() {
    let engine = Engine::open_memory("actor").unwrap();
    let s = engine.sessions().create(NewSession::default()).unwrap().id;

    for i in 0..150 {
        save(&engine, &s, &format!("item_{i:03}"), "v", false);
    }

    let result = engine.items().query(QueryOptions { viewer_session_id: s, ..Default::default() }).unwrap();
    assert_eq!(result.items.len(), 100);
    assert_eq!(result.total_count, 150);
    assert!(result.pagination.defaults_applied.limit);
    assert!(result.pagination.defaults_applied.sort);
    for pair in result.items.windows(2) {
        assert!(pair[0].created_at >= pair[1].created_at);
    }
}

#[test]
fn scenario_d_batch_with_mix() {
    let engine = Engine::open_memory("actor").unwrap();
    let s = engine.sessions().create(NewSession::default()).unwrap().id;

    let outcomes = engine.items().batch_save(&s, "general", vec![
        SaveInput { key: "valid_key_1".to_string(), value: "a".to_string(), ..Default::default() },
        SaveInput { key: String::new(), value: "b".to_string(), ..Default::default() },
        SaveInput { key: "valid_key_2".to_string(), value: "c".to_string(), ..Default::default() },
        SaveInput { key: "bad|key".to_string(), value: "d".to_string(), ..Default::default() },
        SaveInput { key: "valid_key_3".to_string(), value: "e".to_string(), ..Default::default() },
    ]).unwrap();

    let succeeded = outcomes.iter().filter(|o| o.success).count();
    let failed = outcomes.iter().filter(|o| !o.success).count();
    assert_eq!(succeeded, 3);
    assert_eq!(failed, 2);

    let empty_key_error = outcomes[1].error.as_ref().unwrap();
    assert!(empty_key_error.contains("empty"));
    let bad_key_error = outcomes[3].error.as_ref().unwrap();
    assert!(bad_key_error.contains("special characters"));
}

#[test]
fn scenario_e_relationship_depth() {
    let engine = Engine::open_memory("actor").unwrap();
    let s = engine.sessions().create(NewSession::default()).unwrap().id;

    for key in ["a", "b", "c", "d"] {
        save(&engine, &s, key, "v", false);
    }
    engine.links().link(&s, "a", "b", RelationshipType::DependsOn, None).unwrap();
    engine.links().link(&s, "b", "c", RelationshipType::DependsOn, None).unwrap();
    engine.links().link(&s, "c", "d", RelationshipType::DependsOn, None).unwrap();

    let related = engine.links().get_related(&s, "a", 2, Direction::Outgoing).unwrap();
    let keys: Vec<_> = related.iter().map(|r| r.key.as_str()).collect();
    assert!(keys.contains(&"b"));
    assert!(keys.contains(&"c"));
    assert!(!keys.contains(&"d"));

    let depth_of = |key: &str| related.iter().find(|r| r.key == key).unwrap().depth;
    assert_eq!(depth_of("b"), 1);
    assert_eq!(depth_of("c"), 2);
}

#[test]
fn scenario_f_watcher() {
    let engine = Engine::open_memory("actor").unwrap();
    let s = engine.sessions().create(NewSession::default()).unwrap().id;

    let watcher_id = engine.watchers().create(
        WatcherFilter { channels: Some(vec!["feature-x".to_string()]), ..Default::default() },
        0,
    );

    engine.items().save(&s, "general", SaveInput {
        key: "x".to_string(), value: "v".to_string(), channel: Some("feature-x".to_string()), ..Default::default()
    }).unwrap();
    engine.items().save(&s, "general", SaveInput {
        key: "y".to_string(), value: "v".to_string(), channel: Some("main".to_string()), ..Default::default()
    }).unwrap();

    let changes = engine.watchers().poll(&watcher_id, Duration::from_millis(200)).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].key.as_deref(), Some("x"));

    let first_seq = changes[0].seq;
    engine.items().save(&s, "general", SaveInput {
        key: "z".to_string(), value: "v".to_string(), channel: Some("feature-x".to_string()), ..Default::default()
    }).unwrap();
    let more = engine.watchers().poll(&watcher_id, Duration::from_millis(200)).unwrap();
    assert_eq!(more.len(), 1);
    assert_eq!(more[0].key.as_deref(), Some("z"));
    assert!(more[0].seq > first_seq);
}
