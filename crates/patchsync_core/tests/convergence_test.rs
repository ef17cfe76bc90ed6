//! Engine convergence: replays, reordering and path handling.

use patchsync_core::{
    ConflictStrategy, EngineConfig, EntityKey, Patch, PatchBatch, PatchEngine, PatchOperation,
    PatchSource, PatchSyncError, PathPolicy,
};
use serde_json::{Value, json};

fn engine_with(key: &EntityKey, state: Value) -> PatchEngine {
    let mut engine = PatchEngine::new(EngineConfig::default());
    engine
        .register_entity(key.clone(), state, ConflictStrategy::default())
        .unwrap();
    engine
}

fn batch(key: &EntityKey, patches: Vec<Patch>) -> PatchBatch {
    PatchBatch::new(key, patches, PatchSource::Remote)
}

fn permutations(items: &[Patch]) -> Vec<Vec<Patch>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let head = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, head.clone());
            out.push(tail);
        }
    }
    out
}

#[test]
fn test_replaying_a_batch_is_a_no_op() {
    let key = EntityKey::new("board", "g1");
    let mut engine = engine_with(&key, json!({}));
    let b = batch(
        &key,
        vec![
            Patch::set("turn", 1).with_change_number(1),
            Patch::insert_list("log", "placed", None).with_change_number(2),
        ],
    );

    let first = engine.apply_batch(&b).unwrap();
    let after_first = engine.state(&key).cloned().unwrap();
    let second = engine.apply_batch(&b).unwrap();

    assert_eq!(first.applied(), 2);
    assert_eq!(second.applied(), 0);
    assert_eq!(second.skipped(), 2);
    assert_eq!(engine.state(&key).unwrap(), &after_first);
    assert_eq!(engine.last_change_number(&key), Some(2));
}

#[test]
fn test_duplicate_patch_within_one_batch_applies_once() {
    let key = EntityKey::new("board", "g1");
    let mut engine = engine_with(&key, json!({}));
    let append = Patch::insert_list("log", "x", None).with_change_number(1);

    let report = engine
        .apply_batch(&batch(&key, vec![append.clone(), append]))
        .unwrap();

    assert_eq!(report.applied(), 1);
    assert_eq!(engine.state(&key).unwrap()["log"], json!(["x"]));
}

#[test]
fn test_delivery_order_within_a_call_does_not_matter() {
    let key = EntityKey::new("board", "g1");
    let patches = vec![
        Patch::set("cells", json!([null, null, null])).with_change_number(1),
        Patch::set("cells[1]", "P1").with_change_number(2),
        Patch::move_list("cells", 1, 0).with_change_number(3),
    ];

    let mut states = Vec::new();
    for order in permutations(&patches) {
        let mut engine = engine_with(&key, json!({}));
        engine.apply_batch(&batch(&key, order)).unwrap();
        assert_eq!(engine.last_change_number(&key), Some(3));
        states.push(engine.state(&key).cloned().unwrap());
    }

    assert_eq!(states.len(), 6);
    assert!(states.iter().all(|s| *s == json!({"cells": ["P1", null, null]})));
}

#[test]
fn test_timestamp_strategy_orders_by_timestamp() {
    let key = EntityKey::new("board", "g1");
    let mut engine = PatchEngine::new(EngineConfig::default());
    engine
        .register_entity(key.clone(), json!({}), ConflictStrategy::TimestampBased)
        .unwrap();

    engine
        .apply_batch(&batch(
            &key,
            vec![
                Patch::set("winner", "late").with_change_number(1).with_timestamp(200),
                Patch::set("winner", "early").with_change_number(2).with_timestamp(100),
            ],
        ))
        .unwrap();

    assert_eq!(engine.state(&key).unwrap()["winner"], "late");
}

#[test]
fn test_stale_patches_are_rejected() {
    let key = EntityKey::new("board", "g1");
    let mut engine = engine_with(&key, json!({}));
    engine
        .apply_batch(&batch(&key, vec![Patch::set("turn", 5).with_change_number(5)]))
        .unwrap();

    let report = engine
        .apply_batch(&batch(
            &key,
            vec![
                Patch::set("turn", 3).with_change_number(3),
                Patch::set("turn", 5).with_change_number(5),
                Patch::set("phase", "end").with_change_number(6),
            ],
        ))
        .unwrap();

    assert_eq!(report.skipped(), 2);
    assert_eq!(report.applied(), 1);
    assert_eq!(engine.state(&key).unwrap(), &json!({"turn": 5, "phase": "end"}));
    assert_eq!(engine.last_change_number(&key), Some(6));
}

#[test]
fn test_failed_patch_still_advances_watermark() {
    let key = EntityKey::new("board", "g1");
    let mut engine = engine_with(&key, json!({"log": []}));

    let report = engine
        .apply_batch(&batch(
            &key,
            vec![
                Patch::new(PatchOperation::RemoveList, "log").with_change_number(1),
                Patch::set("ok", true).with_change_number(2),
            ],
        ))
        .unwrap();

    assert_eq!(report.failed(), 1);
    assert_eq!(report.applied(), 1);
    assert_eq!(engine.last_change_number(&key), Some(2));
}

#[test]
fn test_path_creation_heuristic() {
    let key = EntityKey::new("doc", "1");
    let mut engine = engine_with(&key, json!({}));
    engine
        .apply_batch(&batch(&key, vec![Patch::set("a.b[0].c", 1).with_change_number(1)]))
        .unwrap();

    assert_eq!(engine.state(&key).unwrap(), &json!({"a": {"b": [{"c": 1}]}}));
}

#[test]
fn test_list_semantics() {
    let key = EntityKey::new("doc", "1");
    let mut engine = engine_with(&key, json!({"xs": ["a", "b", "c"]}));

    let steps: Vec<(Patch, Value)> = vec![
        (Patch::insert_list("xs", "z", Some(1)), json!(["a", "z", "b", "c"])),
        (Patch::insert_list("xs", "end", None), json!(["a", "z", "b", "c", "end"])),
        (Patch::remove_list("xs", 0), json!(["z", "b", "c", "end"])),
        (Patch::move_list("xs", 3, 1), json!(["z", "end", "b", "c"])),
        (Patch::clear_list("xs"), json!([])),
    ];

    for (cn, (patch, expected)) in steps.into_iter().enumerate() {
        let patch = patch.with_change_number(cn as u64 + 1);
        engine.apply_batch(&batch(&key, vec![patch])).unwrap();
        assert_eq!(engine.state(&key).unwrap()["xs"], expected);
    }
}

#[test]
fn test_strict_policy_rejects_container_mismatch() {
    let key = EntityKey::new("doc", "1");
    let mut engine = PatchEngine::new(EngineConfig {
        path_policy: PathPolicy::Strict,
        ..EngineConfig::default()
    });
    engine
        .register_entity(key.clone(), json!({"a": 5}), ConflictStrategy::default())
        .unwrap();

    let report = engine
        .apply_batch(&batch(&key, vec![Patch::set("a.b", 1).with_change_number(1)]))
        .unwrap();

    assert_eq!(report.failed(), 1);
    assert_eq!(engine.state(&key).unwrap(), &json!({"a": 5}));
}

#[test]
fn test_unknown_entity_fails_before_applying_anything() {
    let key = EntityKey::new("doc", "1");
    let mut engine = engine_with(&key, json!({}));

    let err = engine
        .apply_batches(&[
            batch(&key, vec![Patch::set("x", 1).with_change_number(1)]),
            batch(
                &EntityKey::new("doc", "missing"),
                vec![Patch::set("x", 1).with_change_number(1)],
            ),
        ])
        .unwrap_err();

    assert!(matches!(err, PatchSyncError::UnknownEntity(_)));
    assert_eq!(engine.state(&key).unwrap(), &json!({}));
    assert_eq!(engine.last_change_number(&key), Some(0));
}
