//! Integration tests for nested enumerators and their composite cursors.

use async_trait::async_trait;
use iteration_core::config::IterationConfig;
use iteration_core::cursor::Cursor;
use iteration_core::enumerator::{
    collect, level, ArrayEnumerator, BoxEnumerator, Enumerator, EnumeratorBuilder, LevelBuilder,
    NestedEnumerator,
};
use iteration_core::error::{ErrorCode, Result};
use iteration_core::jobs::{
    IterationContext, IterationJob, IterationRunner, JobId, JobPayload, StepOutcome, StepResult,
};
use iteration_core::throttle::ThrottleRegistry;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Fixtures
// ============================================================================

/// Three outer items with 3, 1 and 2 children.
fn two_levels() -> Vec<LevelBuilder<String>> {
    vec![
        level(|_: &[String], cursor| {
            ArrayEnumerator::new(vec!["a".to_string(), "b".to_string(), "c".to_string()], cursor)
        }),
        level(|parents: &[String], cursor| {
            let outer = &parents[0];
            let count = match outer.as_str() {
                "a" => 3,
                "b" => 1,
                _ => 2,
            };
            ArrayEnumerator::new((0..count).map(|k| format!("{}{}", outer, k)).collect(), cursor)
        }),
    ]
}

/// Two regions, each with two stores, each with a few orders.
fn three_levels() -> Vec<LevelBuilder<String>> {
    vec![
        level(|_: &[String], cursor| ArrayEnumerator::new(vec!["eu".to_string(), "us".to_string()], cursor)),
        level(|parents: &[String], cursor| {
            ArrayEnumerator::new(vec![format!("{}-1", parents[0]), format!("{}-2", parents[0])], cursor)
        }),
        level(|parents: &[String], cursor| {
            let store = &parents[1];
            let count = if store.ends_with('1') { 2 } else { 1 };
            ArrayEnumerator::new((0..count).map(|k| format!("{}/o{}", store, k)).collect(), cursor)
        }),
    ]
}

const ALL_LEAVES: [&str; 6] = ["a0", "a1", "a2", "b0", "c0", "c1"];

// ============================================================================
// Direct Enumeration
// ============================================================================

#[tokio::test]
async fn test_resume_after_every_leaf_matches_full_walk() {
    let mut full = NestedEnumerator::new(three_levels(), None).unwrap();
    let expected: Vec<String> = collect(&mut full).await.unwrap().into_iter().map(|(leaf, _)| leaf).collect();
    assert_eq!(
        expected,
        vec!["eu-1/o0", "eu-1/o1", "eu-2/o0", "us-1/o0", "us-1/o1", "us-2/o0"]
    );

    let mut resumed = Vec::new();
    let mut cursor = None;
    loop {
        let mut nested = NestedEnumerator::new(three_levels(), cursor.clone()).unwrap();
        match nested.next().await.unwrap() {
            Some((leaf, next)) => {
                resumed.push(leaf);
                cursor = Some(next);
            }
            None => break,
        }
    }
    assert_eq!(resumed, expected);
}

#[tokio::test]
async fn test_interrupt_after_second_leaf_continues_current_outer_item() {
    let mut first = NestedEnumerator::new(two_levels(), None).unwrap();
    first.next().await.unwrap();
    let (second, cursor) = first.next().await.unwrap().unwrap();
    assert_eq!(second, "a1");
    assert_eq!(cursor.encode(), json!([null, 1]));

    let mut resumed = NestedEnumerator::new(two_levels(), Some(cursor)).unwrap();
    let rest: Vec<String> = collect(&mut resumed).await.unwrap().into_iter().map(|(leaf, _)| leaf).collect();
    assert_eq!(rest, vec!["a2", "b0", "c0", "c1"]);
}

#[tokio::test]
async fn test_outer_slot_holds_last_consumed_item() {
    let mut nested = NestedEnumerator::new(two_levels(), None).unwrap();
    let cursors: Vec<_> = collect(&mut nested)
        .await
        .unwrap()
        .into_iter()
        .map(|(_, cursor)| cursor.encode())
        .collect();
    assert_eq!(
        cursors,
        vec![
            json!([null, 0]),
            json!([null, 1]),
            json!([null, 2]),
            json!([0, 0]),
            json!([1, 0]),
            json!([1, 1]),
        ]
    );
}

#[test]
fn test_composite_cursor_arity_is_validated() {
    let error = NestedEnumerator::new(three_levels(), Some(Cursor::decode(&json!([0, 1])).unwrap()))
        .err()
        .unwrap();
    assert_eq!(error.code(), ErrorCode::CursorArityMismatch);

    let error = EnumeratorBuilder::new().nested::<String>(Vec::new(), None).err().unwrap();
    assert_eq!(error.code(), ErrorCode::InvalidNestedLevel);
}

// ============================================================================
// Through the Execution Loop
// ============================================================================

#[derive(Default)]
struct StoreWalk {
    processed: Mutex<Vec<String>>,
}

#[async_trait]
impl IterationJob for StoreWalk {
    type Item = String;

    fn name(&self) -> &'static str {
        "store_walk"
    }

    async fn build_enumerator(
        &self,
        _ctx: &IterationContext<'_>,
        cursor: Option<Cursor>,
    ) -> Result<Option<BoxEnumerator<String>>> {
        EnumeratorBuilder::new().nested(two_levels(), cursor).map(Some)
    }

    async fn each_iteration(&self, leaf: String, _ctx: &IterationContext<'_>) -> StepResult {
        self.processed.lock().push(leaf);
        Ok(StepOutcome::Continue)
    }

    fn throttle_conditions(&self) -> ThrottleRegistry {
        ThrottleRegistry::new().throttle_on("every_two_leaves", Duration::ZERO, |state| {
            state.iterations_this_run >= 2
        })
    }
}

#[tokio::test]
async fn test_interrupted_nested_job_processes_each_leaf_once() {
    let runner = IterationRunner::new(StoreWalk::default(), Arc::new(IterationConfig::default())).unwrap();
    let id = JobId::new();

    let mut payload = JobPayload::new(vec![json!("tenant-1")]);
    let mut cursors = Vec::new();
    let mut invocations = 0;
    loop {
        invocations += 1;
        let outcome = runner.perform(id, payload).await.unwrap();
        match outcome.reenqueue {
            Some(continuation) => {
                assert_eq!(continuation.reason, "every_two_leaves");
                cursors.push(outcome.execution.cursor_position.clone().unwrap().encode());
                payload = continuation.payload;
            }
            None => {
                assert!(outcome.is_completed());
                break;
            }
        }
    }

    // The third run ends on the last leaf and still checkpoints.
    assert_eq!(invocations, 4);
    assert_eq!(cursors, vec![json!([null, 1]), json!([0, 0]), json!([1, 1])]);
    assert_eq!(*runner.job().processed.lock(), ALL_LEAVES.to_vec());
}
