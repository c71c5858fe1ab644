//! Property tests for spec §8 invariants 1 and 3: version monotonicity
//! across successive events on one entity, and event-sourcing determinism
//! (replaying the full log against empty state reproduces `modified`).

use std::sync::Arc;

use proptest::prelude::*;
use registry_core::FormSubmission;
use registry_engine::{ApplierRegistry, PipelineConfig, Registry};
use registry_persist::MemoryBackend;
use serde_json::json;

fn arb_ages(max_len: usize) -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(0i64..120, 1..=max_len)
}

async fn replay_ages(ages: &[i64]) -> (u64, serde_json::Value) {
    let registry = Registry::new("tenant-1", Arc::new(MemoryBackend::new())).await.unwrap();
    registry
        .submit(FormSubmission::new(
            "e0",
            "g1",
            "create-individual",
            json!({"age": ages[0]}),
            "user-1",
        ))
        .await
        .unwrap();

    let mut last_version = 1;
    for (i, age) in ages.iter().enumerate().skip(1) {
        let updated = registry
            .submit(FormSubmission::new(
                format!("e{i}"),
                "g1",
                "update-individual",
                json!({"age": age}),
                "user-1",
            ))
            .await
            .unwrap()
            .unwrap();
        assert!(updated.version > last_version);
        last_version = updated.version;
    }

    let pair = registry.get("g1").await.unwrap().unwrap();
    (pair.modified.version, pair.modified.data)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn version_strictly_increases_per_event(ages in arb_ages(12)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (final_version, _) = rt.block_on(replay_ages(&ages));
        prop_assert_eq!(final_version, ages.len() as u64);
    }

    #[test]
    fn replaying_the_log_reproduces_current_state(ages in arb_ages(12)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (version_a, data_a) = rt.block_on(replay_ages(&ages));
        let (version_b, data_b) = rt.block_on(replay_ages(&ages));
        prop_assert_eq!(version_a, version_b);
        prop_assert_eq!(data_a, data_b);
    }
}

#[tokio::test]
async fn registry_with_appliers_accepts_custom_registration() {
    use async_trait::async_trait;
    use registry_core::{EngineResult, EntitySnapshot};
    use registry_engine::{Applier, ApplierContext, ApplierOutput, StateOp};
    use registry_persist::StorageBackend;

    struct NoteApplier;

    #[async_trait]
    impl<B: StorageBackend + ?Sized> Applier<B> for NoteApplier {
        async fn apply(
            &self,
            _ctx: &ApplierContext<'_, B>,
            event: &FormSubmission,
            _existing: Option<&registry_core::EntityPair>,
        ) -> EngineResult<ApplierOutput> {
            let snapshot = EntitySnapshot::new_individual(event.entity_guid.clone(), event.entity_guid.clone(), event.payload.clone());
            Ok(ApplierOutput::new(snapshot.clone(), vec![StateOp::Save(snapshot)]))
        }
    }

    let mut appliers = ApplierRegistry::with_builtins();
    appliers.register("create-note", NoteApplier);

    let registry = Registry::with_appliers(
        "tenant-1",
        Arc::new(MemoryBackend::new()),
        Arc::new(appliers),
        PipelineConfig::default(),
    )
    .await
    .unwrap();

    let entity = registry
        .submit(FormSubmission::new("e1", "n1", "create-note", json!({"text": "hi"}), "user-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entity.data["text"], json!("hi"));
}
