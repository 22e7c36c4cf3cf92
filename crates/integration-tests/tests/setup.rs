//! Integration tests for `/setup`.
//!
//! These drive the ChatOps service end to end against in-memory backends
//! and check both backend effects and the messages posted to the chat.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use demo_mate_bot::error::BotError;
use demo_mate_bot::provision::{ProvisionError, ProvisionStep, ResourceRef, SemanticModelRef};
use demo_mate_bot::session::Reply;
use demo_mate_core::{ConversationKey, ResourceSetId, ResourceStatus, SessionState};
use demo_mate_integration_tests::{
    AUDIENCE, MODEL_FILE, MemoryWarehouse, TestContext, cleanup, setup, setup_named, stage,
};

fn channel() -> ConversationKey {
    ConversationKey::channel("C0123456789")
}

fn model(id: &ResourceSetId) -> SemanticModelRef {
    SemanticModelRef {
        resource_set: id.clone(),
        stage: stage(),
        file: MODEL_FILE.to_string(),
    }
}

// =============================================================================
// Success
// =============================================================================

#[tokio::test]
async fn test_setup_provisions_and_reports_resource_set() {
    let ctx = TestContext::new();

    let handled = ctx.service.handle(&setup(&channel())).await;

    assert!(
        matches!(handled.reply, Reply::SetupComplete { ref resource_set, .. } if *resource_set == ResourceSetId::default()),
        "got {:?}",
        handled.reply
    );
    assert_eq!(ctx.state(&channel()), Some(SessionState::Ready));

    // Ack, one line per step, then the result naming the set
    let texts = ctx.sink.texts(&channel());
    assert_eq!(texts.len(), 5);
    assert!(texts[0].contains("Setting up `demo_db.data`"));
    assert!(texts[1].ends_with("Created schema demo_db.data"));
    assert!(texts[2].ends_with("Created stage demo_db.data.semantic_models"));
    assert!(texts[3].ends_with(
        "Created semantic model @demo_db.data.semantic_models/support_tickets_semantic_model.yaml"
    ));
    assert_eq!(texts[4], "Setup complete: demo_db.data is ready");

    let id = ResourceSetId::default();
    assert!(ctx.warehouse.contains(&ResourceRef::Namespace(id.clone())));
    assert!(ctx.warehouse.contains(&ResourceRef::StorageLocation {
        resource_set: id.clone(),
        stage: stage(),
    }));
    assert!(ctx.warehouse.contains(&ResourceRef::SemanticArtifact(model(&id))));
}

#[tokio::test]
async fn test_setup_uploads_semantic_model_for_the_set() {
    let ctx = TestContext::new();

    ctx.service
        .handle(&setup_named(&channel(), "sales", "raw"))
        .await;

    let id = ResourceSetId::parse("sales", "raw").unwrap();
    let yaml = ctx.warehouse.artifact(&model(&id)).unwrap();
    assert!(yaml.contains("support_tickets"));
    assert!(yaml.contains("sales"));
    assert!(yaml.contains("raw"));
}

#[tokio::test]
async fn test_setup_registers_key_once() {
    let ctx = TestContext::new();

    ctx.service.handle(&setup(&channel())).await;
    assert_eq!(ctx.identity.registrations(), 1);
    assert!(ctx.identity.registered_key().is_some());

    let handled = ctx.service.handle(&setup(&channel())).await;
    assert!(matches!(handled.reply, Reply::SetupComplete { .. }));
    assert_eq!(ctx.identity.registrations(), 1);
    assert_eq!(ctx.keys.generated(), 1);
}

#[tokio::test]
async fn test_repeated_setup_creates_nothing_new() {
    let ctx = TestContext::new();

    ctx.service.handle(&setup(&channel())).await;
    let creates = ctx.warehouse.creates();
    let objects = ctx.warehouse.object_count();

    let handled = ctx.service.handle(&setup(&channel())).await;

    assert!(matches!(handled.reply, Reply::SetupComplete { .. }));
    assert_eq!(ctx.warehouse.creates(), creates);
    assert_eq!(ctx.warehouse.object_count(), objects);
}

// =============================================================================
// Partial Failure
// =============================================================================

#[tokio::test]
async fn test_partial_failure_names_step_and_setup_resumes() {
    let ctx = TestContext::new();
    ctx.warehouse
        .fail_create(ProvisionStep::SemanticArtifact, "Insufficient privileges to operate on stage");

    let handled = ctx.service.handle(&setup(&channel())).await;

    let Reply::Failed {
        error:
            BotError::Provision(ProvisionError::PartialFailure {
                ref completed_steps,
                failed_step,
                ..
            }),
        ..
    } = handled.reply
    else {
        panic!("expected partial failure, got {:?}", handled.reply);
    };
    assert_eq!(failed_step, ProvisionStep::SemanticArtifact);
    assert_eq!(
        completed_steps,
        &[ProvisionStep::Namespace, ProvisionStep::StorageLocation]
    );
    assert_eq!(ctx.state(&channel()), Some(SessionState::Idle));
    assert_eq!(
        ctx.router()
            .provisioner()
            .tracked_status(&ResourceSetId::default()),
        Some(ResourceStatus::Failed)
    );

    // The steps that finished were reported before the failure
    let texts = ctx.sink.texts(&channel());
    assert_eq!(texts.len(), 4);
    assert!(texts[1].ends_with("Created schema demo_db.data"));
    assert!(texts[2].ends_with("Created stage demo_db.data.semantic_models"));

    let body = ctx.sink.bodies(&channel()).pop().unwrap();
    assert!(body.contains("Setup failed at the semantic artifact step"));
    assert!(body.contains("Insufficient privileges"));
    assert!(body.contains("namespace, storage location"));

    // Completed steps are left in place and reused
    ctx.warehouse.heal();
    let creates = ctx.warehouse.creates();
    let handled = ctx.service.handle(&setup(&channel())).await;
    assert!(matches!(handled.reply, Reply::SetupComplete { .. }));
    assert_eq!(ctx.warehouse.creates(), creates + 1);
    assert_eq!(ctx.state(&channel()), Some(SessionState::Ready));
}

#[tokio::test]
async fn test_cleanup_after_partial_failure_targets_attempted_set() {
    let ctx = TestContext::new();
    ctx.warehouse
        .fail_create(ProvisionStep::StorageLocation, "stage quota exceeded");

    ctx.service
        .handle(&setup_named(&channel(), "sales", "raw"))
        .await;
    let id = ResourceSetId::parse("sales", "raw").unwrap();
    assert!(ctx.warehouse.contains(&ResourceRef::Namespace(id.clone())));

    let handled = ctx.service.handle(&cleanup(&channel())).await;

    assert!(
        matches!(handled.reply, Reply::CleanupComplete { ref resource_set, .. } if *resource_set == id),
        "got {:?}",
        handled.reply
    );
    assert_eq!(ctx.warehouse.object_count(), 0);
}

// =============================================================================
// Restart
// =============================================================================

#[tokio::test]
async fn test_saved_key_is_reused_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let warehouse = Arc::new(MemoryWarehouse::default());

    let first = TestContext::persistent(dir.path(), Arc::clone(&warehouse));
    first.service.handle(&setup(&channel())).await;
    assert_eq!(first.identity.registrations(), 1);
    assert!(dir.path().join("rsa_key.p8").exists());
    assert!(dir.path().join("credential.json").exists());

    // A new process over the same files and warehouse
    let second = TestContext::persistent(dir.path(), warehouse);
    let handled = second.service.handle(&setup(&channel())).await;

    assert!(matches!(handled.reply, Reply::SetupComplete { .. }));
    assert_eq!(second.keys.generated(), 0);
    assert_eq!(second.identity.registrations(), 0);

    // Cleanup removes the registration and the saved files
    second.service.handle(&cleanup(&channel())).await;
    assert_eq!(second.identity.clears(), 1);
    assert!(!dir.path().join("rsa_key.p8").exists());
    assert!(!dir.path().join("credential.json").exists());
}

#[tokio::test]
async fn test_setup_elsewhere_keeps_cached_token() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = TestContext::persistent(dir.path(), Arc::new(MemoryWarehouse::default()));
    let other = ConversationKey::thread("C0123456789", "1700000000.000100");

    ctx.service.handle(&setup(&channel())).await;
    let credentials = ctx.router().credentials();
    let before = credentials.mint_token(AUDIENCE).await.unwrap();

    let handled = ctx.service.handle(&setup_named(&other, "sales", "raw")).await;
    assert!(matches!(handled.reply, Reply::SetupComplete { .. }));
    let after = credentials.mint_token(AUDIENCE).await.unwrap();

    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(ctx.keys.generated(), 1);
    assert_eq!(ctx.identity.registrations(), 1);
}

#[tokio::test]
async fn test_setup_after_invalidation_rotates_key() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = TestContext::persistent(dir.path(), Arc::new(MemoryWarehouse::default()));

    let first = ctx.service.handle(&setup(&channel())).await;
    let Reply::SetupComplete {
        fingerprint: old, ..
    } = first.reply
    else {
        panic!("expected setup to complete, got {:?}", first.reply);
    };

    ctx.router().credentials().invalidate().await;
    let second = ctx.service.handle(&setup(&channel())).await;
    let Reply::SetupComplete {
        fingerprint: new, ..
    } = second.reply
    else {
        panic!("expected setup to complete, got {:?}", second.reply);
    };

    assert_ne!(old, new);
    assert_eq!(ctx.keys.generated(), 2);
    assert_eq!(ctx.identity.registrations(), 2);
}
