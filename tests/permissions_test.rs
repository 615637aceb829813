//! Permission manager behavior over the scripted permission service.

use camcore::permissions::{FixedPermissions, PermissionService};
use camcore::{CameraError, MediaType, PermissionManager, PermissionStatus};
use std::sync::Arc;

fn manager(perms: FixedPermissions) -> (PermissionManager, Arc<FixedPermissions>) {
    let perms = Arc::new(perms);
    (PermissionManager::new(perms.clone()), perms)
}

#[test]
fn test_status_passthrough() {
    let (manager, perms) = manager(FixedPermissions::authorized());
    assert_eq!(
        manager.authorization_status(MediaType::Video),
        PermissionStatus::Authorized
    );
    perms.set_status(MediaType::Audio, PermissionStatus::Restricted);
    assert_eq!(
        manager.authorization_status(MediaType::Audio),
        PermissionStatus::Restricted
    );
}

#[test]
fn test_unknown_media_type_is_not_determined() {
    let perms = FixedPermissions::default();
    assert_eq!(
        perms.authorization_status(MediaType::Video),
        PermissionStatus::NotDetermined
    );
}

#[test]
fn test_request_granted() {
    let (manager, perms) = manager(FixedPermissions::default());
    perms.set_response(MediaType::Video, true);

    let status = tokio_test::block_on(manager.request_access(MediaType::Video));
    assert_eq!(status, PermissionStatus::Authorized);
    assert_eq!(
        manager.authorization_status(MediaType::Video),
        PermissionStatus::Authorized
    );
    assert_eq!(perms.request_count(), 1);
}

#[test]
fn test_request_declined() {
    let (manager, perms) = manager(FixedPermissions::default());
    perms.set_response(MediaType::Video, false);

    let status = tokio_test::block_on(manager.request_access(MediaType::Video));
    assert_eq!(status, PermissionStatus::Denied);
}

#[test]
fn test_dropped_request_counts_as_denied() {
    let (manager, perms) = manager(FixedPermissions::default());
    perms.set_never_respond(true);

    let status = tokio_test::block_on(manager.request_access(MediaType::Video));
    assert_eq!(status, PermissionStatus::Denied);
    assert_eq!(perms.request_count(), 1);
}

#[tokio::test]
async fn test_ensure_authorized() {
    let (manager, perms) = manager(FixedPermissions::authorized());
    tokio_test::assert_ok!(manager.ensure_authorized(MediaType::Video).await);
    assert_eq!(perms.request_count(), 0);

    perms.set_status(MediaType::Video, PermissionStatus::Denied);
    let err = manager.ensure_authorized(MediaType::Video).await.unwrap_err();
    assert!(matches!(err, CameraError::PermissionDenied(_)));
    assert!(err.message().contains("denied"));
    assert_eq!(perms.request_count(), 0);

    perms.set_status(MediaType::Video, PermissionStatus::NotDetermined);
    perms.set_response(MediaType::Video, true);
    tokio_test::assert_ok!(manager.ensure_authorized(MediaType::Video).await);
    assert_eq!(perms.request_count(), 1);
}

#[tokio::test]
async fn test_concurrent_requests() {
    let (manager, perms) = manager(FixedPermissions::default());
    perms.set_response(MediaType::Audio, true);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.ensure_authorized(MediaType::Audio).await })
        })
        .collect();
    for result in futures::future::join_all(handles).await {
        assert!(result.unwrap().is_ok());
    }
}

#[test]
fn test_status_serialization() {
    assert_eq!(
        serde_json::to_string(&PermissionStatus::NotDetermined).unwrap(),
        "\"notDetermined\""
    );
    assert_eq!(PermissionStatus::Authorized.to_string(), "authorized");
}
