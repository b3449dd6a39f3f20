//! Integration tests for carrying permissions across domains

use ::common::migrate::{DomainMapping, PermissionMigrator, PermissionReport};
use ::common::retry::RetryPolicy;
use ::common::store::{Grantee, MemoryStore, Permission, Role, StoreError, StoreOp, ROOT_ID};

fn stores() -> (MemoryStore, MemoryStore, String, String) {
    let source = MemoryStore::new();
    let dest = MemoryStore::new();
    let source_id = source.add_file(ROOT_ID, "budget.xlsx", "numbers");
    let dest_id = dest.add_file(ROOT_ID, "budget.xlsx", "numbers");
    (source, dest, source_id, dest_id)
}

fn migrator<'a>(source: &'a MemoryStore, dest: &'a MemoryStore) -> PermissionMigrator<'a> {
    PermissionMigrator::new(
        source,
        dest,
        DomainMapping::new("old.example", "new.example"),
        RetryPolicy::immediate(3),
    )
}

#[tokio::test]
async fn test_mixed_permissions_are_filtered_and_rewritten() {
    let (source, dest, source_id, dest_id) = stores();
    source.add_permission(&source_id, Permission::user("ana@old.example", Role::Owner));
    source.add_permission(&source_id, Permission::user("bo@Old.Example", Role::Commenter));
    source.add_permission(&source_id, Permission::user("cy@partner.example", Role::Writer));
    source.add_permission(&source_id, Permission::domain("old.example", Role::Reader));
    source.add_permission(
        &source_id,
        Permission {
            grantee: Grantee::Group {
                email: "eng@old.example".into(),
            },
            role: Role::Reader,
        },
    );
    source.add_permission(
        &source_id,
        Permission {
            grantee: Grantee::Anyone,
            role: Role::Reader,
        },
    );

    let report = migrator(&source, &dest).migrate(&source_id, &dest_id).await;

    assert_eq!(
        report,
        PermissionReport {
            created: 3,
            skipped: 3,
            failed: 0
        }
    );
    assert_eq!(
        dest.permissions(&dest_id),
        vec![
            Permission::user("ana@new.example", Role::Owner),
            Permission::user("bo@new.example", Role::Commenter),
            Permission::domain("new.example", Role::Reader),
        ]
    );
    assert_eq!(dest.notifications_sent(), 0);
}

#[tokio::test]
async fn test_listing_failure_is_reported_not_raised() {
    let (source, dest, source_id, dest_id) = stores();
    source.add_permission(&source_id, Permission::user("ana@old.example", Role::Reader));
    source.fail(
        StoreOp::ListPermissions,
        &source_id,
        StoreError::PermissionDenied("not yours".into()),
        1,
    );

    let report = migrator(&source, &dest).migrate(&source_id, &dest_id).await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.created, 0);
    assert!(dest.permissions(&dest_id).is_empty());
}

#[tokio::test]
async fn test_one_failed_grant_does_not_stop_the_rest() {
    let (source, dest, source_id, dest_id) = stores();
    source.add_permission(&source_id, Permission::user("ana@old.example", Role::Reader));
    source.add_permission(&source_id, Permission::user("bo@old.example", Role::Writer));
    dest.fail(
        StoreOp::CreatePermission,
        &dest_id,
        StoreError::InvalidRequest("unknown user".into()),
        1,
    );

    let report = migrator(&source, &dest).migrate(&source_id, &dest_id).await;

    assert_eq!(report.created, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(
        dest.permissions(&dest_id),
        vec![Permission::user("bo@new.example", Role::Writer)]
    );
}

#[tokio::test]
async fn test_transient_grant_failures_are_retried() {
    let (source, dest, source_id, dest_id) = stores();
    source.add_permission(&source_id, Permission::domain("old.example", Role::Reader));
    dest.fail(
        StoreOp::CreatePermission,
        &dest_id,
        StoreError::RateLimited("slow down".into()),
        2,
    );

    let report = migrator(&source, &dest).migrate(&source_id, &dest_id).await;

    assert_eq!(report.created, 1);
    assert_eq!(dest.calls(StoreOp::CreatePermission), 3);
}
