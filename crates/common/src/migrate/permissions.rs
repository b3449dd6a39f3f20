//! Permission migration
//!
//! Sharing on a source unit is translated onto its destination counterpart
//! by rewriting the domain: a user entry in the source domain keeps its local
//! part and role but moves to the target domain, and a domain-wide grant on
//! the source domain becomes the same grant on the target domain. Everything
//! else (groups, public links, foreign domains) cannot be mapped safely and
//! is skipped. Nobody is notified.

use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

use crate::retry::{with_retry, RetryPolicy};
use crate::store::{Grantee, Permission, RemoteStore};

/// Source domain to target domain, compared without regard to case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainMapping {
    pub source: String,
    pub target: String,
}

impl DomainMapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into().trim().to_string(),
            target: target.into().trim().to_string(),
        }
    }

    /// The destination equivalent of a source permission, if it has one.
    pub fn remap(&self, permission: &Permission) -> Option<Permission> {
        let grantee = match &permission.grantee {
            Grantee::User { email } => {
                let (local, domain) = email.rsplit_once('@')?;
                if local.is_empty() || !domain.eq_ignore_ascii_case(&self.source) {
                    return None;
                }
                Grantee::User {
                    email: format!("{}@{}", local, self.target),
                }
            }
            Grantee::Domain { domain } if domain.eq_ignore_ascii_case(&self.source) => {
                Grantee::Domain {
                    domain: self.target.clone(),
                }
            }
            _ => return None,
        };
        Some(Permission {
            grantee,
            role: permission.role,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionReport {
    pub created: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl PermissionReport {
    pub fn absorb(&mut self, other: PermissionReport) {
        *self += other;
    }
}

impl AddAssign for PermissionReport {
    fn add_assign(&mut self, other: Self) {
        self.created += other.created;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Copies remappable permissions from source units to destination units.
#[derive(Debug)]
pub struct PermissionMigrator<'a> {
    source: &'a dyn RemoteStore,
    dest: &'a dyn RemoteStore,
    domains: DomainMapping,
    retry: RetryPolicy,
}

impl<'a> PermissionMigrator<'a> {
    pub fn new(
        source: &'a dyn RemoteStore,
        dest: &'a dyn RemoteStore,
        domains: DomainMapping,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            dest,
            domains,
            retry,
        }
    }

    /// Carry the permissions of `source_id` over to `dest_id`.
    ///
    /// Never fails: a listing error skips the unit, and each grant that
    /// cannot be created is logged and counted on its own.
    pub async fn migrate(&self, source_id: &str, dest_id: &str) -> PermissionReport {
        let mut report = PermissionReport::default();
        let source = self.source;
        let permissions = match with_retry(&self.retry, "list permissions", move || {
            source.list_permissions(source_id)
        })
        .await
        {
            Ok(permissions) => permissions,
            Err(err) => {
                tracing::warn!(source_id, error = %err, "could not read permissions");
                report.failed += 1;
                return report;
            }
        };

        for permission in permissions {
            let Some(mapped) = self.domains.remap(&permission) else {
                tracing::debug!(source_id, %permission, "permission not remappable, skipping");
                report.skipped += 1;
                continue;
            };

            let dest = self.dest;
            let grant = &mapped;
            match with_retry(&self.retry, "create permission", move || {
                dest.create_permission(dest_id, grant, false)
            })
            .await
            {
                Ok(()) => {
                    tracing::debug!(dest_id, permission = %mapped, "permission granted");
                    report.created += 1;
                }
                Err(err) => {
                    tracing::warn!(dest_id, permission = %mapped, error = %err, "could not grant permission");
                    report.failed += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Role;

    fn mapping() -> DomainMapping {
        DomainMapping::new("old.example", "new.example")
    }

    #[test]
    fn test_user_in_source_domain_is_rewritten() {
        let mapped = mapping()
            .remap(&Permission::user("ana@OLD.example", Role::Writer))
            .unwrap();
        assert_eq!(mapped, Permission::user("ana@new.example", Role::Writer));
    }

    #[test]
    fn test_domain_grant_is_rewritten() {
        let mapped = mapping()
            .remap(&Permission::domain("old.example", Role::Reader))
            .unwrap();
        assert_eq!(mapped, Permission::domain("new.example", Role::Reader));
    }

    #[test]
    fn test_unmappable_entries_are_skipped() {
        let m = mapping();
        assert!(m
            .remap(&Permission::user("bob@elsewhere.example", Role::Reader))
            .is_none());
        assert!(m.remap(&Permission::user("not-an-email", Role::Reader)).is_none());
        assert!(m
            .remap(&Permission::domain("elsewhere.example", Role::Reader))
            .is_none());
        let group = Permission {
            grantee: Grantee::Group {
                email: "team@old.example".into(),
            },
            role: Role::Reader,
        };
        assert!(m.remap(&group).is_none());
        let anyone = Permission {
            grantee: Grantee::Anyone,
            role: Role::Reader,
        };
        assert!(m.remap(&anyone).is_none());
    }

    #[test]
    fn test_reports_add_up() {
        let mut total = PermissionReport::default();
        total.absorb(PermissionReport {
            created: 2,
            skipped: 1,
            failed: 0,
        });
        total += PermissionReport {
            created: 1,
            skipped: 0,
            failed: 3,
        };
        assert_eq!(
            total,
            PermissionReport {
                created: 3,
                skipped: 1,
                failed: 3
            }
        );
    }
}
