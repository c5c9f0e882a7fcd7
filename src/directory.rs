//! Boundary to the collaborators this engine does not own: identity and role
//! resolution, subscription validity, and cancellation notices.
//!
//! [`MemberDirectory`] is the file-backed stand-in the server binary uses for
//! the first two. Notices go through [`crate::notify::NotifyHub`].

use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Instructor,
    Student,
}

/// The authenticated caller of an engine operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub tenant: String,
    pub roles: Vec<Role>,
}

impl Actor {
    pub fn new(id: Ulid, tenant: impl Into<String>, roles: &[Role]) -> Self {
        Self {
            id,
            tenant: tenant.into(),
            roles: roles.to_vec(),
        }
    }

    pub fn has(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Admins and instructors manage the schedule of their tenant.
    pub fn is_staff(&self) -> bool {
        self.has(Role::Admin) || self.has(Role::Instructor)
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("unknown member {user} in tenant {tenant}")]
    UnknownMember { tenant: String, user: String },
    #[error("members file: {0}")]
    Io(#[from] std::io::Error),
    #[error("members file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("directory unreachable: {0}")]
    Unreachable(String),
}

/// Resolves a login to an [`Actor`] scoped to one tenant.
pub trait Directory: Send + Sync {
    fn resolve(&self, tenant: &str, user: &str) -> Result<Actor, DirectoryError>;
}

/// Subscription collaborator. Consulted once, at reservation time.
#[async_trait]
pub trait SubscriptionCheck: Send + Sync {
    async fn has_active_subscription(
        &self,
        tenant: &str,
        student_id: Ulid,
        as_of: Ms,
    ) -> Result<bool, DirectoryError>;
}

/// Notification collaborator. Fire-and-forget: never part of the
/// transactional outcome and never fails the caller.
pub trait CancellationNotifier: Send + Sync {
    fn notify_cancelled_bookings(&self, session_id: Ulid, student_ids: &[Ulid]);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: Ulid,
    pub roles: Vec<Role>,
    /// Unix ms; `None` means no subscription at all.
    #[serde(default)]
    pub subscription_expires_at: Option<Ms>,
}

#[derive(Debug, Default, Deserialize)]
struct MembersFile {
    tenants: std::collections::HashMap<String, Vec<Member>>,
}

/// In-memory member registry keyed by `(tenant, member id)`.
#[derive(Default)]
pub struct MemberDirectory {
    members: DashMap<(String, Ulid), Member>,
}

impl MemberDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON document of the form
    /// `{"tenants": {"<tenant>": [{"id": "<ulid>", "roles": ["student"], "subscription_expires_at": <ms>}]}}`.
    pub fn load(path: &Path) -> Result<Self, DirectoryError> {
        let raw = std::fs::read_to_string(path)?;
        let file: MembersFile = serde_json::from_str(&raw)?;
        let dir = Self::new();
        for (tenant, members) in file.tenants {
            for member in members {
                dir.upsert(&tenant, member);
            }
        }
        tracing::info!("loaded {} members from {}", dir.len(), path.display());
        Ok(dir)
    }

    pub fn upsert(&self, tenant: &str, member: Member) {
        self.members.insert((tenant.to_string(), member.id), member);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl Directory for MemberDirectory {
    fn resolve(&self, tenant: &str, user: &str) -> Result<Actor, DirectoryError> {
        let unknown = || DirectoryError::UnknownMember {
            tenant: tenant.to_string(),
            user: user.to_string(),
        };
        let id = Ulid::from_string(user).map_err(|_| unknown())?;
        let member = self
            .members
            .get(&(tenant.to_string(), id))
            .ok_or_else(unknown)?;
        Ok(Actor::new(id, tenant, &member.roles))
    }
}

#[async_trait]
impl SubscriptionCheck for MemberDirectory {
    async fn has_active_subscription(
        &self,
        tenant: &str,
        student_id: Ulid,
        as_of: Ms,
    ) -> Result<bool, DirectoryError> {
        Ok(self
            .members
            .get(&(tenant.to_string(), student_id))
            .and_then(|m| m.subscription_expires_at)
            .is_some_and(|expires| expires > as_of))
    }
}
