// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! User identities and the pluggable authorization contracts.
//!
//! The server consumes two collaborators:
//!
//! - [`IdentityValidator`] turns the token presented in ActivateSession into
//!   a [`UserIdentity`], or rejects it.
//! - [`PermissionResolver`] answers `can_access(identity, node, attribute)`
//!   for every monitored item whenever the session's identity changes.
//!
//! Both are developer-supplied. Calls go through [`validate_contained`] and
//! [`can_access_contained`], which turn a panicking callback into a
//! rejection instead of taking the server down.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use trellis_core::{AttributeId, NodeId, StatusCode};

// =============================================================================
// IdentityToken
// =============================================================================

/// Credentials presented in ActivateSession.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IdentityToken {
    /// No credentials.
    #[default]
    Anonymous,
    /// User name and password.
    UserName {
        /// User name.
        user_name: String,
        /// Password.
        password: String,
    },
}

impl IdentityToken {
    /// Creates a user name token.
    pub fn user_name(user_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self::UserName {
            user_name: user_name.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::UserName { user_name, .. } => f
                .debug_struct("UserName")
                .field("user_name", user_name)
                .field("password", &"***")
                .finish(),
        }
    }
}

// =============================================================================
// Role
// =============================================================================

/// Well-known roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Unauthenticated access.
    Anonymous,
    /// Any authenticated user.
    AuthenticatedUser,
    /// Read-only access to process data.
    Observer,
    /// Can operate the process.
    Operator,
    /// Can configure the process.
    Engineer,
    /// Supervises operators.
    Supervisor,
    /// Administers security settings.
    SecurityAdmin,
}

impl Role {
    /// Returns the role name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Anonymous => "anonymous",
            Role::AuthenticatedUser => "authenticated_user",
            Role::Observer => "observer",
            Role::Operator => "operator",
            Role::Engineer => "engineer",
            Role::Supervisor => "supervisor",
            Role::SecurityAdmin => "security_admin",
        }
    }

    /// Parses a role from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "anonymous" => Some(Role::Anonymous),
            "authenticated_user" | "authenticated" => Some(Role::AuthenticatedUser),
            "observer" | "viewer" => Some(Role::Observer),
            "operator" => Some(Role::Operator),
            "engineer" => Some(Role::Engineer),
            "supervisor" => Some(Role::Supervisor),
            "security_admin" | "admin" => Some(Role::SecurityAdmin),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// UserIdentity
// =============================================================================

/// An authenticated identity with its role set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    /// User name, `None` for anonymous.
    pub user_name: Option<String>,
    /// Granted roles.
    pub roles: BTreeSet<Role>,
}

impl UserIdentity {
    /// The anonymous identity.
    pub fn anonymous() -> Self {
        Self {
            user_name: None,
            roles: BTreeSet::from([Role::Anonymous]),
        }
    }

    /// A named user holding `roles` plus `AuthenticatedUser`.
    pub fn user(name: impl Into<String>, roles: impl IntoIterator<Item = Role>) -> Self {
        let mut roles: BTreeSet<Role> = roles.into_iter().collect();
        roles.insert(Role::AuthenticatedUser);
        Self {
            user_name: Some(name.into()),
            roles,
        }
    }

    /// Returns `true` if the identity holds `role`.
    #[inline]
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Returns `true` if both identities belong to the same user.
    pub fn same_user(&self, other: &UserIdentity) -> bool {
        self.user_name == other.user_name
    }
}

impl Default for UserIdentity {
    fn default() -> Self {
        Self::anonymous()
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user_name {
            Some(name) => write!(f, "{}", name),
            None => f.write_str("<anonymous>"),
        }
    }
}

// =============================================================================
// Contracts
// =============================================================================

/// Turns an identity token into a user identity.
pub trait IdentityValidator: Send + Sync {
    /// Validates the token.
    ///
    /// Return `BadIdentityTokenRejected` for wrong credentials and
    /// `BadIdentityTokenInvalid` for unsupported token kinds.
    fn validate(&self, token: &IdentityToken) -> Result<UserIdentity, StatusCode>;
}

/// Resolves read/subscribe permission for a user on a node.
pub trait PermissionResolver: Send + Sync {
    /// Returns `true` if `identity` may monitor `attribute` of `node`.
    fn can_access(&self, identity: &UserIdentity, node: &NodeId, attribute: AttributeId) -> bool;
}

/// Calls the validator, mapping a panic to `BadIdentityTokenRejected`.
pub fn validate_contained(
    validator: &dyn IdentityValidator,
    token: &IdentityToken,
) -> Result<UserIdentity, StatusCode> {
    match panic::catch_unwind(AssertUnwindSafe(|| validator.validate(token))) {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(token = ?token, "Identity validator panicked, rejecting activation");
            Err(StatusCode::BAD_IDENTITY_TOKEN_REJECTED)
        }
    }
}

/// Calls the resolver, mapping a panic to `BadUserAccessDenied`.
pub fn can_access_contained(
    resolver: &dyn PermissionResolver,
    identity: &UserIdentity,
    node: &NodeId,
    attribute: AttributeId,
) -> Result<bool, StatusCode> {
    panic::catch_unwind(AssertUnwindSafe(|| {
        resolver.can_access(identity, node, attribute)
    }))
    .map_err(|_| {
        tracing::warn!(user = %identity, node = %node, "Permission resolver panicked");
        StatusCode::BAD_USER_ACCESS_DENIED
    })
}

// =============================================================================
// Built-in Implementations
// =============================================================================

/// Validator backed by a fixed user table.
#[derive(Debug, Clone, Default)]
pub struct StaticUserValidator {
    users: HashMap<String, (String, BTreeSet<Role>)>,
    allow_anonymous: bool,
}

impl StaticUserValidator {
    /// Creates an empty validator that accepts anonymous tokens.
    pub fn new() -> Self {
        Self {
            users: HashMap::new(),
            allow_anonymous: true,
        }
    }

    /// Adds a user.
    pub fn with_user(
        mut self,
        user_name: impl Into<String>,
        password: impl Into<String>,
        roles: impl IntoIterator<Item = Role>,
    ) -> Self {
        self.users.insert(
            user_name.into(),
            (password.into(), roles.into_iter().collect()),
        );
        self
    }

    /// Sets whether anonymous tokens are accepted.
    pub fn allow_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }
}

impl IdentityValidator for StaticUserValidator {
    fn validate(&self, token: &IdentityToken) -> Result<UserIdentity, StatusCode> {
        match token {
            IdentityToken::Anonymous if self.allow_anonymous => Ok(UserIdentity::anonymous()),
            IdentityToken::Anonymous => Err(StatusCode::BAD_IDENTITY_TOKEN_INVALID),
            IdentityToken::UserName {
                user_name,
                password,
            } => match self.users.get(user_name) {
                Some((expected, roles)) if expected == password => {
                    Ok(UserIdentity::user(user_name.clone(), roles.iter().copied()))
                }
                _ => Err(StatusCode::BAD_IDENTITY_TOKEN_REJECTED),
            },
        }
    }
}

/// Resolver granting everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionResolver for AllowAll {
    fn can_access(&self, _: &UserIdentity, _: &NodeId, _: AttributeId) -> bool {
        true
    }
}

/// Resolver requiring one of a set of roles per node; unlisted nodes are open.
#[derive(Debug, Clone, Default)]
pub struct RolePermissions {
    required: HashMap<NodeId, BTreeSet<Role>>,
}

impl RolePermissions {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts `node` to holders of any of `roles`.
    pub fn restrict(mut self, node: NodeId, roles: impl IntoIterator<Item = Role>) -> Self {
        self.required
            .entry(node)
            .or_default()
            .extend(roles);
        self
    }
}

impl PermissionResolver for RolePermissions {
    fn can_access(&self, identity: &UserIdentity, node: &NodeId, _: AttributeId) -> bool {
        match self.required.get(node) {
            Some(roles) => roles.iter().any(|r| identity.has_role(*r)),
            None => true,
        }
    }
}
