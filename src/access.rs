//! Access control: permission levels, visibility, and per-user filter
//! predicates.
//!
//! The service answers two questions: "which documents may this user touch
//! at level L" (as a predicate usable store-side and vector-side) and "may
//! this user touch this document at level L" (a single-doc check). Sharing
//! mutates permission rows and re-tags affected vectors.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::DocumentStore;
use crate::vector::{EmbeddingEnvelope, MetadataFilter, VectorIndex};

/// Document-level default reachability before explicit grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Shared,
    Team,
    Organization,
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Shared => "shared",
            Self::Team => "team",
            Self::Organization => "organization",
            Self::Public => "public",
        }
    }
}

impl FromStr for Visibility {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "private" => Ok(Self::Private),
            "shared" => Ok(Self::Shared),
            "team" => Ok(Self::Team),
            "organization" => Ok(Self::Organization),
            "public" => Ok(Self::Public),
            other => Err(Error::validation("visibility", format!("unknown value '{}'", other))),
        }
    }
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Totally ordered capability: admin implies write implies read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Read = 0,
    Write = 1,
    Admin = 2,
}

impl PermissionLevel {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(v: i64) -> Result<Self> {
        match v {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            2 => Ok(Self::Admin),
            other => Err(Error::validation("level", format!("unknown value {}", other))),
        }
    }
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

/// What kind of principal a grant names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GranteeKind {
    User,
    Team,
    Organization,
}

impl GranteeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Team => "team",
            Self::Organization => "organization",
        }
    }
}

impl FromStr for GranteeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Self::User),
            "team" => Ok(Self::Team),
            "organization" => Ok(Self::Organization),
            other => Err(Error::validation("grantee_kind", format!("unknown value '{}'", other))),
        }
    }
}

/// An already-verified caller identity with group memberships, supplied by
/// the host per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: Uuid,
    #[serde(default)]
    pub teams: Vec<String>,
    #[serde(default)]
    pub orgs: Vec<String>,
    /// Administrators see "exists but not visible" distinctly from
    /// "does not exist".
    #[serde(default)]
    pub is_admin: bool,
}

impl UserContext {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            teams: Vec::new(),
            orgs: Vec::new(),
            is_admin: false,
        }
    }

    pub fn with_teams(mut self, teams: Vec<String>) -> Self {
        self.teams = teams;
        self
    }

    pub fn with_orgs(mut self, orgs: Vec<String>) -> Self {
        self.orgs = orgs;
        self
    }
}

/// A compiled "which documents may user U touch at level L" predicate.
///
/// Usable both as a store-side row filter ([`AccessPredicate::sql`]) and as
/// a vector-index metadata filter ([`AccessPredicate::vector_filter`]).
/// Built per request and never cached across requests.
#[derive(Debug, Clone)]
pub struct AccessPredicate {
    pub user_id: Uuid,
    pub teams: Vec<String>,
    pub orgs: Vec<String>,
    pub required: PermissionLevel,
}

impl AccessPredicate {
    /// Row-level SQL over a documents table aliased `d`, plus bind values.
    ///
    /// Union of: owner match, public visibility (read only), direct grant,
    /// and group grant at sufficient level.
    pub fn sql(&self) -> (String, Vec<Box<dyn rusqlite::ToSql + Send>>) {
        let mut clauses = vec!["d.owner_id = ?".to_string()];
        let mut params: Vec<Box<dyn rusqlite::ToSql + Send>> = vec![Box::new(self.user_id.to_string())];

        if self.required == PermissionLevel::Read {
            clauses.push("d.visibility = 'public'".to_string());
        }

        let mut grant_arms =
            vec!["(p.grantee_kind = 'user' AND p.grantee = ?)".to_string()];
        let mut grant_params: Vec<Box<dyn rusqlite::ToSql + Send>> =
            vec![Box::new(self.user_id.to_string())];

        if !self.teams.is_empty() {
            let placeholders = vec!["?"; self.teams.len()].join(",");
            grant_arms.push(format!(
                "(p.grantee_kind = 'team' AND p.grantee IN ({}))",
                placeholders
            ));
            for team in &self.teams {
                grant_params.push(Box::new(team.clone()));
            }
        }
        if !self.orgs.is_empty() {
            let placeholders = vec!["?"; self.orgs.len()].join(",");
            grant_arms.push(format!(
                "(p.grantee_kind = 'organization' AND p.grantee IN ({}))",
                placeholders
            ));
            for org in &self.orgs {
                grant_params.push(Box::new(org.clone()));
            }
        }

        clauses.push(format!(
            "EXISTS (SELECT 1 FROM document_permissions p \
             WHERE p.document_id = d.id AND p.level >= ? AND ({}))",
            grant_arms.join(" OR ")
        ));
        params.push(Box::new(self.required.as_i64()));
        params.extend(grant_params);

        (format!("({})", clauses.join(" OR ")), params)
    }

    /// The same predicate expressed in the vector-index filter grammar.
    pub fn vector_filter(&self) -> MetadataFilter {
        let mut arms = vec![MetadataFilter::eq("owner_id", self.user_id.to_string())];

        if self.required == PermissionLevel::Read {
            arms.push(MetadataFilter::eq("visibility", "public"));
        }

        // The envelope's grantee projection already folds in the level
        // floor (read), so set-inclusion suffices for retrieval.
        if self.required == PermissionLevel::Read {
            arms.push(MetadataFilter::contains(
                "read_users",
                self.user_id.to_string(),
            ));
            for team in &self.teams {
                arms.push(MetadataFilter::contains("read_teams", team.clone()));
            }
            for org in &self.orgs {
                arms.push(MetadataFilter::contains("read_orgs", org.clone()));
            }
        }

        MetadataFilter::any(arms)
    }

    /// Evaluate directly against an embedding metadata envelope. Must
    /// agree with the store-side predicate whenever the envelope is
    /// current.
    pub fn allows_envelope(&self, envelope: &EmbeddingEnvelope) -> bool {
        if envelope.owner_id == self.user_id.to_string() {
            return true;
        }
        if self.required > PermissionLevel::Read {
            // The envelope only projects read grants; writes go through
            // the store-side check.
            return false;
        }
        if envelope.visibility == Visibility::Public {
            return true;
        }
        envelope.read_users.iter().any(|u| *u == self.user_id.to_string())
            || envelope.read_teams.iter().any(|t| self.teams.contains(t))
            || envelope.read_orgs.iter().any(|o| self.orgs.contains(o))
    }
}

/// Resolves user identities into predicates and performs grant mutations.
pub struct AccessControl {
    store: Arc<DocumentStore>,
    vector: Arc<VectorIndex>,
}

impl AccessControl {
    pub fn new(store: Arc<DocumentStore>, vector: Arc<VectorIndex>) -> Self {
        Self { store, vector }
    }

    /// Compile the caller's identity into a reusable predicate.
    pub fn filter_for(&self, user: &UserContext, required: PermissionLevel) -> AccessPredicate {
        AccessPredicate {
            user_id: user.user_id,
            teams: user.teams.clone(),
            orgs: user.orgs.clone(),
            required,
        }
    }

    /// Single-document permission question.
    pub async fn check(
        &self,
        user: &UserContext,
        document_id: Uuid,
        required: PermissionLevel,
    ) -> Result<bool> {
        let predicate = self.filter_for(user, required);
        self.store.document_passes(document_id, &predicate).await
    }

    /// Grant `level` on a document to a principal. Requires admin on the
    /// document; owner holds implicit admin.
    pub async fn share(
        &self,
        document_id: Uuid,
        grantee: impl Into<String>,
        kind: GranteeKind,
        level: PermissionLevel,
        by_user: &UserContext,
    ) -> Result<()> {
        self.require_admin(document_id, by_user).await?;

        let grantee = grantee.into();
        self.store
            .upsert_permission(document_id, &grantee, kind, level)
            .await?;
        info!(%document_id, grantee = %grantee, kind = kind.as_str(), level = %level, "permission granted");

        self.retag_document(document_id).await
    }

    /// Remove a grant. Requires admin on the document.
    pub async fn revoke(
        &self,
        document_id: Uuid,
        grantee: &str,
        kind: GranteeKind,
        by_user: &UserContext,
    ) -> Result<()> {
        self.require_admin(document_id, by_user).await?;

        self.store
            .delete_permission(document_id, grantee, kind)
            .await?;
        info!(%document_id, grantee, kind = kind.as_str(), "permission revoked");

        self.retag_document(document_id).await
    }

    /// Change a document's visibility. Requires admin on the document.
    pub async fn set_visibility(
        &self,
        document_id: Uuid,
        visibility: Visibility,
        by_user: &UserContext,
    ) -> Result<()> {
        self.require_admin(document_id, by_user).await?;
        self.store.set_visibility(document_id, visibility).await?;
        self.retag_document(document_id).await
    }

    /// Build the current permission snapshot for a document's embeddings.
    pub async fn envelope_for(&self, document_id: Uuid) -> Result<EmbeddingEnvelope> {
        let document = self.store.get_document_unchecked(document_id).await?;
        let grants = self.store.permissions_for(document_id).await?;

        let mut envelope = EmbeddingEnvelope {
            document_id: document_id.to_string(),
            owner_id: document.owner_id.to_string(),
            visibility: document.visibility,
            read_users: Vec::new(),
            read_teams: Vec::new(),
            read_orgs: Vec::new(),
        };
        for grant in grants {
            if grant.level < PermissionLevel::Read {
                continue;
            }
            match grant.grantee_kind {
                GranteeKind::User => envelope.read_users.push(grant.grantee),
                GranteeKind::Team => envelope.read_teams.push(grant.grantee),
                GranteeKind::Organization => envelope.read_orgs.push(grant.grantee),
            }
        }
        Ok(envelope)
    }

    async fn require_admin(&self, document_id: Uuid, user: &UserContext) -> Result<()> {
        if self
            .check(user, document_id, PermissionLevel::Admin)
            .await?
        {
            return Ok(());
        }
        warn!(%document_id, user_id = %user.user_id, "share denied: caller lacks admin");
        Err(Error::NotAuthorized)
    }

    /// Permission changes re-tag affected vectors (never re-embed), keeping
    /// the envelope invariant.
    async fn retag_document(&self, document_id: Uuid) -> Result<()> {
        let envelope = self.envelope_for(document_id).await?;
        let updated = self.vector.tag_document(document_id, &envelope).await?;
        info!(%document_id, updated, "re-tagged vectors after permission change");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(PermissionLevel::Read < PermissionLevel::Write);
        assert!(PermissionLevel::Write < PermissionLevel::Admin);
        assert_eq!(PermissionLevel::from_i64(2).unwrap(), PermissionLevel::Admin);
        assert!(PermissionLevel::from_i64(9).is_err());
    }

    #[test]
    fn test_visibility_round_trip() {
        for v in [
            Visibility::Private,
            Visibility::Shared,
            Visibility::Team,
            Visibility::Organization,
            Visibility::Public,
        ] {
            assert_eq!(v.as_str().parse::<Visibility>().unwrap(), v);
        }
        assert!("everyone".parse::<Visibility>().is_err());
    }

    #[test]
    fn test_predicate_sql_mentions_public_only_for_read() {
        let user = UserContext::new(Uuid::new_v4());
        let read = AccessPredicate {
            user_id: user.user_id,
            teams: vec![],
            orgs: vec![],
            required: PermissionLevel::Read,
        };
        let (sql, _) = read.sql();
        assert!(sql.contains("public"));

        let write = AccessPredicate {
            required: PermissionLevel::Write,
            ..read
        };
        let (sql, _) = write.sql();
        assert!(!sql.contains("public"));
    }

    #[test]
    fn test_envelope_evaluation() {
        let owner = Uuid::new_v4();
        let reader = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let envelope = EmbeddingEnvelope {
            document_id: Uuid::new_v4().to_string(),
            owner_id: owner.to_string(),
            visibility: Visibility::Shared,
            read_users: vec![reader.to_string()],
            read_teams: vec!["search".to_string()],
            read_orgs: vec![],
        };

        let predicate = |id: Uuid, teams: Vec<String>| AccessPredicate {
            user_id: id,
            teams,
            orgs: vec![],
            required: PermissionLevel::Read,
        };

        assert!(predicate(owner, vec![]).allows_envelope(&envelope));
        assert!(predicate(reader, vec![]).allows_envelope(&envelope));
        assert!(!predicate(stranger, vec![]).allows_envelope(&envelope));
        assert!(predicate(stranger, vec!["search".to_string()]).allows_envelope(&envelope));
    }

    #[test]
    fn test_envelope_write_never_granted_by_projection() {
        let reader = Uuid::new_v4();
        let envelope = EmbeddingEnvelope {
            document_id: Uuid::new_v4().to_string(),
            owner_id: Uuid::new_v4().to_string(),
            visibility: Visibility::Public,
            read_users: vec![reader.to_string()],
            read_teams: vec![],
            read_orgs: vec![],
        };
        let predicate = AccessPredicate {
            user_id: reader,
            teams: vec![],
            orgs: vec![],
            required: PermissionLevel::Write,
        };
        assert!(!predicate.allows_envelope(&envelope));
    }
}
