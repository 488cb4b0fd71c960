//! Visibility rules: which clients an actor may see.
//!
//! Every read in the territory core is narrowed by the acting employee's
//! [`Scope`]. Resolution fails closed: a manager with no project grants sees
//! nothing, and a store error while reading grants or assignments can only
//! shrink what is visible.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::db::{
    AssignmentRecord, ClientId, ClientRecord, EmployeeId, Filter, ProjectGrantRecord, ProjectId,
    Select, TabularStore, Table,
};
use crate::territory::chunking::membership_filter;
use crate::territory::pager::{PageOptions, read_all};

/// Employee role as stored in the CRM's user profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    SalesManager,
    Sales,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::SalesManager => "sales_manager",
            Self::Sales => "sales",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Self::Admin),
            "sales_manager" => Some(Self::SalesManager),
            "sales" => Some(Self::Sales),
            _ => None,
        }
    }

    /// Roles allowed to change another employee's territory.
    pub fn can_reconcile(self) -> bool {
        matches!(self, Self::Admin | Self::SalesManager)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::from_db_value(&normalized).ok_or_else(|| {
            format!("unknown role '{s}' (expected admin, sales_manager or sales)")
        })
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The employee on whose behalf an operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: EmployeeId,
    pub role: Role,
}

impl Actor {
    pub fn new(id: EmployeeId, role: Role) -> Self {
        Self { id, role }
    }
}

/// Set of clients visible to an actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "ids", rename_all = "snake_case")]
pub enum Scope {
    All,
    /// Clients whose interested project is one of these.
    Projects(BTreeSet<ProjectId>),
    /// Exactly these clients.
    Clients(BTreeSet<ClientId>),
}

/// Client-table restriction derived from a scope.
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeFilter {
    Unrestricted,
    Restricted(Filter),
    /// The scope admits no client; skip every downstream query.
    Nothing,
}

impl Scope {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::All => false,
            Self::Projects(ids) | Self::Clients(ids) => ids.is_empty(),
        }
    }

    /// Restriction on the `clients` table, with membership chunked to
    /// `chunk_size` values per predicate.
    pub fn client_filter(&self, chunk_size: usize) -> ScopeFilter {
        let filter = match self {
            Self::All => return ScopeFilter::Unrestricted,
            Self::Projects(ids) => membership_filter("interested_project_id", ids, chunk_size),
            Self::Clients(ids) => membership_filter("id", ids, chunk_size),
        };
        match filter {
            Some(filter) => ScopeFilter::Restricted(filter),
            None => ScopeFilter::Nothing,
        }
    }

    pub fn permits_client(&self, client: &ClientRecord) -> bool {
        match self {
            Self::All => true,
            Self::Projects(ids) => client
                .interested_project_id
                .is_some_and(|project| ids.contains(&project)),
            Self::Clients(ids) => ids.contains(&client.id),
        }
    }
}

/// Resolve the visibility scope of `actor`.
pub async fn resolve_scope(store: &dyn TabularStore, actor: &Actor, options: &PageOptions) -> Scope {
    match actor.role {
        Role::Admin => Scope::All,
        Role::SalesManager => {
            let select = Select::new(Table::EmployeeProjects)
                .filter(Filter::eq("employee_id", actor.id));
            let grants = read_all::<ProjectGrantRecord>(store, &select, options).await;
            if let Some(reason) = &grants.interrupted {
                tracing::warn!(
                    employee_id = %actor.id,
                    granted_so_far = grants.rows.len(),
                    "project grants read incomplete, scope narrowed: {}",
                    reason
                );
            }
            let projects: BTreeSet<ProjectId> = grants.rows.into_iter().map(|g| g.project_id).collect();
            if projects.is_empty() {
                tracing::debug!(employee_id = %actor.id, "manager has no project grants");
            }
            Scope::Projects(projects)
        }
        Role::Sales => {
            let select = Select::new(Table::ClientAssignments)
                .filter(Filter::eq("employee_id", actor.id));
            let assignments = read_all::<AssignmentRecord>(store, &select, options).await;
            if let Some(reason) = &assignments.interrupted {
                tracing::warn!(
                    employee_id = %actor.id,
                    assigned_so_far = assignments.rows.len(),
                    "assignment read incomplete, scope narrowed: {}",
                    reason
                );
            }
            Scope::Clients(assignments.rows.into_iter().map(|a| a.client_id).collect())
        }
    }
}
