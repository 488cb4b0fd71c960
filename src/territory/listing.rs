//! Scoped client listing.
//!
//! The actor's scope is applied before any user filter. An empty scope ends
//! the listing without touching the client table.

use std::sync::Arc;

use serde::Deserialize;

use crate::config::TerritoryConfig;
use crate::db::{ClientId, ClientRecord, ClientStatus, Filter, OrderBy, ProjectId, Select, TabularStore, Table};
use crate::territory::chunking::membership_filter;
use crate::territory::pager::{PageOptions, Paged, read_all};
use crate::territory::scope::{Actor, ScopeFilter, resolve_scope};
use crate::territory::window::TimeWindow;

/// User-supplied filters for a client listing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientQuery {
    pub status: Option<ClientStatus>,
    pub project_id: Option<ProjectId>,
    /// Case-insensitive substring of name or mobile.
    pub search: Option<String>,
    pub created: Option<TimeWindow>,
    /// Only clients with no assignment at all.
    pub unassigned_only: bool,
}

pub struct ClientListing {
    store: Arc<dyn TabularStore>,
    chunk_size: usize,
    page: PageOptions,
}

impl ClientListing {
    pub fn new(store: Arc<dyn TabularStore>, config: &TerritoryConfig) -> Self {
        Self {
            store,
            chunk_size: config.chunk_size,
            page: config.page_options(),
        }
    }

    /// Clients visible to `actor` matching `query`, newest first.
    pub async fn list(&self, actor: &Actor, query: &ClientQuery) -> Paged<ClientRecord> {
        let scope = resolve_scope(self.store.as_ref(), actor, &self.page).await;
        let mut select = Select::new(Table::Clients).order_by(vec![OrderBy::desc("created_at")]);

        match scope.client_filter(self.chunk_size) {
            ScopeFilter::Nothing => {
                tracing::debug!(actor_id = %actor.id, role = %actor.role, "empty scope, no clients listed");
                return Paged::empty();
            }
            ScopeFilter::Unrestricted => {}
            ScopeFilter::Restricted(filter) => select = select.filter(filter),
        }

        if let Some(status) = query.status {
            select = select.filter(Filter::eq("status", status.as_str()));
        }
        if let Some(project_id) = query.project_id {
            select = select.filter(Filter::eq("interested_project_id", project_id));
        }
        if let Some(search) = query.search.as_deref().map(str::trim)
            && !search.is_empty()
        {
            select = select.filter(Filter::Search(vec!["name", "mobile"], search.to_string()));
        }
        if let Some(window) = &query.created {
            select = select.filter(window.filter("created_at"));
        }

        if query.unassigned_only {
            let unassigned = match self.store.unassigned_client_ids().await {
                Ok(ids) => ids,
                Err(e) => {
                    tracing::warn!("unassigned client lookup failed: {}", e);
                    return Paged::failed(e.to_string());
                }
            };
            match membership_filter("id", &unassigned, self.chunk_size) {
                Some(filter) => select = select.filter(filter),
                None => return Paged::empty(),
            }
        }

        read_all(self.store.as_ref(), &select, &self.page).await
    }

    /// Ids of every client visible to `actor`.
    pub async fn client_ids_in_scope(&self, actor: &Actor) -> Paged<ClientId> {
        self.list(actor, &ClientQuery::default()).await.map(|client| client.id)
    }

    /// One client, if it exists and `actor` may see it.
    pub async fn get(&self, actor: &Actor, client_id: ClientId) -> Option<ClientRecord> {
        let scope = resolve_scope(self.store.as_ref(), actor, &self.page).await;
        if scope.is_empty() {
            return None;
        }
        let select = Select::new(Table::Clients).filter(Filter::eq("id", client_id));
        let client = read_all::<ClientRecord>(self.store.as_ref(), &select, &self.page)
            .await
            .rows
            .into_iter()
            .next()?;
        scope.permits_client(&client).then_some(client)
    }
}
