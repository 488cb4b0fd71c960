use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;

use crate::config::TerritoryConfig;
use crate::db::{ClientId, EmployeeId, TabularStore};
use crate::territory::activity::{ActivityAggregator, ActivityReport, ActivitySource};
use crate::territory::listing::ClientListing;
use crate::territory::scope::Actor;
use crate::territory::window::TimeWindow;

/// Clients an actor can see, optionally narrowed to a requested subset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisibleClients {
    pub ids: BTreeSet<ClientId>,
    /// Why the scope listing stopped early, if it did. `ids` is then partial.
    pub interrupted: Option<String>,
}

impl VisibleClients {
    /// An empty `requested` set means every visible client.
    pub async fn resolve(
        listing: &ClientListing,
        actor: &Actor,
        requested: &BTreeSet<ClientId>,
    ) -> Self {
        let listed = listing.client_ids_in_scope(actor).await;
        let mut ids: BTreeSet<ClientId> = listed.rows.into_iter().collect();
        if !requested.is_empty() {
            ids.retain(|id| requested.contains(id));
        }
        if let Some(reason) = &listed.interrupted {
            tracing::warn!(actor_id = %actor.id, listed = ids.len(), "client scope is partial: {}", reason);
        }
        Self {
            ids,
            interrupted: listed.interrupted,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.interrupted.is_none()
    }
}

/// Activity report over a visible client set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivitySummary {
    pub client_count: usize,
    pub scope_complete: bool,
    /// Some reads failed; counts are lower bounds.
    pub degraded: bool,
    #[serde(flatten)]
    pub report: ActivityReport,
}

impl ActivitySummary {
    pub fn new(clients: &VisibleClients, report: ActivityReport) -> Self {
        Self {
            client_count: clients.ids.len(),
            scope_complete: clients.is_complete(),
            degraded: !clients.is_complete() || report.is_degraded(),
            report,
        }
    }
}

/// Worked-on metrics for the clients an actor can see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkReport {
    pub window: TimeWindow,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employee_id: Option<EmployeeId>,
    pub client_count: usize,
    pub touched_count: usize,
    pub untouched_count: usize,
    pub by_source: BTreeMap<ActivitySource, usize>,
    /// Some reads failed; counts are lower bounds.
    pub degraded: bool,
}

impl WorkReport {
    pub async fn build(
        store: Arc<dyn TabularStore>,
        config: &TerritoryConfig,
        actor: &Actor,
        window: &TimeWindow,
        employee: Option<EmployeeId>,
    ) -> Self {
        let listing = ClientListing::new(store.clone(), config);
        let clients = VisibleClients::resolve(&listing, actor, &BTreeSet::new()).await;

        let activity = ActivityAggregator::new(store, config)
            .aggregate(&clients.ids, window, employee)
            .await;
        let summary = ActivitySummary::new(&clients, activity);

        let touched_count = summary.report.touched_count();
        Self {
            window: *window,
            employee_id: employee,
            client_count: summary.client_count,
            touched_count,
            untouched_count: summary.client_count.saturating_sub(touched_count),
            by_source: ActivitySource::ALL
                .into_iter()
                .map(|source| (source, summary.report.count(source)))
                .collect(),
            degraded: summary.degraded,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::db::memory::{InMemoryStore, StoreOperation};
    use crate::db::{AssignmentRecord, ClientRecord, ClientStatus, Table, VisitRecord};
    use crate::territory::scope::Role;

    fn config() -> TerritoryConfig {
        TerritoryConfig {
            page_delay: Duration::ZERO,
            ..TerritoryConfig::default()
        }
    }

    fn clients(n: usize) -> Vec<ClientRecord> {
        let created = Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| ClientRecord {
                id: Uuid::new_v4(),
                name: format!("client {i}"),
                mobile: None,
                status: ClientStatus::Lead,
                interested_project_id: None,
                created_at: created + chrono::Duration::seconds(i as i64),
                updated_at: None,
            })
            .collect()
    }

    fn first_week() -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn sales_report_covers_only_assigned_clients() {
        let store = Arc::new(InMemoryStore::new());
        let config = config();
        let me = Uuid::new_v4();
        let created = Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap();
        let day = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();

        let clients = clients(4);
        store.seed_records(Table::Clients, &clients).unwrap();
        let assignments: Vec<AssignmentRecord> = clients[..3]
            .iter()
            .map(|c| AssignmentRecord {
                client_id: c.id,
                employee_id: me,
                assigned_at: created,
                assigned_by: None,
            })
            .collect();
        store.seed_records(Table::ClientAssignments, &assignments).unwrap();
        // Client 3 is visited but outside this employee's territory.
        let visits: Vec<VisitRecord> = [&clients[0], &clients[3]]
            .iter()
            .map(|c| VisitRecord {
                id: Uuid::new_v4(),
                client_id: c.id,
                employee_id: Some(me),
                created_at: day,
            })
            .collect();
        store.seed_records(Table::Visits, &visits).unwrap();

        let report =
            WorkReport::build(store, &config, &Actor::new(me, Role::Sales), &first_week(), None)
                .await;

        assert_eq!(report.client_count, 3);
        assert_eq!(report.touched_count, 1);
        assert_eq!(report.untouched_count, 2);
        assert_eq!(report.by_source[&ActivitySource::Visit], 1);
        assert_eq!(report.by_source[&ActivitySource::Sale], 0);
        assert!(!report.degraded);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["by_source"]["visit"], 1);
        assert!(json.get("employee_id").is_none());
    }

    #[tokio::test]
    async fn interrupted_scope_marks_activity_degraded() {
        let store = Arc::new(InMemoryStore::new());
        let config = config();
        store.seed_records(Table::Clients, &clients(1200)).unwrap();
        // The second client page fails, leaving 1000 of 1200 clients listed.
        store.fail_nth(StoreOperation::Select, 2);

        let listing = ClientListing::new(store.clone(), &config);
        let admin = Actor::new(Uuid::new_v4(), Role::Admin);
        let visible = VisibleClients::resolve(&listing, &admin, &BTreeSet::new()).await;
        assert!(!visible.is_complete());
        assert_eq!(visible.ids.len(), 1000);

        let activity = ActivityAggregator::new(store, &config)
            .aggregate(&visible.ids, &first_week(), None)
            .await;
        assert!(!activity.is_degraded());

        let summary = ActivitySummary::new(&visible, activity);
        assert!(summary.degraded);
        assert!(!summary.scope_complete);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["degraded"], true);
        assert_eq!(json["client_count"], 1000);
        assert_eq!(json["failed_queries"], 0);
    }

    #[tokio::test]
    async fn requested_clients_are_narrowed_to_scope() {
        let store = Arc::new(InMemoryStore::new());
        let me = Uuid::new_v4();
        let all = clients(3);
        store.seed_records(Table::Clients, &all).unwrap();
        store
            .seed_records(
                Table::ClientAssignments,
                &[AssignmentRecord {
                    client_id: all[0].id,
                    employee_id: me,
                    assigned_at: Utc::now(),
                    assigned_by: None,
                }],
            )
            .unwrap();

        let listing = ClientListing::new(store, &config());
        let requested = BTreeSet::from([all[0].id, all[1].id]);
        let visible =
            VisibleClients::resolve(&listing, &Actor::new(me, Role::Sales), &requested).await;

        assert!(visible.is_complete());
        assert_eq!(visible.ids, BTreeSet::from([all[0].id]));
    }
}
