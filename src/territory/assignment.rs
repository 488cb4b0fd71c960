//! Territory assignment diffing and reconciliation.
//!
//! The operator supplies the full set of clients an employee should own. The
//! reconciler reads the persisted set fresh, diffs the two, and writes only
//! the difference: inserts first, then deletes, each in bounded chunks issued
//! strictly one after another. There is no transaction across chunks. A
//! failure leaves a prefix of the chunks applied and is reported with the
//! counts; running the same reconciliation again converges.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::config::TerritoryConfig;
use crate::db::{
    AssignmentRecord, ClientId, EmployeeId, Filter, Select, TabularStore, Table, to_row,
};
use crate::error::DatabaseError;
use crate::territory::audit::{self, ReconcileRun};
use crate::territory::chunking::{chunk_ids, effective_chunk_size, fetch_chunked};
use crate::territory::pager::{PageOptions, read_all};
use crate::territory::scope::{Actor, Role};

/// Minimal set of changes turning `persisted` into `desired`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssignmentDiff {
    pub to_add: Vec<ClientId>,
    pub to_remove: Vec<ClientId>,
}

impl AssignmentDiff {
    pub fn between(desired: &BTreeSet<ClientId>, persisted: &BTreeSet<ClientId>) -> Self {
        Self {
            to_add: desired.difference(persisted).copied().collect(),
            to_remove: persisted.difference(desired).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Desired and persisted already agree; nothing was written.
    NoChanges,
    Applied { added: usize, removed: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("role {role} may not change territory assignments")]
    Forbidden { role: Role },

    #[error("could not load current assignments of employee {employee_id}: {reason}")]
    LoadFailed {
        employee_id: EmployeeId,
        reason: String,
    },

    #[error(
        "reconciliation stopped after adding {applied_added}/{planned_added} and removing \
         {applied_removed}/{planned_removed} assignments: {source}"
    )]
    Partial {
        planned_added: usize,
        planned_removed: usize,
        applied_added: usize,
        applied_removed: usize,
        #[source]
        source: DatabaseError,
    },
}

/// Applies assignment diffs against a store.
pub struct AssignmentReconciler {
    store: Arc<dyn TabularStore>,
    chunk_size: usize,
    page: PageOptions,
}

impl AssignmentReconciler {
    pub fn new(store: Arc<dyn TabularStore>, config: &TerritoryConfig) -> Self {
        Self {
            store,
            chunk_size: config.chunk_size,
            page: config.page_options(),
        }
    }

    fn chunk_size(&self) -> usize {
        effective_chunk_size(self.chunk_size, self.store.limits())
    }

    /// Client ids currently assigned to `employee_id`.
    ///
    /// The read must be complete: diffing against a truncated set would
    /// re-insert rows that already exist.
    pub async fn persisted_for(
        &self,
        employee_id: EmployeeId,
    ) -> Result<BTreeSet<ClientId>, ReconcileError> {
        let select =
            Select::new(Table::ClientAssignments).filter(Filter::eq("employee_id", employee_id));
        let paged = read_all::<AssignmentRecord>(self.store.as_ref(), &select, &self.page).await;
        if let Some(reason) = paged.interrupted {
            return Err(ReconcileError::LoadFailed {
                employee_id,
                reason,
            });
        }
        Ok(paged.rows.into_iter().map(|a| a.client_id).collect())
    }

    /// Make `employee_id`'s assignments equal `desired`.
    ///
    /// `desired` is trusted to come from a listing already narrowed to the
    /// actor's scope; only the actor's role is checked here.
    pub async fn reconcile(
        &self,
        actor: &Actor,
        employee_id: EmployeeId,
        desired: &BTreeSet<ClientId>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if !actor.role.can_reconcile() {
            return Err(ReconcileError::Forbidden { role: actor.role });
        }

        let persisted = self.persisted_for(employee_id).await?;
        let diff = AssignmentDiff::between(desired, &persisted);
        if diff.is_empty() {
            tracing::debug!(%employee_id, assigned = persisted.len(), "assignments already up to date");
            return Ok(ReconcileOutcome::NoChanges);
        }

        tracing::info!(
            actor_id = %actor.id,
            %employee_id,
            before = persisted.len(),
            to_add = diff.to_add.len(),
            to_remove = diff.to_remove.len(),
            "reconciling assignments"
        );

        let mut applied_added = 0usize;
        let mut applied_removed = 0usize;
        let result = self
            .apply(actor, employee_id, &diff, &mut applied_added, &mut applied_removed)
            .await;

        let mut run = ReconcileRun {
            actor_id: actor.id,
            actor_role: actor.role,
            employee_id,
            before: persisted.len(),
            desired: desired.len(),
            planned_added: diff.to_add.len(),
            planned_removed: diff.to_remove.len(),
            applied_added,
            applied_removed,
            error: None,
        };

        match result {
            Ok(()) => {
                audit::record(&run);
                Ok(ReconcileOutcome::Applied {
                    added: applied_added,
                    removed: applied_removed,
                })
            }
            Err(source) => {
                tracing::warn!(
                    %employee_id,
                    applied_added,
                    applied_removed,
                    "reconciliation stopped partway: {}",
                    source
                );
                run.error = Some(source.to_string());
                audit::record(&run);
                Err(ReconcileError::Partial {
                    planned_added: diff.to_add.len(),
                    planned_removed: diff.to_remove.len(),
                    applied_added,
                    applied_removed,
                    source,
                })
            }
        }
    }

    async fn apply(
        &self,
        actor: &Actor,
        employee_id: EmployeeId,
        diff: &AssignmentDiff,
        applied_added: &mut usize,
        applied_removed: &mut usize,
    ) -> Result<(), DatabaseError> {
        let chunk_size = self.chunk_size();
        let assigned_at = Utc::now();

        for chunk in chunk_ids(&diff.to_add, chunk_size) {
            let rows = chunk
                .ids
                .iter()
                .map(|client_id| {
                    to_row(&AssignmentRecord {
                        client_id: *client_id,
                        employee_id,
                        assigned_at,
                        assigned_by: Some(actor.id),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            self.store.insert_rows(Table::ClientAssignments, &rows).await?;
            *applied_added += chunk.len();
            tracing::debug!(%employee_id, chunk = chunk.index, rows = chunk.len(), "assignment chunk inserted");
        }

        for chunk in chunk_ids(&diff.to_remove, chunk_size) {
            let filter = Filter::eq("employee_id", employee_id).and(chunk.filter("client_id"));
            let removed = self.store.delete_where(Table::ClientAssignments, &filter).await?;
            // Rows already gone (removed by another writer) are not counted.
            *applied_removed += usize::try_from(removed).unwrap_or(usize::MAX);
            tracing::debug!(%employee_id, chunk = chunk.index, removed, "assignment chunk deleted");
        }

        Ok(())
    }

    /// Employees assigned to each of `client_ids`. Best-effort: chunks that
    /// fail to read are logged and contribute nothing.
    pub async fn assignments_for_clients(
        &self,
        client_ids: &[ClientId],
    ) -> BTreeMap<ClientId, BTreeSet<EmployeeId>> {
        let chunked = fetch_chunked::<AssignmentRecord>(
            self.store.as_ref(),
            &Select::new(Table::ClientAssignments),
            "client_id",
            client_ids,
            self.chunk_size,
            &self.page,
        )
        .await;

        let mut by_client: BTreeMap<ClientId, BTreeSet<EmployeeId>> = BTreeMap::new();
        for assignment in chunked.rows {
            by_client
                .entry(assignment.client_id)
                .or_default()
                .insert(assignment.employee_id);
        }
        by_client
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    use super::*;
    use crate::db::from_row;
    use crate::db::memory::{InMemoryStore, StoreOperation};
    use crate::db::{Row, StoreLimits};
    use crate::territory::audit::captured_runs;

    fn config() -> TerritoryConfig {
        TerritoryConfig {
            page_delay: Duration::ZERO,
            ..TerritoryConfig::default()
        }
    }

    fn setup() -> (Arc<InMemoryStore>, AssignmentReconciler) {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = AssignmentReconciler::new(store.clone(), &config());
        (store, reconciler)
    }

    fn admin() -> Actor {
        Actor::new(Uuid::new_v4(), Role::Admin)
    }

    fn seed_assigned(store: &InMemoryStore, employee_id: EmployeeId, clients: &[ClientId]) {
        let rows: Vec<AssignmentRecord> = clients
            .iter()
            .map(|client_id| AssignmentRecord {
                client_id: *client_id,
                employee_id,
                assigned_at: Utc::now(),
                assigned_by: None,
            })
            .collect();
        store.seed_records(Table::ClientAssignments, &rows).unwrap();
    }

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn diff_adds_c_and_removes_b() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let diff = AssignmentDiff::between(&BTreeSet::from([a, c]), &BTreeSet::from([a, b]));
        assert_eq!(diff.to_add, vec![c]);
        assert_eq!(diff.to_remove, vec![b]);
        assert!(AssignmentDiff::between(&BTreeSet::from([a]), &BTreeSet::from([a])).is_empty());
    }

    #[tokio::test]
    async fn reconcile_applies_exactly_the_difference() {
        let (store, reconciler) = setup();
        let employee = Uuid::new_v4();
        let other = Uuid::new_v4();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        seed_assigned(&store, employee, &[a, b]);
        seed_assigned(&store, other, &[b]);
        let actor = admin();

        let outcome = reconciler
            .reconcile(&actor, employee, &BTreeSet::from([a, c]))
            .await
            .expect("reconcile");

        assert_eq!(outcome, ReconcileOutcome::Applied { added: 1, removed: 1 });
        assert_eq!(
            reconciler.persisted_for(employee).await.unwrap(),
            BTreeSet::from([a, c])
        );
        // The other employee's assignment of B is untouched.
        assert_eq!(reconciler.persisted_for(other).await.unwrap(), BTreeSet::from([b]));

        let inserted: AssignmentRecord = store
            .rows(Table::ClientAssignments)
            .into_iter()
            .map(|row| from_row::<AssignmentRecord>(row).unwrap())
            .find(|r| r.client_id == c)
            .expect("inserted row");
        assert_eq!(inserted.assigned_by, Some(actor.id));
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let (store, reconciler) = setup();
        let employee = Uuid::new_v4();
        seed_assigned(&store, employee, &ids(30));
        let desired: BTreeSet<Uuid> = ids(1200).into_iter().collect();

        reconciler.reconcile(&admin(), employee, &desired).await.expect("first run");
        store.reset_calls();
        let second = reconciler.reconcile(&admin(), employee, &desired).await.expect("second run");

        assert_eq!(second, ReconcileOutcome::NoChanges);
        assert_eq!(store.call_count(StoreOperation::Insert), 0);
        assert_eq!(store.call_count(StoreOperation::Delete), 0);
    }

    #[tokio::test]
    async fn writes_are_chunked_to_the_predicate_bound() {
        let (store, reconciler) = setup();
        let employee = Uuid::new_v4();
        let old = ids(1200);
        seed_assigned(&store, employee, &old);
        let desired: BTreeSet<Uuid> = ids(1001).into_iter().collect();

        let outcome = reconciler.reconcile(&admin(), employee, &desired).await.expect("reconcile");

        assert_eq!(outcome, ReconcileOutcome::Applied { added: 1001, removed: 1200 });
        assert_eq!(store.call_count(StoreOperation::Insert), 3);
        assert_eq!(store.call_count(StoreOperation::Delete), 3);
        assert_eq!(reconciler.persisted_for(employee).await.unwrap(), desired);
    }

    #[tokio::test]
    async fn partial_failure_reports_counts_and_rerun_converges() {
        let (store, reconciler) = setup();
        let employee = Uuid::new_v4();
        let stale = ids(10);
        seed_assigned(&store, employee, &stale);
        let desired: BTreeSet<Uuid> = ids(1200).into_iter().collect();
        store.fail_nth(StoreOperation::Insert, 2);

        let err = reconciler
            .reconcile(&admin(), employee, &desired)
            .await
            .expect_err("second insert chunk fails");
        let ReconcileError::Partial {
            planned_added,
            planned_removed,
            applied_added,
            applied_removed,
            ..
        } = err
        else {
            panic!("expected Partial, got {err:?}");
        };
        assert_eq!((planned_added, planned_removed), (1200, 10));
        assert_eq!((applied_added, applied_removed), (500, 0));
        assert_eq!(reconciler.persisted_for(employee).await.unwrap().len(), 510);

        let retry = reconciler.reconcile(&admin(), employee, &desired).await.expect("retry");
        assert_eq!(retry, ReconcileOutcome::Applied { added: 700, removed: 10 });
        assert_eq!(reconciler.persisted_for(employee).await.unwrap(), desired);

        let runs: Vec<ReconcileRun> = captured_runs()
            .into_iter()
            .filter(|run| run.employee_id == employee)
            .collect();
        let events: Vec<&str> = runs.iter().map(ReconcileRun::event_type).collect();
        assert_eq!(events, vec![audit::EVENT_RECONCILE_FAILED, audit::EVENT_RECONCILED]);
        assert_eq!((runs[0].applied_added, runs[0].planned_added), (500, 1200));
        assert!(runs[0].error.is_some());
        assert_eq!((runs[1].applied_added, runs[1].applied_removed), (700, 10));
    }

    /// Store where another writer deletes `raced` just before this
    /// reconciler's first delete lands.
    struct RacingStore {
        inner: Arc<InMemoryStore>,
        raced: std::sync::Mutex<Option<Filter>>,
    }

    #[async_trait::async_trait]
    impl TabularStore for RacingStore {
        fn limits(&self) -> StoreLimits {
            self.inner.limits()
        }

        async fn select_range(
            &self,
            select: &Select,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<Row>, DatabaseError> {
            self.inner.select_range(select, offset, limit).await
        }

        async fn insert_rows(&self, table: Table, rows: &[Row]) -> Result<u64, DatabaseError> {
            self.inner.insert_rows(table, rows).await
        }

        async fn delete_where(&self, table: Table, filter: &Filter) -> Result<u64, DatabaseError> {
            let raced = self.raced.lock().unwrap().take();
            if let Some(raced) = raced {
                self.inner.delete_where(table, &raced).await?;
            }
            self.inner.delete_where(table, filter).await
        }

        async fn unassigned_client_ids(&self) -> Result<Vec<ClientId>, DatabaseError> {
            self.inner.unassigned_client_ids().await
        }
    }

    #[tokio::test]
    async fn removed_count_excludes_rows_deleted_concurrently() {
        let inner = Arc::new(InMemoryStore::new());
        let employee = Uuid::new_v4();
        let stale = ids(4);
        seed_assigned(&inner, employee, &stale);
        let store = Arc::new(RacingStore {
            inner: inner.clone(),
            raced: std::sync::Mutex::new(Some(
                Filter::eq("employee_id", employee).and(Filter::is_in("client_id", [stale[0]])),
            )),
        });
        let reconciler = AssignmentReconciler::new(store, &config());

        let outcome = reconciler
            .reconcile(&admin(), employee, &BTreeSet::new())
            .await
            .expect("reconcile");

        assert_eq!(outcome, ReconcileOutcome::Applied { added: 0, removed: 3 });
        assert!(reconciler.persisted_for(employee).await.unwrap().is_empty());
        let run = captured_runs()
            .into_iter()
            .find(|run| run.employee_id == employee)
            .expect("audited run");
        assert_eq!((run.planned_removed, run.applied_removed), (4, 3));
    }

    #[tokio::test]
    async fn sales_cannot_reconcile() {
        let (store, reconciler) = setup();
        let actor = Actor::new(Uuid::new_v4(), Role::Sales);

        let err = reconciler
            .reconcile(&actor, actor.id, &BTreeSet::from([Uuid::new_v4()]))
            .await
            .expect_err("forbidden");

        assert!(matches!(err, ReconcileError::Forbidden { role: Role::Sales }));
        assert_eq!(store.total_calls(), 0);
    }

    #[tokio::test]
    async fn incomplete_persisted_read_aborts_before_writing() {
        let (store, reconciler) = setup();
        let employee = Uuid::new_v4();
        seed_assigned(&store, employee, &ids(3));
        store.fail_nth(StoreOperation::Select, 1);

        let err = reconciler
            .reconcile(&Actor::new(Uuid::new_v4(), Role::SalesManager), employee, &BTreeSet::new())
            .await
            .expect_err("load fails");

        assert!(matches!(err, ReconcileError::LoadFailed { .. }));
        assert_eq!(store.call_count(StoreOperation::Delete), 0);
    }

    #[tokio::test]
    async fn assignments_are_grouped_by_client() {
        let (store, reconciler) = setup();
        let (e1, e2) = (Uuid::new_v4(), Uuid::new_v4());
        let clients = ids(3);
        seed_assigned(&store, e1, &clients[..2]);
        seed_assigned(&store, e2, &clients[1..]);

        let grouped = reconciler.assignments_for_clients(&clients).await;

        assert_eq!(grouped[&clients[0]], BTreeSet::from([e1]));
        assert_eq!(grouped[&clients[1]], BTreeSet::from([e1, e2]));
        assert_eq!(grouped[&clients[2]], BTreeSet::from([e2]));
        assert!(reconciler.assignments_for_clients(&[]).await.is_empty());
    }
}
