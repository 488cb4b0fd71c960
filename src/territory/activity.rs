//! "Was this client worked on?" across five activity sources.
//!
//! Follow-ups, reservations, sales and visits reference their client
//! directly and are queried by `client_id` chunk within the window.
//! Reservation notes only reference a reservation, so they take two hops:
//! every reservation of the requested clients is read regardless of when it
//! was created, then notes on those reservations are read within the window
//! and mapped back to clients. A reservation opened before the window that
//! receives a note inside it therefore still counts.
//!
//! The five sources run concurrently. Reads within one source are
//! sequential. A failed read is logged and under-counts the report; it never
//! fails the aggregation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::TerritoryConfig;
use crate::db::{
    ClientId, EmployeeId, Filter, FollowUpRecord, ReservationId, ReservationNoteRecord,
    ReservationRecord, SaleRecord, Select, TabularStore, Table, VisitRecord,
};
use crate::territory::chunking::fetch_chunked;
use crate::territory::pager::PageOptions;
use crate::territory::window::TimeWindow;

/// Kind of activity that marks a client as touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySource {
    FollowUp,
    Reservation,
    Sale,
    Visit,
    ReservationNote,
}

impl ActivitySource {
    pub const ALL: [ActivitySource; 5] = [
        ActivitySource::FollowUp,
        ActivitySource::Reservation,
        ActivitySource::Sale,
        ActivitySource::Visit,
        ActivitySource::ReservationNote,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FollowUp => "follow_up",
            Self::Reservation => "reservation",
            Self::Sale => "sale",
            Self::Visit => "visit",
            Self::ReservationNote => "reservation_note",
        }
    }

    pub fn table(self) -> Table {
        match self {
            Self::FollowUp => Table::ClientFollowups,
            Self::Reservation => Table::Reservations,
            Self::Sale => Table::Sales,
            Self::Visit => Table::Visits,
            Self::ReservationNote => Table::ReservationNotes,
        }
    }

    /// Column naming the employee who performed the activity.
    pub fn employee_column(self) -> &'static str {
        match self {
            Self::Sale => "sales_employee_id",
            Self::ReservationNote => "created_by",
            Self::FollowUp | Self::Reservation | Self::Visit => "employee_id",
        }
    }
}

impl std::fmt::Display for ActivitySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One activity record, tagged by source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ActivityEvent {
    FollowUp(FollowUpRecord),
    Reservation(ReservationRecord),
    Sale(SaleRecord),
    Visit(VisitRecord),
    /// Note with the client resolved through its reservation.
    ReservationNote {
        note: ReservationNoteRecord,
        client_id: ClientId,
    },
}

impl ActivityEvent {
    pub fn source(&self) -> ActivitySource {
        match self {
            Self::FollowUp(_) => ActivitySource::FollowUp,
            Self::Reservation(_) => ActivitySource::Reservation,
            Self::Sale(_) => ActivitySource::Sale,
            Self::Visit(_) => ActivitySource::Visit,
            Self::ReservationNote { .. } => ActivitySource::ReservationNote,
        }
    }

    pub fn client_id(&self) -> ClientId {
        match self {
            Self::FollowUp(r) => r.client_id,
            Self::Reservation(r) => r.client_id,
            Self::Sale(r) => r.client_id,
            Self::Visit(r) => r.client_id,
            Self::ReservationNote { client_id, .. } => *client_id,
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            Self::FollowUp(r) => r.created_at,
            Self::Reservation(r) => r.created_at,
            Self::Sale(r) => r.created_at,
            Self::Visit(r) => r.created_at,
            Self::ReservationNote { note, .. } => note.created_at,
        }
    }

    pub fn employee_id(&self) -> Option<EmployeeId> {
        match self {
            Self::FollowUp(r) => r.employee_id,
            Self::Reservation(r) => r.employee_id,
            Self::Sale(r) => r.sales_employee_id,
            Self::Visit(r) => r.employee_id,
            Self::ReservationNote { note, .. } => note.created_by,
        }
    }
}

/// Touched clients per source and overall.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityReport {
    pub per_source: BTreeMap<ActivitySource, BTreeSet<ClientId>>,
    pub touched: BTreeSet<ClientId>,
    /// Chunk reads that failed; non-zero means counts may be low.
    pub failed_queries: usize,
}

impl Default for ActivityReport {
    fn default() -> Self {
        Self {
            per_source: ActivitySource::ALL
                .into_iter()
                .map(|source| (source, BTreeSet::new()))
                .collect(),
            touched: BTreeSet::new(),
            failed_queries: 0,
        }
    }
}

impl ActivityReport {
    pub fn count(&self, source: ActivitySource) -> usize {
        self.per_source.get(&source).map_or(0, BTreeSet::len)
    }

    pub fn touched_count(&self) -> usize {
        self.touched.len()
    }

    pub fn is_degraded(&self) -> bool {
        self.failed_queries > 0
    }

    fn absorb(&mut self, source: SourceEvents) {
        self.failed_queries += source.failed;
        let clients = self.per_source.entry(source.source).or_default();
        for event in &source.events {
            clients.insert(event.client_id());
            self.touched.insert(event.client_id());
        }
    }
}

/// Events read from one source.
struct SourceEvents {
    source: ActivitySource,
    events: Vec<ActivityEvent>,
    failed: usize,
}

/// Reads activity for a client set across all sources.
pub struct ActivityAggregator {
    store: Arc<dyn TabularStore>,
    chunk_size: usize,
    page: PageOptions,
}

impl ActivityAggregator {
    pub fn new(store: Arc<dyn TabularStore>, config: &TerritoryConfig) -> Self {
        Self {
            store,
            chunk_size: config.chunk_size,
            page: config.page_options(),
        }
    }

    /// Per-source and union counts of clients with activity in `window`,
    /// optionally restricted to activity performed by `employee`.
    pub async fn aggregate(
        &self,
        client_ids: &BTreeSet<ClientId>,
        window: &TimeWindow,
        employee: Option<EmployeeId>,
    ) -> ActivityReport {
        let mut report = ActivityReport::default();
        for source in self.collect(client_ids, window, employee).await {
            report.absorb(source);
        }
        tracing::debug!(
            clients = client_ids.len(),
            touched = report.touched_count(),
            failed_queries = report.failed_queries,
            "activity aggregated"
        );
        if report.is_degraded() {
            tracing::warn!(
                failed_queries = report.failed_queries,
                "activity report is incomplete"
            );
        }
        report
    }

    /// The activity records themselves, oldest first.
    pub async fn events(
        &self,
        client_ids: &BTreeSet<ClientId>,
        window: &TimeWindow,
        employee: Option<EmployeeId>,
    ) -> Vec<ActivityEvent> {
        let mut events: Vec<ActivityEvent> = self
            .collect(client_ids, window, employee)
            .await
            .into_iter()
            .flat_map(|source| source.events)
            .collect();
        events.sort_by_key(|event| (event.occurred_at(), event.source()));
        events
    }

    async fn collect(
        &self,
        client_ids: &BTreeSet<ClientId>,
        window: &TimeWindow,
        employee: Option<EmployeeId>,
    ) -> Vec<SourceEvents> {
        if client_ids.is_empty() || window.is_empty() {
            return Vec::new();
        }
        let ids: Vec<ClientId> = client_ids.iter().copied().collect();

        let (follow_ups, reservations, sales, visits, notes) = futures::join!(
            self.direct(ActivitySource::FollowUp, &ids, window, employee, ActivityEvent::FollowUp),
            self.direct(
                ActivitySource::Reservation,
                &ids,
                window,
                employee,
                ActivityEvent::Reservation
            ),
            self.direct(ActivitySource::Sale, &ids, window, employee, ActivityEvent::Sale),
            self.direct(ActivitySource::Visit, &ids, window, employee, ActivityEvent::Visit),
            self.reservation_notes(&ids, window, employee),
        );
        vec![follow_ups, reservations, sales, visits, notes]
    }

    /// Source with a `client_id` column: window and employee filters plus
    /// chunked client membership.
    async fn direct<T: DeserializeOwned>(
        &self,
        source: ActivitySource,
        client_ids: &[ClientId],
        window: &TimeWindow,
        employee: Option<EmployeeId>,
        wrap: fn(T) -> ActivityEvent,
    ) -> SourceEvents {
        let mut base = Select::new(source.table()).filter(window.filter("created_at"));
        if let Some(employee) = employee {
            base = base.filter(Filter::eq(source.employee_column(), employee));
        }

        let chunked = fetch_chunked::<T>(
            self.store.as_ref(),
            &base,
            "client_id",
            client_ids,
            self.chunk_size,
            &self.page,
        )
        .await;

        SourceEvents {
            source,
            events: chunked.rows.into_iter().map(wrap).collect(),
            failed: chunked.failed_chunks,
        }
    }

    async fn reservation_notes(
        &self,
        client_ids: &[ClientId],
        window: &TimeWindow,
        employee: Option<EmployeeId>,
    ) -> SourceEvents {
        let source = ActivitySource::ReservationNote;

        // Reservations of these clients, regardless of creation time or
        // author.
        let reservations = fetch_chunked::<ReservationRecord>(
            self.store.as_ref(),
            &Select::new(Table::Reservations),
            "client_id",
            client_ids,
            self.chunk_size,
            &self.page,
        )
        .await;
        let owner: HashMap<ReservationId, ClientId> = reservations
            .rows
            .iter()
            .map(|r| (r.id, r.client_id))
            .collect();
        let mut failed = reservations.failed_chunks;

        if owner.is_empty() {
            return SourceEvents {
                source,
                events: Vec::new(),
                failed,
            };
        }

        let reservation_ids: Vec<ReservationId> = reservations.rows.iter().map(|r| r.id).collect();
        let mut base = Select::new(Table::ReservationNotes).filter(window.filter("created_at"));
        if let Some(employee) = employee {
            base = base.filter(Filter::eq(source.employee_column(), employee));
        }
        let notes = fetch_chunked::<ReservationNoteRecord>(
            self.store.as_ref(),
            &base,
            "reservation_id",
            &reservation_ids,
            self.chunk_size,
            &self.page,
        )
        .await;
        failed += notes.failed_chunks;

        let events = notes
            .rows
            .into_iter()
            .filter_map(|note| {
                owner
                    .get(&note.reservation_id)
                    .map(|client_id| ActivityEvent::ReservationNote {
                        client_id: *client_id,
                        note,
                    })
            })
            .collect();

        SourceEvents {
            source,
            events,
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use super::*;
    use crate::db::memory::{InMemoryStore, StoreOperation};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    fn week() -> TimeWindow {
        TimeWindow::new(at(2024, 1, 1, 0, 0, 0), at(2024, 1, 8, 0, 0, 0)).unwrap()
    }

    fn setup() -> (Arc<InMemoryStore>, ActivityAggregator) {
        let store = Arc::new(InMemoryStore::new());
        let config = TerritoryConfig {
            page_delay: Duration::ZERO,
            ..TerritoryConfig::default()
        };
        let aggregator = ActivityAggregator::new(store.clone(), &config);
        (store, aggregator)
    }

    fn follow_up(client_id: Uuid, created_at: DateTime<Utc>) -> FollowUpRecord {
        FollowUpRecord {
            id: Uuid::new_v4(),
            client_id,
            employee_id: None,
            created_at,
        }
    }

    fn reservation(client_id: Uuid, created_at: DateTime<Utc>) -> ReservationRecord {
        ReservationRecord {
            id: Uuid::new_v4(),
            client_id,
            employee_id: None,
            created_at,
            status: "active".to_string(),
        }
    }

    fn note(reservation_id: Uuid, created_at: DateTime<Utc>) -> ReservationNoteRecord {
        ReservationNoteRecord {
            id: Uuid::new_v4(),
            reservation_id,
            created_by: None,
            created_at,
        }
    }

    fn sale(client_id: Uuid, employee: Option<Uuid>, created_at: DateTime<Utc>) -> SaleRecord {
        SaleRecord {
            id: Uuid::new_v4(),
            client_id,
            sales_employee_id: employee,
            created_at,
            price: Some(Decimal::new(250_000_00, 2)),
        }
    }

    fn visit(client_id: Uuid, created_at: DateTime<Utc>) -> VisitRecord {
        VisitRecord {
            id: Uuid::new_v4(),
            client_id,
            employee_id: None,
            created_at,
        }
    }

    #[tokio::test]
    async fn window_end_is_exclusive() {
        let (store, aggregator) = setup();
        let (inside, boundary) = (Uuid::new_v4(), Uuid::new_v4());
        store
            .seed_records(
                Table::ClientFollowups,
                &[
                    follow_up(inside, at(2024, 1, 7, 23, 59, 59)),
                    follow_up(boundary, at(2024, 1, 8, 0, 0, 0)),
                ],
            )
            .unwrap();

        let report = aggregator
            .aggregate(&BTreeSet::from([inside, boundary]), &week(), None)
            .await;

        assert_eq!(report.per_source[&ActivitySource::FollowUp], BTreeSet::from([inside]));
        assert_eq!(report.touched, BTreeSet::from([inside]));
    }

    #[tokio::test]
    async fn note_on_an_older_reservation_counts() {
        let (store, aggregator) = setup();
        let noted = Uuid::new_v4();
        let stale = Uuid::new_v4();

        let old = reservation(noted, at(2023, 11, 15, 9, 0, 0));
        let stale_reservation = reservation(stale, at(2023, 10, 1, 9, 0, 0));
        store
            .seed_records(Table::Reservations, &[old.clone(), stale_reservation.clone()])
            .unwrap();
        store
            .seed_records(
                Table::ReservationNotes,
                &[
                    note(old.id, at(2024, 1, 3, 12, 0, 0)),
                    note(stale_reservation.id, at(2023, 12, 31, 23, 59, 59)),
                ],
            )
            .unwrap();

        let report = aggregator
            .aggregate(&BTreeSet::from([noted, stale]), &week(), None)
            .await;

        assert_eq!(report.touched, BTreeSet::from([noted]));
        assert_eq!(report.count(ActivitySource::ReservationNote), 1);
        // The reservation itself predates the window.
        assert_eq!(report.count(ActivitySource::Reservation), 0);
    }

    #[tokio::test]
    async fn union_counts_each_client_once() {
        let (store, aggregator) = setup();
        let (a, b, c, untouched, outsider) = (
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
        );
        let day = at(2024, 1, 2, 10, 0, 0);
        store
            .seed_records(Table::ClientFollowups, &[follow_up(a, day), follow_up(a, day)])
            .unwrap();
        store.seed_records(Table::Visits, &[visit(a, day), visit(b, day)]).unwrap();
        store
            .seed_records(Table::Sales, &[sale(c, None, day), sale(outsider, None, day)])
            .unwrap();
        store.seed_records(Table::Reservations, &[reservation(b, day)]).unwrap();

        let report = aggregator
            .aggregate(&BTreeSet::from([a, b, c, untouched]), &week(), None)
            .await;

        assert_eq!(report.touched, BTreeSet::from([a, b, c]));
        assert_eq!(report.count(ActivitySource::FollowUp), 1);
        assert_eq!(report.count(ActivitySource::Visit), 2);
        assert_eq!(report.count(ActivitySource::Sale), 1);
        assert_eq!(report.count(ActivitySource::Reservation), 1);
        assert_eq!(report.count(ActivitySource::ReservationNote), 0);
        assert!(!report.is_degraded());
    }

    #[tokio::test]
    async fn employee_filter_uses_each_source_column() {
        let (store, aggregator) = setup();
        let me = Uuid::new_v4();
        let (mine, theirs, noted) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let day = at(2024, 1, 4, 10, 0, 0);
        store
            .seed_records(
                Table::Sales,
                &[sale(mine, Some(me), day), sale(theirs, Some(Uuid::new_v4()), day)],
            )
            .unwrap();
        // Reservation authored by someone else; the note is mine.
        let res = reservation(noted, day);
        store.seed_records(Table::Reservations, &[res.clone()]).unwrap();
        let mut my_note = note(res.id, day);
        my_note.created_by = Some(me);
        store.seed_records(Table::ReservationNotes, &[my_note]).unwrap();

        let report = aggregator
            .aggregate(&BTreeSet::from([mine, theirs, noted]), &week(), Some(me))
            .await;

        assert_eq!(report.per_source[&ActivitySource::Sale], BTreeSet::from([mine]));
        assert_eq!(report.per_source[&ActivitySource::ReservationNote], BTreeSet::from([noted]));
        assert_eq!(report.count(ActivitySource::Reservation), 0);
        assert_eq!(report.touched, BTreeSet::from([mine, noted]));
    }

    #[tokio::test]
    async fn empty_inputs_issue_no_queries() {
        let (store, aggregator) = setup();
        let instant = at(2024, 1, 1, 0, 0, 0);
        let empty_window = TimeWindow::new(instant, instant).unwrap();

        let none = aggregator.aggregate(&BTreeSet::new(), &week(), None).await;
        let zero = aggregator
            .aggregate(&BTreeSet::from([Uuid::new_v4()]), &empty_window, None)
            .await;

        assert_eq!(none, ActivityReport::default());
        assert_eq!(zero.touched_count(), 0);
        assert_eq!(zero.per_source.len(), 5);
        assert_eq!(store.total_calls(), 0);
    }

    #[tokio::test]
    async fn large_client_sets_are_chunked() {
        let (store, aggregator) = setup();
        let clients: Vec<Uuid> = (0..1200).map(|_| Uuid::new_v4()).collect();
        let day = at(2024, 1, 5, 8, 0, 0);
        let visits: Vec<VisitRecord> = clients.iter().map(|c| visit(*c, day)).collect();
        store.seed_records(Table::Visits, &visits).unwrap();

        let report = aggregator
            .aggregate(&clients.iter().copied().collect(), &week(), None)
            .await;

        assert_eq!(report.count(ActivitySource::Visit), 1200);
        assert_eq!(report.touched_count(), 1200);
        // Four direct sources and the reservation lookup, three chunks each.
        assert_eq!(store.call_count(StoreOperation::Select), 15);
    }

    #[tokio::test]
    async fn failed_query_degrades_the_report() {
        let (store, aggregator) = setup();
        let day = at(2024, 1, 3, 8, 0, 0);
        let clients: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        store.seed_records(Table::ClientFollowups, &[follow_up(clients[0], day)]).unwrap();
        store.seed_records(Table::Visits, &[visit(clients[1], day)]).unwrap();
        store.seed_records(Table::Sales, &[sale(clients[2], None, day)]).unwrap();
        let res = reservation(clients[3], at(2023, 6, 1, 0, 0, 0));
        store.seed_records(Table::Reservations, &[res.clone()]).unwrap();
        store.seed_records(Table::ReservationNotes, &[note(res.id, day)]).unwrap();
        store.fail_nth(StoreOperation::Select, 1);

        let report = aggregator
            .aggregate(&clients.iter().copied().collect(), &week(), None)
            .await;

        assert!(report.is_degraded());
        assert_eq!(report.failed_queries, 1);
        assert_eq!(report.touched_count(), 3);
    }

    #[tokio::test]
    async fn events_are_sorted_and_resolved() {
        let (store, aggregator) = setup();
        let client = Uuid::new_v4();
        let res = reservation(client, at(2023, 12, 1, 0, 0, 0));
        store.seed_records(Table::Reservations, &[res.clone()]).unwrap();
        store
            .seed_records(Table::ReservationNotes, &[note(res.id, at(2024, 1, 2, 0, 0, 0))])
            .unwrap();
        store
            .seed_records(Table::Visits, &[visit(client, at(2024, 1, 1, 12, 0, 0))])
            .unwrap();

        let events = aggregator.events(&BTreeSet::from([client]), &week(), None).await;

        let sources: Vec<ActivitySource> = events.iter().map(ActivityEvent::source).collect();
        assert_eq!(sources, vec![ActivitySource::Visit, ActivitySource::ReservationNote]);
        assert!(events.iter().all(|e| e.client_id() == client));
    }
}
