//! Schema for the libSQL backend.
//!
//! Timestamps are stored as TEXT in the fixed-width form produced by
//! `db::fmt_ts`; the store never fills them in itself, so lexicographic
//! comparison matches chronological order.

pub const SCHEMA_VERSION: i64 = 1;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    code TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS clients (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    mobile TEXT,
    status TEXT NOT NULL CHECK (status IN ('lead', 'reserved', 'visited', 'converted')),
    interested_project_id TEXT REFERENCES projects(id),
    created_at TEXT NOT NULL,
    updated_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_clients_created ON clients(created_at, id);
CREATE INDEX IF NOT EXISTS idx_clients_project ON clients(interested_project_id);

CREATE TABLE IF NOT EXISTS employee_projects (
    employee_id TEXT NOT NULL,
    project_id TEXT NOT NULL REFERENCES projects(id),
    created_at TEXT NOT NULL,
    UNIQUE (employee_id, project_id)
);

CREATE TABLE IF NOT EXISTS client_assignments (
    client_id TEXT NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
    employee_id TEXT NOT NULL,
    assigned_at TEXT NOT NULL,
    assigned_by TEXT,
    UNIQUE (client_id, employee_id)
);
CREATE INDEX IF NOT EXISTS idx_client_assignments_employee ON client_assignments(employee_id);

CREATE TABLE IF NOT EXISTS client_followups (
    id TEXT PRIMARY KEY,
    client_id TEXT NOT NULL,
    employee_id TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_client_followups_client ON client_followups(client_id, created_at);

CREATE TABLE IF NOT EXISTS reservations (
    id TEXT PRIMARY KEY,
    client_id TEXT NOT NULL,
    employee_id TEXT,
    created_at TEXT NOT NULL,
    status TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_reservations_client ON reservations(client_id, created_at);

CREATE TABLE IF NOT EXISTS reservation_notes (
    id TEXT PRIMARY KEY,
    reservation_id TEXT NOT NULL REFERENCES reservations(id) ON DELETE CASCADE,
    created_by TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_reservation_notes_reservation ON reservation_notes(reservation_id, created_at);

CREATE TABLE IF NOT EXISTS sales (
    id TEXT PRIMARY KEY,
    client_id TEXT NOT NULL,
    sales_employee_id TEXT,
    created_at TEXT NOT NULL,
    price TEXT
);
CREATE INDEX IF NOT EXISTS idx_sales_client ON sales(client_id, created_at);

CREATE TABLE IF NOT EXISTS visits (
    id TEXT PRIMARY KEY,
    client_id TEXT NOT NULL,
    employee_id TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_visits_client ON visits(client_id, created_at);
"#;
