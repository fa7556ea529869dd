//! SQLite-backed customer and ticket store.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::models::{Customer, CustomerStatus, CustomerUpdate, OpenTicket, Priority, Ticket, TicketStatus};
use crate::error::{Error, Result};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS customers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        email TEXT,
        phone TEXT,
        status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active', 'disabled')),
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS tickets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        customer_id INTEGER NOT NULL,
        issue TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'open' CHECK(status IN ('open', 'in_progress', 'resolved')),
        priority TEXT NOT NULL DEFAULT 'medium' CHECK(priority IN ('low', 'medium', 'high')),
        created_at TEXT NOT NULL,
        FOREIGN KEY (customer_id) REFERENCES customers(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_customers_email ON customers(email);
    CREATE INDEX IF NOT EXISTS idx_tickets_customer_id ON tickets(customer_id);
    CREATE INDEX IF NOT EXISTS idx_tickets_status ON tickets(status);
"#;

const CUSTOMER_COLUMNS: &str = "id, name, email, phone, status, created_at, updated_at";
const TICKET_COLUMNS: &str = "id, customer_id, issue, status, priority, created_at";

/// Customer/ticket store. Cloning shares the same connection.
///
/// All access goes through one mutex-guarded connection and every write runs
/// in an immediate transaction, so writers touching the same row are
/// serialized and reads see the last committed write.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (and provision) a database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("sqlite open {}: {}", path.display(), e)))?;
        tracing::debug!("Opened customer database at {}", path.display());
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Storage(format!("sqlite init: {}", e)))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("database lock poisoned".to_string()))
    }

    /// Insert the reference data set unless customers already exist.
    /// Returns whether anything was inserted.
    pub fn seed_sample_data(&self) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: i64 = tx.query_row("SELECT COUNT(*) FROM customers", [], |r| r.get(0))?;
        if existing > 0 {
            tracing::debug!("Customer table already has {} rows, skipping seed", existing);
            return Ok(false);
        }

        let base = Utc::now() - Duration::days(30);
        let created = format_ts(base);
        for (id, name, email, phone, status) in SAMPLE_CUSTOMERS {
            tx.execute(
                "INSERT INTO customers (id, name, email, phone, status, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![id, name, email, phone, status, created],
            )?;
        }
        for (offset, (customer_id, issue, status, priority)) in SAMPLE_TICKETS.iter().enumerate() {
            let created = format_ts(base + Duration::hours(offset as i64 + 1));
            tx.execute(
                "INSERT INTO tickets (customer_id, issue, status, priority, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![customer_id, issue, status, priority, created],
            )?;
        }
        tx.commit()?;

        tracing::info!(
            "Seeded {} customers and {} tickets",
            SAMPLE_CUSTOMERS.len(),
            SAMPLE_TICKETS.len()
        );
        Ok(true)
    }

    pub fn get_customer(&self, customer_id: i64) -> Result<Customer> {
        let conn = self.conn()?;
        find_customer(&conn, customer_id)?
            .ok_or_else(|| customer_not_found(customer_id))
    }

    pub fn list_customers(&self, status: Option<CustomerStatus>, limit: u32) -> Result<Vec<Customer>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM customers WHERE (?1 IS NULL OR status = ?1) ORDER BY id LIMIT ?2",
            CUSTOMER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status, limit], customer_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Apply a partial update atomically and return the new record.
    pub fn update_customer(&self, customer_id: i64, update: &CustomerUpdate) -> Result<Customer> {
        if update.is_empty() {
            return Err(Error::Validation("no fields to update".to_string()));
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = find_customer(&tx, customer_id)?
            .ok_or_else(|| customer_not_found(customer_id))?;
        let updated_at = advance_timestamp(&current.updated_at);

        tx.execute(
            "UPDATE customers SET
                name = COALESCE(?1, name),
                email = COALESCE(?2, email),
                phone = COALESCE(?3, phone),
                status = COALESCE(?4, status),
                updated_at = ?5
             WHERE id = ?6",
            params![update.name, update.email, update.phone, update.status, updated_at, customer_id],
        )?;
        let customer = find_customer(&tx, customer_id)?
            .ok_or_else(|| customer_not_found(customer_id))?;
        tx.commit()?;

        tracing::debug!("Updated customer {} at {}", customer_id, customer.updated_at);
        Ok(customer)
    }

    /// Open a ticket. Fails with a referential error, persisting nothing, if
    /// the customer does not exist.
    pub fn create_ticket(&self, customer_id: i64, issue: &str, priority: Priority) -> Result<Ticket> {
        let issue = issue.trim();
        if issue.is_empty() {
            return Err(Error::Validation("issue must not be empty".to_string()));
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if find_customer(&tx, customer_id)?.is_none() {
            return Err(Error::Referential(format!(
                "ticket references customer {} which does not exist",
                customer_id
            )));
        }

        tx.execute(
            "INSERT INTO tickets (customer_id, issue, status, priority, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![customer_id, issue, TicketStatus::Open, priority, format_ts(Utc::now())],
        )?;
        let ticket_id = tx.last_insert_rowid();
        let ticket = tx.query_row(
            &format!("SELECT {} FROM tickets WHERE id = ?1", TICKET_COLUMNS),
            params![ticket_id],
            ticket_from_row,
        )?;
        tx.commit()?;

        tracing::info!("Created ticket {} for customer {} ({})", ticket.id, customer_id, priority);
        Ok(ticket)
    }

    /// All tickets of a customer, newest first.
    pub fn get_customer_history(&self, customer_id: i64) -> Result<Vec<Ticket>> {
        let conn = self.conn()?;
        if find_customer(&conn, customer_id)?.is_none() {
            return Err(customer_not_found(customer_id));
        }
        let sql = format!(
            "SELECT {} FROM tickets WHERE customer_id = ?1 ORDER BY created_at DESC, id DESC",
            TICKET_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![customer_id], ticket_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Customers holding at least one open or in-progress ticket.
    pub fn get_customers_with_open_tickets(&self) -> Result<Vec<Customer>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM customers c WHERE EXISTS (
                SELECT 1 FROM tickets t WHERE t.customer_id = c.id AND t.status IN ('open', 'in_progress')
             ) ORDER BY c.id",
            CUSTOMER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], customer_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Active customers holding at least `min_tickets` tickets.
    pub fn get_premium_customers(&self, min_tickets: u32) -> Result<Vec<Customer>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM customers c WHERE c.status = 'active' AND (
                SELECT COUNT(*) FROM tickets t WHERE t.customer_id = c.id
             ) >= ?1 ORDER BY c.id",
            CUSTOMER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![min_tickets], customer_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Customers whose name or email contains `query`.
    pub fn search_customers(&self, query: &str, limit: u32) -> Result<Vec<Customer>> {
        let conn = self.conn()?;
        let pattern = format!("%{}%", query.trim());
        let sql = format!(
            "SELECT {} FROM customers WHERE name LIKE ?1 OR email LIKE ?1 ORDER BY id LIMIT ?2",
            CUSTOMER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![pattern, limit], customer_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Open tickets, highest priority then newest first.
    pub fn get_open_tickets(&self, limit: u32) -> Result<Vec<OpenTicket>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT t.id, t.customer_id, t.issue, t.status, t.priority, t.created_at, c.name, c.email
             FROM tickets t JOIN customers c ON c.id = t.customer_id
             WHERE t.status = 'open'
             ORDER BY CASE t.priority WHEN 'high' THEN 0 WHEN 'medium' THEN 1 ELSE 2 END,
                      t.created_at DESC, t.id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(OpenTicket {
                ticket: ticket_from_row(row)?,
                customer_name: row.get(6)?,
                customer_email: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn find_customer(conn: &Connection, customer_id: i64) -> Result<Option<Customer>> {
    let sql = format!("SELECT {} FROM customers WHERE id = ?1", CUSTOMER_COLUMNS);
    Ok(conn
        .query_row(&sql, params![customer_id], customer_from_row)
        .optional()?)
}

fn customer_not_found(customer_id: i64) -> Error {
    Error::NotFound(format!("Customer with ID {} not found", customer_id))
}

fn customer_from_row(row: &Row<'_>) -> rusqlite::Result<Customer> {
    Ok(Customer {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        phone: row.get(3)?,
        status: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn ticket_from_row(row: &Row<'_>) -> rusqlite::Result<Ticket> {
    Ok(Ticket {
        id: row.get(0)?,
        customer_id: row.get(1)?,
        issue: row.get(2)?,
        status: row.get(3)?,
        priority: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A timestamp strictly after `previous`, normally now.
fn advance_timestamp(previous: &str) -> String {
    let now = Utc::now();
    match DateTime::parse_from_rfc3339(previous) {
        Ok(prev) => {
            let floor = prev.with_timezone(&Utc) + Duration::milliseconds(1);
            format_ts(now.max(floor))
        }
        Err(_) => format_ts(now),
    }
}

const SAMPLE_CUSTOMERS: &[(i64, &str, &str, &str, &str)] = &[
    (1, "John Doe", "john.doe@example.com", "+1-555-0101", "active"),
    (2, "Jane Smith", "jane.smith@example.com", "+1-555-0102", "active"),
    (3, "Bob Johnson", "bob.johnson@example.com", "+1-555-0103", "disabled"),
    (4, "Alice Williams", "alice.w@techcorp.com", "+1-555-0104", "active"),
    (5, "Test User 5", "user5@example.com", "+1-555-0005", "active"),
    (6, "Charlie Brown", "charlie.brown@email.com", "+1-555-0105", "active"),
    (7, "Diana Prince", "diana.prince@company.org", "+1-555-0106", "active"),
    (8, "Edward Norton", "e.norton@business.net", "+1-555-0107", "active"),
    (9, "Fiona Green", "fiona.green@startup.io", "+1-555-0108", "disabled"),
    (10, "George Miller", "george.m@enterprise.com", "+1-555-0109", "active"),
    (11, "Hannah Lee", "hannah.lee@global.com", "+1-555-0110", "active"),
    (12, "Isaac Newton", "isaac.n@science.edu", "+1-555-0111", "active"),
    (13, "Julia Roberts", "julia.r@movies.com", "+1-555-0112", "active"),
    (14, "Kevin Chen", "kevin.chen@tech.io", "+1-555-0113", "disabled"),
    (15, "Laura Martinez", "laura.m@solutions.com", "+1-555-0114", "active"),
    (16, "Michael Scott", "michael.scott@paper.com", "+1-555-0115", "active"),
    (12345, "Premium User", "premium@example.com", "+1-555-12345", "active"),
];

const SAMPLE_TICKETS: &[(i64, &str, &str, &str)] = &[
    (1, "Cannot login to account", "open", "high"),
    (4, "Database connection timeout errors", "in_progress", "high"),
    (7, "Payment processing failing for all transactions", "open", "high"),
    (10, "Critical security vulnerability found", "in_progress", "high"),
    (14, "Website completely down", "resolved", "high"),
    (12345, "Need help upgrading my account", "open", "medium"),
    (1, "Password reset not working", "in_progress", "medium"),
    (2, "Profile image upload fails", "resolved", "medium"),
    (5, "Email notifications not being received", "open", "medium"),
    (6, "Dashboard loading very slowly", "in_progress", "medium"),
    (9, "Export to CSV feature broken", "open", "medium"),
    (11, "Mobile app crashes on startup", "resolved", "medium"),
    (12, "Search functionality returning wrong results", "in_progress", "medium"),
    (15, "API rate limiting too restrictive", "open", "medium"),
    (2, "Billing question about invoice", "resolved", "low"),
    (2, "Feature request: dark mode", "open", "low"),
    (3, "Documentation outdated for API v2", "open", "low"),
    (5, "Typo in welcome email", "resolved", "low"),
    (6, "Request for additional language support", "open", "low"),
    (9, "Font size too small on settings page", "resolved", "low"),
    (11, "Feature request: export to PDF", "open", "low"),
    (12, "Color scheme suggestion for better contrast", "open", "low"),
    (14, "Request access to beta features", "in_progress", "low"),
    (15, "Question about pricing plans", "resolved", "low"),
    (4, "Feature request: integration with Slack", "open", "low"),
    (10, "Suggestion: add keyboard shortcuts", "open", "low"),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Store {
        let store = Store::open_in_memory().unwrap();
        assert!(store.seed_sample_data().unwrap());
        store
    }

    #[test]
    fn test_seed_is_idempotent() {
        let store = seeded();
        assert!(!store.seed_sample_data().unwrap());
        assert_eq!(store.list_customers(None, 100).unwrap().len(), 17);
    }

    #[test]
    fn test_get_customer() {
        let store = seeded();
        let customer = store.get_customer(5).unwrap();
        assert_eq!(customer.name, "Test User 5");
        assert_eq!(customer.status, CustomerStatus::Active);

        assert!(matches!(store.get_customer(999), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_list_customers_filters_and_limits() {
        let store = seeded();
        let disabled = store.list_customers(Some(CustomerStatus::Disabled), 10).unwrap();
        assert_eq!(disabled.iter().map(|c| c.id).collect::<Vec<_>>(), vec![3, 9, 14]);
        assert_eq!(store.list_customers(None, 10).unwrap().len(), 10);
    }

    #[test]
    fn test_update_customer_advances_updated_at() {
        let store = seeded();
        let before = store.get_customer(5).unwrap();
        let update = CustomerUpdate {
            email: Some("new@email.com".into()),
            ..Default::default()
        };

        let after = store.update_customer(5, &update).unwrap();
        assert_eq!(after.email.as_deref(), Some("new@email.com"));
        assert_eq!(after.name, before.name);
        assert!(after.updated_at > before.updated_at);

        let again = store.update_customer(5, &update).unwrap();
        assert!(again.updated_at > after.updated_at);
    }

    #[test]
    fn test_update_missing_customer() {
        let store = seeded();
        let update = CustomerUpdate {
            phone: Some("+1-555-0000".into()),
            ..Default::default()
        };
        assert!(matches!(store.update_customer(404, &update), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_create_ticket_referential_integrity() {
        let store = seeded();
        let before = store.get_open_tickets(100).unwrap().len();

        let err = store.create_ticket(424242, "Ghost ticket", Priority::High).unwrap_err();
        assert!(matches!(err, Error::Referential(_)));
        assert_eq!(store.get_open_tickets(100).unwrap().len(), before);
    }

    #[test]
    fn test_create_ticket() {
        let store = seeded();
        let ticket = store.create_ticket(12345, "Upgrade to premium plan", Priority::Medium).unwrap();
        assert_eq!(ticket.status, TicketStatus::Open);
        assert_eq!(ticket.customer_id, 12345);

        let history = store.get_customer_history(12345).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, ticket.id);
    }

    #[test]
    fn test_customer_history_newest_first() {
        let store = seeded();
        let history = store.get_customer_history(2).unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.windows(2).all(|w| w[0].created_at >= w[1].created_at));
        assert!(matches!(store.get_customer_history(999), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_open_ticket_customers() {
        let store = seeded();
        let ids: Vec<i64> = store
            .get_customers_with_open_tickets()
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert!(ids.contains(&5));
        assert!(ids.contains(&12345));
        // 13, 16 have no tickets; 8 has none either
        assert!(!ids.contains(&13));
        assert!(!ids.contains(&8));
    }

    #[test]
    fn test_premium_customers_are_active() {
        let store = seeded();
        let premium = store.get_premium_customers(2).unwrap();
        assert!(premium.iter().all(|c| c.status == CustomerStatus::Active));
        let ids: Vec<i64> = premium.iter().map(|c| c.id).collect();
        assert!(ids.contains(&2));
        assert!(!ids.contains(&9));
        assert!(!ids.contains(&12345));
    }

    #[test]
    fn test_search_customers() {
        let store = seeded();
        let found = store.search_customers("techcorp", 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Alice Williams");
    }

    #[test]
    fn test_open_tickets_ordering() {
        let store = seeded();
        let open = store.get_open_tickets(50).unwrap();
        assert!(open.iter().all(|t| t.ticket.status == TicketStatus::Open));
        assert_eq!(open[0].ticket.priority, Priority::High);
        assert_eq!(open.last().map(|t| t.ticket.priority), Some(Priority::Low));
    }

    #[test]
    fn test_concurrent_updates_do_not_merge() {
        let store = seeded();
        let a = CustomerUpdate {
            name: Some("Writer A".into()),
            email: Some("a@example.com".into()),
            ..Default::default()
        };
        let b = CustomerUpdate {
            name: Some("Writer B".into()),
            email: Some("b@example.com".into()),
            ..Default::default()
        };

        let handles: Vec<_> = [a, b]
            .into_iter()
            .map(|update| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        store.update_customer(7, &update).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let last = store.get_customer(7).unwrap();
        let pair = (last.name.as_str(), last.email.as_deref());
        assert!(
            pair == ("Writer A", Some("a@example.com")) || pair == ("Writer B", Some("b@example.com")),
            "merged state: {:?}",
            pair
        );
    }

    #[test]
    fn test_file_backed_store_persists() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("data").join("customers.db");
        {
            let store = Store::open(&path).unwrap();
            store.seed_sample_data().unwrap();
        }
        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.get_customer(12345).unwrap().name, "Premium User");
    }
}
