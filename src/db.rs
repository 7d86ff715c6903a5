use anyhow::Context;
use rusqlite::Connection;
use std::path::Path;

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        // Enable WAL mode for crash safety
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn migrate(&self) -> anyhow::Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
-- One row per tool invocation
CREATE TABLE IF NOT EXISTS rebalance_attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    attempted_at REAL NOT NULL,
    target_chan_id TEXT NOT NULL,
    in_alias TEXT NOT NULL,
    out_alias TEXT NOT NULL,
    amount_sats INTEGER NOT NULL,
    fee_sats INTEGER,
    succeeded INTEGER NOT NULL,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_rebalance_attempts_target
    ON rebalance_attempts(target_chan_id, attempted_at);

-- Totals of each completed invocation
CREATE TABLE IF NOT EXISTS rebalance_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    finished_at REAL NOT NULL,
    duration_secs REAL NOT NULL,
    total_attempts INTEGER NOT NULL,
    total_amount_sats INTEGER NOT NULL,
    total_fees_sats INTEGER NOT NULL
);
"#;
