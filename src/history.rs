use crate::db::Database;
use crate::rebalancer::executor::RebalanceRequest;
use crate::rebalancer::session::RebalanceSession;
use crate::selector::EligibleChannel;

/// Aggregates over every recorded attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryTotals {
    pub attempts: u64,
    pub succeeded: u64,
    /// Only successful attempts move liquidity.
    pub amount_sats: u64,
    pub fees_sats: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRow {
    pub attempted_at: i64,
    pub out_alias: String,
    pub in_alias: String,
    pub amount_sats: u64,
    pub fee_sats: Option<u64>,
    pub error: Option<String>,
}

fn now() -> f64 {
    chrono::Utc::now().timestamp() as f64
}

/// A `None` error marks the attempt successful.
pub fn record_attempt(
    db: &Database,
    target: &EligibleChannel,
    request: &RebalanceRequest,
    fee_sats: Option<u64>,
    error: Option<&str>,
) -> anyhow::Result<()> {
    db.conn().execute(
        "INSERT INTO rebalance_attempts \
         (attempted_at, target_chan_id, in_alias, out_alias, amount_sats, fee_sats, succeeded, error) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            now(),
            target.channel.chan_id,
            request.in_alias,
            request.out_alias,
            request.amount_sats,
            fee_sats,
            error.is_none(),
            error,
        ],
    )?;
    Ok(())
}

pub fn record_session(db: &Database, session: &RebalanceSession) -> anyhow::Result<()> {
    db.conn().execute(
        "INSERT INTO rebalance_sessions \
         (finished_at, duration_secs, total_attempts, total_amount_sats, total_fees_sats) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            now(),
            session.elapsed().as_secs_f64(),
            session.total_attempts,
            session.total_amount_moved,
            session.total_fees_spent,
        ],
    )?;
    Ok(())
}

pub fn totals(db: &Database) -> anyhow::Result<HistoryTotals> {
    let totals = db.conn().query_row(
        "SELECT COUNT(*), \
         COALESCE(SUM(succeeded), 0), \
         COALESCE(SUM(CASE WHEN succeeded THEN amount_sats ELSE 0 END), 0), \
         COALESCE(SUM(fee_sats), 0) \
         FROM rebalance_attempts",
        [],
        |row| {
            Ok(HistoryTotals {
                attempts: row.get(0)?,
                succeeded: row.get(1)?,
                amount_sats: row.get(2)?,
                fees_sats: row.get(3)?,
            })
        },
    )?;
    Ok(totals)
}

/// Most recent attempts first.
pub fn recent_attempts(db: &Database, limit: usize) -> anyhow::Result<Vec<AttemptRow>> {
    let mut stmt = db.conn().prepare(
        "SELECT attempted_at, out_alias, in_alias, amount_sats, fee_sats, error \
         FROM rebalance_attempts ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit as i64], |row| {
            Ok(AttemptRow {
                attempted_at: row.get::<_, f64>(0)? as i64,
                out_alias: row.get(1)?,
                in_alias: row.get(2)?,
                amount_sats: row.get(3)?,
                fee_sats: row.get(4)?,
                error: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;

    fn target() -> EligibleChannel {
        EligibleChannel {
            channel: Channel {
                chan_id: "812345".to_string(),
                ..Default::default()
            },
            alias: "Sink".to_string(),
        }
    }

    fn request(amount: u64) -> RebalanceRequest {
        RebalanceRequest {
            amount_sats: amount,
            out_alias: "Source".to_string(),
            in_alias: "Sink".to_string(),
            fee_limit: None,
            avoid: Vec::new(),
            node: None,
        }
    }

    #[test]
    fn test_empty_totals() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(totals(&db).unwrap(), HistoryTotals::default());
        assert!(recent_attempts(&db, 5).unwrap().is_empty());
    }

    #[test]
    fn test_totals_count_failures_but_not_their_amount() {
        let db = Database::open_in_memory().unwrap();
        record_attempt(&db, &target(), &request(50_000), Some(12), None).unwrap();
        record_attempt(&db, &target(), &request(70_000), Some(30), None).unwrap();
        record_attempt(&db, &target(), &request(50_000), None, Some("NoRoute")).unwrap();

        let t = totals(&db).unwrap();
        assert_eq!(t.attempts, 3);
        assert_eq!(t.succeeded, 2);
        assert_eq!(t.amount_sats, 120_000);
        assert_eq!(t.fees_sats, 42);
    }

    #[test]
    fn test_recent_attempts_newest_first() {
        let db = Database::open_in_memory().unwrap();
        record_attempt(&db, &target(), &request(1), Some(1), None).unwrap();
        record_attempt(&db, &target(), &request(2), None, Some("boom")).unwrap();

        let rows = recent_attempts(&db, 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].amount_sats, 2);
        assert_eq!(rows[0].error.as_deref(), Some("boom"));
        assert_eq!(rows[0].fee_sats, None);
        assert_eq!(rows[1].fee_sats, Some(1));

        assert_eq!(recent_attempts(&db, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_record_session() {
        let db = Database::open_in_memory().unwrap();
        let mut session = RebalanceSession::start();
        session.record_success(50_000, 7);
        record_session(&db, &session).unwrap();

        let (attempts, fees): (i64, i64) = db
            .conn()
            .query_row(
                "SELECT total_attempts, total_fees_sats FROM rebalance_sessions",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!((attempts, fees), (1, 7));
    }
}
