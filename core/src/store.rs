//! SQLite persistence layer.
//!
//! RULE: Only store.rs talks to the database.
//! Components hand their records to the engine, which calls store
//! methods. Nothing else executes SQL.

use crate::{
    error::SpineResult,
    event::EventLogEntry,
    scenario::WhatIfResult,
    snapshot::BranchSnapshot,
    types::Tick,
};
use rusqlite::{params, Connection, OptionalExtension};

pub struct SpineStore {
    conn: Connection,
}

impl SpineStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &str) -> SpineResult<Self> {
        let conn = Connection::open(path)?;
        // WAL is ignored for :memory: databases.
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> SpineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> SpineResult<()> {
        self.conn.execute_batch(include_str!("../migrations/001_timespine.sql"))?;
        Ok(())
    }

    // ── Run ────────────────────────────────────────────────────

    pub fn insert_run(&self, run_id: &str, seed: u64, version: &str) -> SpineResult<()> {
        self.conn.execute(
            "INSERT INTO run (run_id, seed, version, started_at) VALUES (?1, ?2, ?3, ?4)",
            params![run_id, seed as i64, version, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn run_seed(&self, run_id: &str) -> SpineResult<Option<u64>> {
        let seed = self
            .conn
            .query_row("SELECT seed FROM run WHERE run_id = ?1", params![run_id], |row| {
                row.get::<_, i64>(0)
            })
            .optional()?;
        Ok(seed.map(|s| s as u64))
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> SpineResult<()> {
        self.conn.execute(
            "INSERT INTO event_log (run_id, tick, component, event_type, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.run_id,
                entry.tick as i64,
                entry.component,
                entry.event_type,
                entry.payload,
            ],
        )?;
        Ok(())
    }

    pub fn events_for_tick(&self, run_id: &str, tick: Tick) -> SpineResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, tick, component, event_type, payload
             FROM event_log WHERE run_id = ?1 AND tick = ?2
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![run_id, tick as i64], |row| {
                Ok(EventLogEntry {
                    id:         Some(row.get(0)?),
                    run_id:     row.get(1)?,
                    tick:       row.get::<_, i64>(2)? as u64,
                    component:  row.get(3)?,
                    event_type: row.get(4)?,
                    payload:    row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn event_count(&self, run_id: &str, event_type: &str) -> SpineResult<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM event_log WHERE run_id = ?1 AND event_type = ?2",
            params![run_id, event_type],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── Branch snapshots ───────────────────────────────────────

    pub fn save_branch_snapshot(
        &self,
        run_id: &str,
        tick: Tick,
        snapshot: &BranchSnapshot,
    ) -> SpineResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO branch_snapshot
             (run_id, branch_id, tick, branch_tick, entity_count, byte_size, snapshot_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                snapshot.branch_id,
                tick as i64,
                snapshot.tick as i64,
                snapshot.entity_count as i64,
                snapshot.byte_size as i64,
                serde_json::to_string(snapshot)?,
            ],
        )?;
        Ok(())
    }

    pub fn latest_branch_snapshot(
        &self,
        run_id: &str,
        branch_id: &str,
    ) -> SpineResult<Option<(Tick, BranchSnapshot)>> {
        let row = self
            .conn
            .query_row(
                "SELECT tick, snapshot_json FROM branch_snapshot
                 WHERE run_id = ?1 AND branch_id = ?2
                 ORDER BY tick DESC LIMIT 1",
                params![run_id, branch_id],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?)),
            )
            .optional()?;
        match row {
            Some((tick, json)) => Ok(Some((tick, serde_json::from_str(&json)?))),
            None => Ok(None),
        }
    }

    pub fn branch_snapshot_count(&self, run_id: &str) -> SpineResult<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM branch_snapshot WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── What-if results ────────────────────────────────────────

    pub fn save_what_if_result(&self, run_id: &str, result: &WhatIfResult) -> SpineResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO what_if_result
             (run_id, branch_id, scenario_name, completed_at_tick, overall_score, is_better, result_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                result.branch_id,
                result.scenario_name,
                result.completed_at_tick as i64,
                result.overall_score,
                result.is_better_than_baseline,
                serde_json::to_string(result)?,
            ],
        )?;
        Ok(())
    }

    pub fn what_if_result(&self, run_id: &str, branch_id: &str) -> SpineResult<Option<WhatIfResult>> {
        let json = self
            .conn
            .query_row(
                "SELECT result_json FROM what_if_result WHERE run_id = ?1 AND branch_id = ?2",
                params![run_id, branch_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Completed results, best score first.
    pub fn what_if_results(&self, run_id: &str) -> SpineResult<Vec<WhatIfResult>> {
        let mut stmt = self.conn.prepare(
            "SELECT result_json FROM what_if_result WHERE run_id = ?1
             ORDER BY overall_score DESC, branch_id ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(Into::into))
            .collect()
    }
}
