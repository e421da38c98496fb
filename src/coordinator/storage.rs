//! # Coordinator Storage Layer
//!
//! Optional SQLite persistence for tasks, results and per-client aggregate
//! counters. When enabled, successful results survive coordinator restarts:
//! the in-memory cache falls back to a storage lookup on miss.
//!
//! Schema:
//! - `tasks(task_id PK, gamer_id, peer_id, task_type, task_data, status,
//!    created_at, assigned_at, completed_at, cost_usd)`
//! - `results(result_id PK, task_id, result_data, processing_time_ms,
//!    created_at, expires_at)`
//! - `peers(peer_id PK, ip_address, connected_at, last_heartbeat,
//!    total_earned_usd, tasks_completed, is_active)`
//! - `gamers(gamer_id PK, ip_address, connected_at, last_activity,
//!    total_spent_usd, tasks_submitted, is_active)`
//!
//! `task_data` holds the canonical digest of `(payload, params)`; result
//! payloads are base64-encoded into `result_data`. A periodic sweep deletes
//! result rows with `expires_at < now`.

use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension};

use crate::common::messages::now_ts;

/// Aggregate totals reported by the stats loop.
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub total_tasks_completed: u64,
    pub total_revenue_usd: f64,
    pub active_peers: u64,
    pub active_gamers: u64,
}

/// SQLite-backed persistence, safe to share behind `Arc`.
pub struct Storage {
    conn: Mutex<Connection>,
    ttl_s: f64,
}

impl Storage {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open<P: AsRef<Path>>(path: P, ttl_s: u64) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                gamer_id TEXT NOT NULL,
                peer_id TEXT,
                task_type TEXT NOT NULL,
                task_data TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at REAL NOT NULL,
                assigned_at REAL,
                completed_at REAL,
                cost_usd REAL
            );
            CREATE TABLE IF NOT EXISTS results (
                result_id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                result_data TEXT NOT NULL,
                processing_time_ms REAL,
                created_at REAL NOT NULL,
                expires_at REAL NOT NULL,
                FOREIGN KEY (task_id) REFERENCES tasks(task_id)
            );
            CREATE TABLE IF NOT EXISTS peers (
                peer_id TEXT PRIMARY KEY,
                ip_address TEXT,
                connected_at REAL NOT NULL,
                last_heartbeat REAL NOT NULL,
                total_earned_usd REAL DEFAULT 0,
                tasks_completed INTEGER DEFAULT 0,
                is_active BOOLEAN DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS gamers (
                gamer_id TEXT PRIMARY KEY,
                ip_address TEXT,
                connected_at REAL NOT NULL,
                last_activity REAL NOT NULL,
                total_spent_usd REAL DEFAULT 0,
                tasks_submitted INTEGER DEFAULT 0,
                is_active BOOLEAN DEFAULT 1
            );",
        )?;
        info!("💾 Database initialized: {}", path.as_ref().display());
        Ok(Self {
            conn: Mutex::new(conn),
            ttl_s: ttl_s as f64,
        })
    }

    /// Record a newly submitted task as pending.
    pub fn store_task(
        &self,
        task_id: &str,
        gamer_id: &str,
        task_type: &str,
        digest: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO tasks
                 (task_id, gamer_id, task_type, task_data, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![task_id, gamer_id, task_type, digest, now_ts()],
        )?;
        Ok(())
    }

    /// Mark a task as assigned to a peer.
    pub fn assign_task(&self, task_id: &str, peer_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET peer_id = ?1, status = 'assigned', assigned_at = ?2
             WHERE task_id = ?3",
            params![peer_id, now_ts(), task_id],
        )?;
        Ok(())
    }

    /// Store a successful result and mark its task completed.
    pub fn store_result(
        &self,
        task_id: &str,
        result: &[u8],
        processing_time_ms: f64,
        cost_usd: f64,
    ) -> Result<()> {
        let now = now_ts();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO results
                 (task_id, result_data, processing_time_ms, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                task_id,
                BASE64.encode(result),
                processing_time_ms,
                now,
                now + self.ttl_s
            ],
        )?;
        conn.execute(
            "UPDATE tasks SET status = 'completed', completed_at = ?1, cost_usd = ?2
             WHERE task_id = ?3",
            params![now, cost_usd, task_id],
        )?;
        Ok(())
    }

    /// Mark a task as failed.
    pub fn fail_task(&self, task_id: &str, reason: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET status = ?1, completed_at = ?2 WHERE task_id = ?3",
            params![format!("failed:{}", reason), now_ts(), task_id],
        )?;
        Ok(())
    }

    /// Newest non-expired stored result matching a task's type and digest.
    /// Backs the in-memory cache across restarts.
    pub fn cached_result(&self, task_type: &str, digest: &str) -> Option<(Vec<u8>, f64)> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT r.result_data, r.processing_time_ms
                 FROM results r
                 JOIN tasks t ON r.task_id = t.task_id
                 WHERE t.task_type = ?1
                   AND t.task_data = ?2
                   AND r.expires_at > ?3
                   AND t.status = 'completed'
                 ORDER BY r.created_at DESC
                 LIMIT 1",
                params![task_type, digest, now_ts()],
                |row| {
                    let data: String = row.get(0)?;
                    let ms: f64 = row.get(1)?;
                    Ok((data, ms))
                },
            )
            .optional()
            .unwrap_or_else(|e| {
                warn!("❌ Error checking stored results: {}", e);
                None
            })?;

        match BASE64.decode(row.0.as_bytes()) {
            Ok(bytes) => Some((bytes, row.1)),
            Err(e) => {
                warn!("❌ Corrupt stored result dropped: {}", e);
                None
            }
        }
    }

    /// Register or refresh a peer row.
    pub fn register_peer(&self, peer_id: &str, ip_address: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO peers (peer_id, ip_address, connected_at, last_heartbeat)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(peer_id) DO UPDATE SET
                 connected_at = excluded.connected_at,
                 last_heartbeat = excluded.last_heartbeat,
                 is_active = 1",
            params![peer_id, ip_address, now_ts()],
        )?;
        Ok(())
    }

    /// Mark a peer row inactive after it disconnects or times out.
    pub fn deactivate_peer(&self, peer_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE peers SET is_active = 0 WHERE peer_id = ?1",
            params![peer_id],
        )?;
        Ok(())
    }

    /// Credit a peer for one completed task.
    pub fn update_peer_earnings(&self, peer_id: &str, amount: f64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE peers
             SET total_earned_usd = total_earned_usd + ?1,
                 tasks_completed = tasks_completed + 1,
                 last_heartbeat = ?2
             WHERE peer_id = ?3",
            params![amount, now_ts(), peer_id],
        )?;
        Ok(())
    }

    /// Register or refresh a gamer row.
    pub fn register_gamer(&self, gamer_id: &str, ip_address: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO gamers (gamer_id, ip_address, connected_at, last_activity)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(gamer_id) DO UPDATE SET
                 connected_at = excluded.connected_at,
                 last_activity = excluded.last_activity,
                 is_active = 1",
            params![gamer_id, ip_address, now_ts()],
        )?;
        Ok(())
    }

    /// Charge a gamer for one completed task.
    pub fn update_gamer_spending(&self, gamer_id: &str, amount: f64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE gamers
             SET total_spent_usd = total_spent_usd + ?1,
                 tasks_submitted = tasks_submitted + 1,
                 last_activity = ?2
             WHERE gamer_id = ?3",
            params![amount, now_ts(), gamer_id],
        )?;
        Ok(())
    }

    /// Aggregate totals for the stats loop.
    pub fn statistics(&self) -> StorageStats {
        let conn = self.conn.lock().unwrap();
        let totals = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(cost_usd), 0)
                 FROM tasks WHERE status = 'completed'",
                [],
                |row| Ok((row.get::<_, u64>(0)?, row.get::<_, f64>(1)?)),
            )
            .unwrap_or((0, 0.0));
        let active_peers = conn
            .query_row("SELECT COUNT(*) FROM peers WHERE is_active = 1", [], |r| {
                r.get::<_, u64>(0)
            })
            .unwrap_or(0);
        let active_gamers = conn
            .query_row("SELECT COUNT(*) FROM gamers WHERE is_active = 1", [], |r| {
                r.get::<_, u64>(0)
            })
            .unwrap_or(0);

        StorageStats {
            total_tasks_completed: totals.0,
            total_revenue_usd: totals.1,
            active_peers,
            active_gamers,
        }
    }

    /// Delete expired result rows; returns how many were removed.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM results WHERE expires_at < ?1", params![now_ts()])?;
        if deleted > 0 {
            info!("🧹 Cleaned up {} expired results", deleted);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_temp(ttl_s: u64) -> (tempfile::TempDir, Storage) {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("p2c2r.db"), ttl_s).unwrap();
        (dir, storage)
    }

    #[test]
    fn result_round_trip_through_tasks_join() {
        let (_dir, storage) = open_temp(3600);

        storage
            .store_task("t1", "gamer_1", "upscale", "digest_1")
            .unwrap();
        storage.assign_task("t1", "peer_1").unwrap();
        storage
            .store_result("t1", b"upscaled-bytes", 42.0, 0.0001)
            .unwrap();

        let (bytes, ms) = storage.cached_result("upscale", "digest_1").unwrap();
        assert_eq!(bytes, b"upscaled-bytes");
        assert_eq!(ms, 42.0);

        // Different digest or type: no hit.
        assert!(storage.cached_result("upscale", "digest_2").is_none());
        assert!(storage.cached_result("raytracing", "digest_1").is_none());
    }

    #[test]
    fn expired_results_are_invisible_and_swept() {
        let (_dir, storage) = open_temp(0);
        storage
            .store_task("t1", "gamer_1", "upscale", "digest_1")
            .unwrap();
        storage.store_result("t1", b"out", 5.0, 0.0).unwrap();

        assert!(storage.cached_result("upscale", "digest_1").is_none());
        assert_eq!(storage.cleanup_expired().unwrap(), 1);
        assert_eq!(storage.cleanup_expired().unwrap(), 0);
    }

    #[test]
    fn aggregate_counters_accumulate() {
        let (_dir, storage) = open_temp(3600);
        storage.register_peer("peer_1", "127.0.0.1").unwrap();
        storage.register_gamer("gamer_1", "127.0.0.1").unwrap();

        storage
            .store_task("t1", "gamer_1", "physics", "d1")
            .unwrap();
        storage.store_result("t1", b"out", 1000.0, 0.02).unwrap();
        storage.update_peer_earnings("peer_1", 0.01).unwrap();
        storage.update_gamer_spending("gamer_1", 0.02).unwrap();

        let stats = storage.statistics();
        assert_eq!(stats.total_tasks_completed, 1);
        assert!((stats.total_revenue_usd - 0.02).abs() < 1e-9);
        assert_eq!(stats.active_peers, 1);
        assert_eq!(stats.active_gamers, 1);

        storage.deactivate_peer("peer_1").unwrap();
        assert_eq!(storage.statistics().active_peers, 0);
    }

    #[test]
    fn failed_tasks_never_serve_cache_lookups() {
        let (_dir, storage) = open_temp(3600);
        storage
            .store_task("t1", "gamer_1", "physics", "d1")
            .unwrap();
        storage.fail_task("t1", "timeout").unwrap();
        assert!(storage.cached_result("physics", "d1").is_none());
    }
}
