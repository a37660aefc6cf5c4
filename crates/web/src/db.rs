//! Control-plane relational store: users, nodes, container types, quotas,
//! containers, file templates, and the audit log.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use skiff_common::{now_ts, Error, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Declared target state for a container; the single source of truth for
/// the reconciler. `status` is an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Stopped,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Running => "running",
            DesiredState::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "stopped" {
            DesiredState::Stopped
        } else {
            DesiredState::Running
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    #[serde(skip_serializing)]
    pub auth_token: String,
    pub active: bool,
    pub healthy: bool,
    pub heartbeat_at: Option<i64>,
    pub capacity_vcpus: i64,
    pub capacity_mem_mb: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerType {
    pub id: i64,
    pub name: String,
    pub vcpus: i64,
    pub memory_mb: i64,
    pub disk_gib: i64,
    pub credits_cost: i64,
    pub private: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Quota {
    pub user_id: i64,
    pub credits: i64,
    pub ai_use_per_day: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Container {
    pub id: i64,
    pub user_id: i64,
    pub node_id: i64,
    pub type_id: Option<i64>,
    pub name: String,
    /// VM id on the owning node.
    pub container_id: String,
    pub memory_mb: i64,
    pub vcpus: i64,
    pub disk_gib: i64,
    pub status: String,
    pub desired_state: DesiredState,
    pub first_start: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileTemplate {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub public: bool,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileTemplateItem {
    pub path: String,
    pub content: String,
    pub mode: u32,
    pub order: i64,
}

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        info!("Opened control-plane database at {:?}", path.as_ref());
        Ok(db)
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                token TEXT NOT NULL UNIQUE,
                is_admin INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS nodes (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                base_url TEXT NOT NULL,
                auth_token TEXT NOT NULL DEFAULT '',
                active INTEGER NOT NULL DEFAULT 1,
                healthy INTEGER NOT NULL DEFAULT 0,
                heartbeat_at INTEGER,
                capacity_vcpus INTEGER NOT NULL DEFAULT 4,
                capacity_mem_mb INTEGER NOT NULL DEFAULT 4096
            );

            CREATE TABLE IF NOT EXISTS container_types (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                vcpus INTEGER NOT NULL,
                memory_mb INTEGER NOT NULL,
                disk_gib INTEGER NOT NULL,
                credits_cost INTEGER NOT NULL DEFAULT 1,
                private INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS quotas (
                user_id INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                credits INTEGER NOT NULL DEFAULT 3,
                ai_use_per_day INTEGER NOT NULL DEFAULT 5
            );

            CREATE TABLE IF NOT EXISTS quota_allowed_types (
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                type_id INTEGER NOT NULL REFERENCES container_types(id) ON DELETE CASCADE,
                PRIMARY KEY (user_id, type_id)
            );

            CREATE TABLE IF NOT EXISTS containers (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                node_id INTEGER NOT NULL REFERENCES nodes(id),
                type_id INTEGER REFERENCES container_types(id),
                name TEXT NOT NULL DEFAULT '',
                container_id TEXT NOT NULL UNIQUE,
                memory_mb INTEGER NOT NULL,
                vcpus INTEGER NOT NULL,
                disk_gib INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'created',
                desired_state TEXT NOT NULL DEFAULT 'running',
                first_start INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_containers_user ON containers(user_id);
            CREATE INDEX IF NOT EXISTS idx_containers_node ON containers(node_id);

            CREATE TABLE IF NOT EXISTS file_templates (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                slug TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                public INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS file_template_items (
                id INTEGER PRIMARY KEY,
                template_id INTEGER NOT NULL REFERENCES file_templates(id) ON DELETE CASCADE,
                path TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                mode INTEGER NOT NULL DEFAULT 420,
                ord INTEGER NOT NULL DEFAULT 0,
                UNIQUE (template_id, path)
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY,
                user_id INTEGER,
                action TEXT NOT NULL,
                target_type TEXT NOT NULL DEFAULT '',
                target_id TEXT NOT NULL DEFAULT '',
                message TEXT NOT NULL DEFAULT '',
                metadata TEXT,
                success INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_log(created_at);
            "#,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    pub fn create_user(&self, username: &str, token: &str, is_admin: bool) -> Result<User> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (username, token, is_admin) VALUES (?1, ?2, ?3)",
            params![username, token, is_admin as i64],
        )?;
        let id = conn.last_insert_rowid();
        Ok(User {
            id,
            username: username.to_string(),
            is_admin,
        })
    }

    pub fn user_by_token(&self, token: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let user = conn
            .query_row(
                "SELECT id, username, is_admin FROM users WHERE token = ?1",
                params![token],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        is_admin: row.get::<_, i64>(2)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    pub fn user_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?)
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn create_node(
        &self,
        name: &str,
        base_url: &str,
        auth_token: &str,
        capacity_vcpus: i64,
        capacity_mem_mb: i64,
    ) -> Result<Node> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO nodes (name, base_url, auth_token, capacity_vcpus, capacity_mem_mb)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, base_url, auth_token, capacity_vcpus, capacity_mem_mb],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.node_by_id(id)?
            .ok_or_else(|| Error::Internal("node vanished after insert".into()))
    }

    fn node_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Node> {
        Ok(Node {
            id: row.get(0)?,
            name: row.get(1)?,
            base_url: row.get(2)?,
            auth_token: row.get(3)?,
            active: row.get::<_, i64>(4)? != 0,
            healthy: row.get::<_, i64>(5)? != 0,
            heartbeat_at: row.get(6)?,
            capacity_vcpus: row.get(7)?,
            capacity_mem_mb: row.get(8)?,
        })
    }

    const NODE_COLS: &'static str =
        "id, name, base_url, auth_token, active, healthy, heartbeat_at, capacity_vcpus, capacity_mem_mb";

    pub fn node_by_id(&self, id: i64) -> Result<Option<Node>> {
        let conn = self.conn.lock();
        let node = conn
            .query_row(
                &format!("SELECT {} FROM nodes WHERE id = ?1", Self::NODE_COLS),
                params![id],
                Self::node_from_row,
            )
            .optional()?;
        Ok(node)
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM nodes ORDER BY id", Self::NODE_COLS))?;
        let nodes = stmt
            .query_map([], Self::node_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(nodes)
    }

    pub fn update_node_health(&self, id: i64, healthy: bool, heartbeat_at: Option<i64>) -> Result<()> {
        let conn = self.conn.lock();
        match heartbeat_at {
            Some(ts) => conn.execute(
                "UPDATE nodes SET healthy = ?2, heartbeat_at = ?3 WHERE id = ?1",
                params![id, healthy as i64, ts],
            )?,
            None => conn.execute(
                "UPDATE nodes SET healthy = ?2 WHERE id = ?1",
                params![id, healthy as i64],
            )?,
        };
        Ok(())
    }

    /// Best-effort fallback when the scheduler finds no feasible node.
    pub fn random_active_node(&self) -> Result<Option<Node>> {
        let nodes: Vec<Node> = self
            .list_nodes()?
            .into_iter()
            .filter(|n| n.active)
            .collect();
        if nodes.is_empty() {
            return Ok(None);
        }
        use rand::seq::SliceRandom;
        Ok(nodes.choose(&mut rand::thread_rng()).cloned())
    }

    // ------------------------------------------------------------------
    // Container types
    // ------------------------------------------------------------------

    pub fn create_container_type(
        &self,
        name: &str,
        vcpus: i64,
        memory_mb: i64,
        disk_gib: i64,
        credits_cost: i64,
        private: bool,
    ) -> Result<ContainerType> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO container_types (name, vcpus, memory_mb, disk_gib, credits_cost, private)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![name, vcpus, memory_mb, disk_gib, credits_cost, private as i64],
        )?;
        let id = conn.last_insert_rowid();
        Ok(ContainerType {
            id,
            name: name.to_string(),
            vcpus,
            memory_mb,
            disk_gib,
            credits_cost,
            private,
        })
    }

    fn type_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContainerType> {
        Ok(ContainerType {
            id: row.get(0)?,
            name: row.get(1)?,
            vcpus: row.get(2)?,
            memory_mb: row.get(3)?,
            disk_gib: row.get(4)?,
            credits_cost: row.get(5)?,
            private: row.get::<_, i64>(6)? != 0,
        })
    }

    pub fn container_type_by_id(&self, id: i64) -> Result<Option<ContainerType>> {
        let conn = self.conn.lock();
        let ct = conn
            .query_row(
                "SELECT id, name, vcpus, memory_mb, disk_gib, credits_cost, private
                 FROM container_types WHERE id = ?1",
                params![id],
                Self::type_from_row,
            )
            .optional()?;
        Ok(ct)
    }

    pub fn list_container_types(&self, include_private: bool) -> Result<Vec<ContainerType>> {
        let conn = self.conn.lock();
        let sql = if include_private {
            "SELECT id, name, vcpus, memory_mb, disk_gib, credits_cost, private
             FROM container_types ORDER BY id"
        } else {
            "SELECT id, name, vcpus, memory_mb, disk_gib, credits_cost, private
             FROM container_types WHERE private = 0 ORDER BY id"
        };
        let mut stmt = conn.prepare(sql)?;
        let types = stmt
            .query_map([], Self::type_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(types)
    }

    // ------------------------------------------------------------------
    // Quotas and credit accounting
    // ------------------------------------------------------------------

    pub fn upsert_quota(&self, user_id: i64, credits: i64, ai_use_per_day: i64) -> Result<Quota> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO quotas (user_id, credits, ai_use_per_day) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET credits = excluded.credits,
                                               ai_use_per_day = excluded.ai_use_per_day",
            params![user_id, credits, ai_use_per_day],
        )?;
        Ok(Quota {
            user_id,
            credits,
            ai_use_per_day,
        })
    }

    pub fn quota_for_user(&self, user_id: i64) -> Result<Option<Quota>> {
        let conn = self.conn.lock();
        let quota = conn
            .query_row(
                "SELECT user_id, credits, ai_use_per_day FROM quotas WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(Quota {
                        user_id: row.get(0)?,
                        credits: row.get(1)?,
                        ai_use_per_day: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(quota)
    }

    pub fn allow_type(&self, user_id: i64, type_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO quota_allowed_types (user_id, type_id) VALUES (?1, ?2)",
            params![user_id, type_id],
        )?;
        Ok(())
    }

    /// Auto-assign every public type to a fresh quota.
    pub fn allow_public_types(&self, user_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO quota_allowed_types (user_id, type_id)
             SELECT ?1, id FROM container_types WHERE private = 0",
            params![user_id],
        )?;
        Ok(())
    }

    pub fn type_allowed(&self, user_id: i64, type_id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM quota_allowed_types WHERE user_id = ?1 AND type_id = ?2",
            params![user_id, type_id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// Credits remaining: quota credits minus the cost of every container
    /// the user wants running. Legacy containers without a type count as 1.
    pub fn credits_left(&self, user_id: i64) -> Result<i64> {
        let quota = self
            .quota_for_user(user_id)?
            .ok_or_else(|| Error::PermissionDenied("no quota assigned".into()))?;
        let conn = self.conn.lock();
        let used: i64 = conn.query_row(
            "SELECT COALESCE(SUM(COALESCE(ct.credits_cost, 1)), 0)
             FROM containers c
             LEFT JOIN container_types ct ON ct.id = c.type_id
             WHERE c.user_id = ?1 AND c.desired_state = 'running'",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(quota.credits - used)
    }

    // ------------------------------------------------------------------
    // Containers
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn create_container(
        &self,
        user_id: i64,
        node_id: i64,
        type_id: Option<i64>,
        name: &str,
        container_id: &str,
        memory_mb: i64,
        vcpus: i64,
        disk_gib: i64,
        status: &str,
    ) -> Result<Container> {
        let name = if name.is_empty() {
            generate_name()
        } else {
            name.to_string()
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO containers
                 (user_id, node_id, type_id, name, container_id,
                  memory_mb, vcpus, disk_gib, status, desired_state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'running', ?10)",
            params![
                user_id, node_id, type_id, name, container_id, memory_mb, vcpus, disk_gib, status,
                now_ts()
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.container_by_id(id)?
            .ok_or_else(|| Error::Internal("container vanished after insert".into()))
    }

    const CONTAINER_COLS: &'static str =
        "id, user_id, node_id, type_id, name, container_id, memory_mb, vcpus, disk_gib, \
         status, desired_state, first_start, created_at";

    fn container_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Container> {
        Ok(Container {
            id: row.get(0)?,
            user_id: row.get(1)?,
            node_id: row.get(2)?,
            type_id: row.get(3)?,
            name: row.get(4)?,
            container_id: row.get(5)?,
            memory_mb: row.get(6)?,
            vcpus: row.get(7)?,
            disk_gib: row.get(8)?,
            status: row.get(9)?,
            desired_state: DesiredState::parse(&row.get::<_, String>(10)?),
            first_start: row.get::<_, i64>(11)? != 0,
            created_at: row.get(12)?,
        })
    }

    pub fn container_by_id(&self, id: i64) -> Result<Option<Container>> {
        let conn = self.conn.lock();
        let c = conn
            .query_row(
                &format!("SELECT {} FROM containers WHERE id = ?1", Self::CONTAINER_COLS),
                params![id],
                Self::container_from_row,
            )
            .optional()?;
        Ok(c)
    }

    pub fn containers_for_user(&self, user_id: i64) -> Result<Vec<Container>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM containers WHERE user_id = ?1 ORDER BY id",
            Self::CONTAINER_COLS
        ))?;
        let out = stmt
            .query_map(params![user_id], Self::container_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(out)
    }

    pub fn all_containers(&self) -> Result<Vec<Container>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM containers ORDER BY id",
            Self::CONTAINER_COLS
        ))?;
        let out = stmt
            .query_map([], Self::container_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(out)
    }

    pub fn update_container_status(&self, id: i64, status: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE containers SET status = ?2 WHERE id = ?1",
            params![id, status],
        )?;
        Ok(())
    }

    pub fn bulk_update_statuses(&self, updates: &[(i64, String)]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for (id, status) in updates {
            tx.execute(
                "UPDATE containers SET status = ?2 WHERE id = ?1",
                params![id, status],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn update_desired_state(&self, id: i64, desired: DesiredState) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE containers SET desired_state = ?2 WHERE id = ?1",
            params![id, desired.as_str()],
        )?;
        Ok(())
    }

    pub fn clear_first_start(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE containers SET first_start = 0 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn delete_container(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM containers WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    /// Resources held by running containers on one node, for the scheduler:
    /// (vcpus_used, mem_mb_used, running_count).
    pub fn running_usage_on_node(&self, node_id: i64) -> Result<(i64, i64, i64)> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COALESCE(SUM(vcpus), 0), COALESCE(SUM(memory_mb), 0), COUNT(*)
             FROM containers WHERE node_id = ?1 AND status = 'running'",
            params![node_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(Error::from)
    }

    // ------------------------------------------------------------------
    // File templates
    // ------------------------------------------------------------------

    pub fn create_template(&self, name: &str, description: &str, public: bool) -> Result<FileTemplate> {
        let slug = slugify(name);
        let now = now_ts();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO file_templates (name, slug, description, public, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![name, slug, description, public as i64, now],
        )?;
        let id = conn.last_insert_rowid();
        Ok(FileTemplate {
            id,
            name: name.to_string(),
            slug,
            description: description.to_string(),
            public,
            updated_at: now,
        })
    }

    pub fn add_template_item(
        &self,
        template_id: i64,
        path: &str,
        content: &str,
        mode: u32,
        order: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO file_template_items (template_id, path, content, mode, ord)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![template_id, path, content, mode, order],
        )?;
        Ok(())
    }

    fn template_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileTemplate> {
        Ok(FileTemplate {
            id: row.get(0)?,
            name: row.get(1)?,
            slug: row.get(2)?,
            description: row.get(3)?,
            public: row.get::<_, i64>(4)? != 0,
            updated_at: row.get(5)?,
        })
    }

    pub fn template_by_slug(&self, slug: &str) -> Result<Option<FileTemplate>> {
        let conn = self.conn.lock();
        let t = conn
            .query_row(
                "SELECT id, name, slug, description, public, updated_at
                 FROM file_templates WHERE slug = ?1",
                params![slug],
                Self::template_from_row,
            )
            .optional()?;
        Ok(t)
    }

    /// Most recently updated template, the fallback default.
    pub fn latest_template(&self) -> Result<Option<FileTemplate>> {
        let conn = self.conn.lock();
        let t = conn
            .query_row(
                "SELECT id, name, slug, description, public, updated_at
                 FROM file_templates ORDER BY updated_at DESC, id DESC LIMIT 1",
                [],
                Self::template_from_row,
            )
            .optional()?;
        Ok(t)
    }

    pub fn template_items(&self, template_id: i64) -> Result<Vec<FileTemplateItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT path, content, mode, ord FROM file_template_items
             WHERE template_id = ?1 ORDER BY ord, path",
        )?;
        let items = stmt
            .query_map(params![template_id], |row| {
                Ok(FileTemplateItem {
                    path: row.get(0)?,
                    content: row.get(1)?,
                    mode: row.get(2)?,
                    order: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(items)
    }

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    /// Best-effort audit entry; failures are logged, never propagated.
    pub fn audit(
        &self,
        user_id: Option<i64>,
        action: &str,
        target_type: &str,
        target_id: &str,
        message: &str,
        success: bool,
        metadata: Option<serde_json::Value>,
    ) {
        let metadata = metadata.map(|m| m.to_string());
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO audit_log
                 (user_id, action, target_type, target_id, message, metadata, success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                user_id,
                action,
                target_type,
                target_id,
                message,
                metadata,
                success as i64,
                now_ts()
            ],
        );
        if let Err(e) = result {
            tracing::warn!(action, error = %e, "Audit write failed");
        }
    }

    #[cfg(test)]
    pub fn audit_count(&self, action: &str) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM audit_log WHERE action = ?1",
            params![action],
            |row| row.get(0),
        )?)
    }
}

fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_end_matches('-').to_string();
    trimmed.chars().take(120).collect()
}

const NAME_ADJECTIVES: &[&str] = &[
    "amber", "bold", "calm", "dapper", "eager", "fuzzy", "gentle", "happy", "keen", "lively",
    "mellow", "nifty", "proud", "quick", "rustic", "sunny", "tidy", "vivid", "warm", "zesty",
];

const NAME_NOUNS: &[&str] = &[
    "anchor", "beacon", "cove", "dinghy", "estuary", "fjord", "galley", "harbor", "island",
    "jetty", "keel", "lagoon", "mast", "narrows", "oar", "pier", "quay", "reef", "sail", "tide",
];

/// `adjective-noun` name for containers created without one.
pub fn generate_name() -> String {
    use rand::seq::SliceRandom;
    let mut rng = rand::thread_rng();
    format!(
        "{}-{}",
        NAME_ADJECTIVES.choose(&mut rng).unwrap(),
        NAME_NOUNS.choose(&mut rng).unwrap()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (Db, User, Node, ContainerType) {
        let db = Db::open_memory().unwrap();
        let user = db.create_user("alice", "tok-alice", false).unwrap();
        let node = db
            .create_node("node-1", "http://127.0.0.1:8080", "nt", 4, 4096)
            .unwrap();
        let ct = db
            .create_container_type("small", 1, 256, 10, 1, false)
            .unwrap();
        (db, user, node, ct)
    }

    #[test]
    fn user_token_lookup() {
        let (db, user, _, _) = seeded();
        let found = db.user_by_token("tok-alice").unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert!(db.user_by_token("nope").unwrap().is_none());
    }

    #[test]
    fn credits_account_for_running_and_legacy_containers() {
        let (db, user, node, small) = seeded();
        let medium = db
            .create_container_type("medium", 2, 512, 20, 2, false)
            .unwrap();
        db.upsert_quota(user.id, 3, 5).unwrap();
        assert_eq!(db.credits_left(user.id).unwrap(), 3);

        db.create_container(user.id, node.id, Some(small.id), "", "vm-1", 256, 1, 10, "creating")
            .unwrap();
        assert_eq!(db.credits_left(user.id).unwrap(), 2);

        let c2 = db
            .create_container(user.id, node.id, Some(medium.id), "", "vm-2", 512, 2, 20, "creating")
            .unwrap();
        assert_eq!(db.credits_left(user.id).unwrap(), 0);

        // Power off frees the credits.
        db.update_desired_state(c2.id, DesiredState::Stopped).unwrap();
        assert_eq!(db.credits_left(user.id).unwrap(), 2);

        // Legacy container without a type costs 1.
        db.create_container(user.id, node.id, None, "", "vm-3", 256, 1, 10, "creating")
            .unwrap();
        assert_eq!(db.credits_left(user.id).unwrap(), 1);
    }

    #[test]
    fn public_types_auto_assign_but_private_stay_out() {
        let (db, user, _, small) = seeded();
        let private = db
            .create_container_type("internal", 4, 4096, 40, 4, true)
            .unwrap();
        db.upsert_quota(user.id, 5, 5).unwrap();
        db.allow_public_types(user.id).unwrap();

        assert!(db.type_allowed(user.id, small.id).unwrap());
        assert!(!db.type_allowed(user.id, private.id).unwrap());
    }

    #[test]
    fn running_usage_counts_only_running_containers() {
        let (db, user, node, ct) = seeded();
        let c1 = db
            .create_container(user.id, node.id, Some(ct.id), "", "vm-1", 1024, 2, 10, "creating")
            .unwrap();
        db.create_container(user.id, node.id, Some(ct.id), "", "vm-2", 1024, 2, 10, "creating")
            .unwrap();
        assert_eq!(db.running_usage_on_node(node.id).unwrap(), (0, 0, 0));

        db.update_container_status(c1.id, "running").unwrap();
        assert_eq!(db.running_usage_on_node(node.id).unwrap(), (2, 1024, 1));
    }

    #[test]
    fn generated_names_have_two_parts() {
        let (db, user, node, ct) = seeded();
        let c = db
            .create_container(user.id, node.id, Some(ct.id), "", "vm-x", 256, 1, 10, "creating")
            .unwrap();
        assert!(c.name.contains('-'));

        let named = db
            .create_container(user.id, node.id, Some(ct.id), "myproj", "vm-y", 256, 1, 10, "creating")
            .unwrap();
        assert_eq!(named.name, "myproj");
    }

    #[test]
    fn slugify_is_lowercase_dashed() {
        assert_eq!(slugify("My Cool Template!"), "my-cool-template");
        assert_eq!(slugify("  Python 3.12  "), "python-3-12");
    }

    #[test]
    fn templates_round_trip_with_items_in_order() {
        let (db, _, _, _) = seeded();
        let t = db.create_template("Python Starter", "desc", true).unwrap();
        db.add_template_item(t.id, "main.py", "print('hi')", 0o644, 1)
            .unwrap();
        db.add_template_item(t.id, "README.md", "# hi", 0o644, 0)
            .unwrap();

        let found = db.template_by_slug("python-starter").unwrap().unwrap();
        assert_eq!(found.id, t.id);
        let items = db.template_items(t.id).unwrap();
        assert_eq!(items[0].path, "README.md");
        assert_eq!(items[1].path, "main.py");
        assert!(db.latest_template().unwrap().is_some());
    }

    #[test]
    fn audit_entries_accumulate() {
        let (db, user, _, _) = seeded();
        db.audit(
            Some(user.id),
            "container.power_on",
            "container",
            "1",
            "Reconciler requested power on",
            true,
            None,
        );
        assert_eq!(db.audit_count("container.power_on").unwrap(), 1);
    }
}
