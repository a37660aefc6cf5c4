//! Desired-state reconciler: a single batched pass over all containers,
//! driving observed status toward `desired_state` via the owning node
//! agents, plus the periodic loop wrapper.

use crate::client::NodeClient;
use crate::db::{Container, Db, DesiredState, Node};
use skiff_common::types::{VmActionKind, VmActionRequest};
use skiff_common::Result;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info, warn};

/// Bounded ids per bulk status request.
const BATCH_SIZE: usize = 200;

/// What one pass did: `(actions_sent, rows_updated)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassStats {
    pub actions: usize,
    pub updates: usize,
}

/// Pure planning rule for one container. Convergence means `None`.
pub fn plan_action(desired: DesiredState, status: &str) -> Option<VmActionKind> {
    match desired {
        DesiredState::Running => match status {
            "stopped" | "error" | "created" | "creating" => Some(VmActionKind::Start),
            _ => None,
        },
        DesiredState::Stopped => match status {
            "running" => Some(VmActionKind::Stop),
            _ => None,
        },
    }
}

/// The local status hint written after dispatching an action; the next sync
/// pass observes the real state.
pub fn action_hint(action: VmActionKind) -> &'static str {
    match action {
        VmActionKind::Start => "provisioning",
        VmActionKind::Stop => "stopped",
        VmActionKind::Reboot => "provisioning",
    }
}

pub struct Reconciler {
    db: Db,
}

impl Reconciler {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Periodic loop; errors are logged and the loop continues.
    pub async fn run(&self, interval: Duration) {
        info!(interval_s = interval.as_secs(), "Reconciler started");
        loop {
            match self.reconcile_once().await {
                Ok(stats) if stats.actions > 0 || stats.updates > 0 => {
                    info!(actions = stats.actions, updates = stats.updates, "Reconcile pass done");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Reconcile pass failed"),
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// One full pass over every container.
    pub async fn reconcile_once(&self) -> Result<PassStats> {
        let containers = self.db.all_containers()?;
        self.reconcile_batch(containers).await
    }

    /// Reconcile a group of containers:
    /// 1. sync observed status from the owning nodes in bounded chunks,
    /// 2. dispatch start/stop where desired and observed state disagree,
    /// 3. persist local status hints.
    pub async fn reconcile_batch(&self, containers: Vec<Container>) -> Result<PassStats> {
        let mut stats = PassStats::default();
        if containers.is_empty() {
            return Ok(stats);
        }

        let nodes: HashMap<i64, Node> = self
            .db
            .list_nodes()?
            .into_iter()
            .map(|n| (n.id, n))
            .collect();

        let (synced, update_count) = sync_statuses_inner(&self.db, &nodes, containers).await?;
        stats.updates += update_count;

        // Enforce desired state; per-container failures audit and continue.
        let mut hints: Vec<(i64, String)> = Vec::new();
        for c in &synced {
            let Some(action) = plan_action(c.desired_state, &c.status) else {
                continue;
            };
            let Some(node) = nodes.get(&c.node_id) else {
                continue;
            };
            if !node.active {
                continue;
            }

            let client = NodeClient::new(node);
            let request = VmActionRequest {
                action,
                cleanup_disks: Some(false),
            };
            match client.action_vm(&c.container_id, &request).await {
                Ok(_) => {
                    stats.actions += 1;
                    hints.push((c.id, action_hint(action).to_string()));
                    let audit_action = match action {
                        VmActionKind::Start => "container.power_on",
                        _ => "container.power_off",
                    };
                    self.db.audit(
                        Some(c.user_id),
                        audit_action,
                        "container",
                        &c.id.to_string(),
                        "Reconciler requested state change",
                        true,
                        Some(serde_json::json!({ "container_id": c.container_id })),
                    );
                }
                Err(e) => {
                    warn!(container = c.id, error = %e, "Reconcile action failed");
                    self.db.audit(
                        Some(c.user_id),
                        "container.real_status",
                        "container",
                        &c.id.to_string(),
                        &format!("Action error during reconciliation: {e}"),
                        false,
                        Some(serde_json::json!({
                            "container_id": c.container_id,
                            "desired": c.desired_state.as_str(),
                            "status": c.status,
                        })),
                    );
                }
            }
        }

        if !hints.is_empty() {
            stats.updates += hints.len();
            self.db.bulk_update_statuses(&hints)?;
        }

        Ok(stats)
    }
}

/// Refresh observed statuses for a set of containers (no actions) and
/// persist the changes. Returns the refreshed rows.
pub async fn sync_statuses(db: &Db, containers: Vec<Container>) -> Result<Vec<Container>> {
    let nodes: HashMap<i64, Node> = db.list_nodes()?.into_iter().map(|n| (n.id, n)).collect();
    let (synced, _) = sync_statuses_inner(db, &nodes, containers).await?;
    Ok(synced)
}

/// Shared sync core: group by node, bulk-fetch states, persist changes.
async fn sync_statuses_inner(
    db: &Db,
    nodes: &HashMap<i64, Node>,
    containers: Vec<Container>,
) -> Result<(Vec<Container>, usize)> {
    let mut by_node: HashMap<i64, Vec<Container>> = HashMap::new();
    for c in containers {
        by_node.entry(c.node_id).or_default().push(c);
    }

    let mut synced: Vec<Container> = Vec::new();
    let mut status_updates: Vec<(i64, String)> = Vec::new();

    for (node_id, group) in by_node {
        let Some(node) = nodes.get(&node_id) else {
            warn!(node_id, "Containers reference an unknown node; skipping");
            synced.extend(group);
            continue;
        };
        if !node.active {
            synced.extend(group);
            continue;
        }
        let client = NodeClient::new(node);
        let states = fetch_states(&client, &group).await;

        for mut c in group {
            if let Some(state) = states.get(&c.container_id) {
                if &c.status != state {
                    status_updates.push((c.id, state.clone()));
                    c.status = state.clone();
                }
            }
            synced.push(c);
        }
    }

    let count = status_updates.len();
    if !status_updates.is_empty() {
        db.bulk_update_statuses(&status_updates)?;
    }
    synced.sort_by_key(|c| c.id);
    Ok((synced, count))
}

/// `{vm_id: state}` for one node; a failed chunk marks its ids as "error".
async fn fetch_states(client: &NodeClient, group: &[Container]) -> HashMap<String, String> {
    let ids: Vec<String> = group.iter().map(|c| c.container_id.clone()).collect();
    let mut states: HashMap<String, String> = HashMap::new();

    for chunk in ids.chunks(BATCH_SIZE) {
        match client.get_vms(chunk).await {
            Ok(vms) => {
                let index: HashMap<&str, String> = vms
                    .iter()
                    .map(|vm| (vm.id.as_str(), vm.state.to_string()))
                    .collect();
                for id in chunk {
                    let state = index.get(id.as_str()).cloned().unwrap_or_else(|| "error".into());
                    states.insert(id.clone(), state);
                }
            }
            Err(e) => {
                warn!(error = %e, "Bulk status fetch failed; marking chunk as error");
                for id in chunk {
                    states.insert(id.clone(), "error".into());
                }
            }
        }
    }
    states
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_starts_everything_not_running_when_desired_running() {
        for status in ["stopped", "error", "created", "creating"] {
            assert_eq!(
                plan_action(DesiredState::Running, status),
                Some(VmActionKind::Start),
                "status {status}"
            );
        }
        assert_eq!(plan_action(DesiredState::Running, "running"), None);
        assert_eq!(plan_action(DesiredState::Running, "provisioning"), None);
    }

    #[test]
    fn plan_stops_only_running_when_desired_stopped() {
        assert_eq!(
            plan_action(DesiredState::Stopped, "running"),
            Some(VmActionKind::Stop)
        );
        for status in ["stopped", "error", "created", "provisioning"] {
            assert_eq!(plan_action(DesiredState::Stopped, status), None, "status {status}");
        }
    }

    #[test]
    fn converged_containers_plan_nothing() {
        // One pass after convergence computes zero actions for every pair.
        assert!(plan_action(DesiredState::Running, "running").is_none());
        assert!(plan_action(DesiredState::Stopped, "stopped").is_none());
    }

    #[test]
    fn hints_match_dispatched_action() {
        assert_eq!(action_hint(VmActionKind::Start), "provisioning");
        assert_eq!(action_hint(VmActionKind::Stop), "stopped");
    }

    #[tokio::test]
    async fn empty_pass_is_a_no_op() {
        let db = Db::open_memory().unwrap();
        let reconciler = Reconciler::new(db);
        let stats = reconciler.reconcile_once().await.unwrap();
        assert_eq!(stats, PassStats::default());
    }

    use skiff_common::types::{VmOut, VmState};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn vm_out(id: &str, state: VmState) -> VmOut {
        VmOut {
            id: id.to_string(),
            state,
            node: "stub".into(),
            ssh_host: "127.0.0.1".into(),
            ssh_port: None,
            ssh_user: None,
            created_at: 0,
            updated_at: 0,
            booted_at: None,
            error_reason: None,
        }
    }

    /// Minimal node agent: reports every VM as stopped until it receives an
    /// action, then as running.
    async fn spawn_stub_node() -> (String, Arc<AtomicBool>) {
        use axum::extract::Path as UrlPath;
        use axum::routing::{get, post};
        use axum::{Json, Router};

        let started = Arc::new(AtomicBool::new(false));
        let list_flag = started.clone();
        let action_flag = started.clone();

        let app = Router::new()
            .route(
                "/vms/list/:csv",
                get(move |UrlPath(csv): UrlPath<String>| {
                    let flag = list_flag.clone();
                    async move {
                        let state = if flag.load(Ordering::SeqCst) {
                            VmState::Running
                        } else {
                            VmState::Stopped
                        };
                        let vms: Vec<VmOut> =
                            csv.split(',').map(|id| vm_out(id, state)).collect();
                        Json(vms)
                    }
                }),
            )
            .route(
                "/vms/:id/actions",
                post(move |UrlPath(id): UrlPath<String>| {
                    let flag = action_flag.clone();
                    async move {
                        flag.store(true, Ordering::SeqCst);
                        Json(vm_out(&id, VmState::Provisioning))
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), started)
    }

    #[tokio::test]
    async fn pass_starts_stopped_container_then_converges() {
        let (base_url, _started) = spawn_stub_node().await;

        let db = Db::open_memory().unwrap();
        let user = db.create_user("alice", "tok", false).unwrap();
        let node = db.create_node("stub", &base_url, "tok", 4, 4096).unwrap();
        let c = db
            .create_container(user.id, node.id, None, "", "vm-1", 256, 1, 10, "creating")
            .unwrap();

        let reconciler = Reconciler::new(db.clone());

        // First pass: observed stopped, desired running -> one start action,
        // local hint flips to provisioning.
        let stats = reconciler.reconcile_once().await.unwrap();
        assert_eq!(stats.actions, 1);
        let c1 = db.container_by_id(c.id).unwrap().unwrap();
        assert_eq!(c1.status, "provisioning");
        assert_eq!(db.audit_count("container.power_on").unwrap(), 1);

        // Second pass: the stub now reports running -> status syncs, no
        // further actions.
        let stats = reconciler.reconcile_once().await.unwrap();
        assert_eq!(stats.actions, 0);
        let c2 = db.container_by_id(c.id).unwrap().unwrap();
        assert_eq!(c2.status, "running");

        // Third pass: fully converged, zero work.
        let stats = reconciler.reconcile_once().await.unwrap();
        assert_eq!(stats, PassStats::default());
    }

    #[tokio::test]
    async fn desired_stopped_dispatches_stop_for_running_container() {
        let (base_url, started) = spawn_stub_node().await;
        started.store(true, Ordering::SeqCst);

        let db = Db::open_memory().unwrap();
        let user = db.create_user("bob", "tok2", false).unwrap();
        let node = db.create_node("stub", &base_url, "tok", 4, 4096).unwrap();
        let c = db
            .create_container(user.id, node.id, None, "", "vm-2", 256, 1, 10, "running")
            .unwrap();
        db.update_desired_state(c.id, DesiredState::Stopped).unwrap();

        let stats = Reconciler::new(db.clone()).reconcile_once().await.unwrap();
        assert_eq!(stats.actions, 1);
        let c = db.container_by_id(c.id).unwrap().unwrap();
        assert_eq!(c.status, "stopped");
        assert_eq!(db.audit_count("container.power_off").unwrap(), 1);
    }

    #[tokio::test]
    async fn unreachable_node_marks_status_error_and_audits_failures() {
        let db = Db::open_memory().unwrap();
        let user = db.create_user("alice", "tok", false).unwrap();
        // Port 9 (discard) is never a node agent.
        let node = db
            .create_node("n1", "http://127.0.0.1:9", "", 4, 4096)
            .unwrap();
        let c = db
            .create_container(user.id, node.id, None, "", "vm-1", 256, 1, 10, "creating")
            .unwrap();
        assert_eq!(c.desired_state, DesiredState::Running);

        let reconciler = Reconciler::new(db.clone());
        let stats = reconciler.reconcile_once().await.unwrap();

        // Status flipped to error via the failed bulk fetch, a start was
        // attempted (desired running), and its failure was audited.
        assert_eq!(stats.actions, 0);
        assert!(stats.updates >= 1);
        let c = db.container_by_id(c.id).unwrap().unwrap();
        assert_eq!(c.status, "error");
        assert_eq!(db.audit_count("container.real_status").unwrap(), 1);
    }
}
