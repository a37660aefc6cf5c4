//! Node selection and quota admission.

use crate::db::{ContainerType, Db, Node, User};
use skiff_common::{now_ts, Error, Result};
use tracing::{info, warn};

/// Nodes with a heartbeat older than this are not scheduling candidates.
pub const HEARTBEAT_TTL_S: i64 = 60;

pub const BEST_EFFORT_WARNING: &str =
    "No available nodes with enough capacity; proceeding on best-effort node";

/// Outcome of a placement decision. `warning` is set on the degraded
/// best-effort path so callers can surface it in the response.
#[derive(Debug, Clone)]
pub struct Placement {
    pub node: Node,
    pub warning: Option<String>,
}

/// Admission control: the type must be allowed for the user's quota and the
/// remaining credits must cover its cost.
pub fn check_admission(db: &Db, user: &User, ct: &ContainerType) -> Result<()> {
    if db.quota_for_user(user.id)?.is_none() {
        return Err(Error::PermissionDenied("No quota assigned".into()));
    }
    if !db.type_allowed(user.id, ct.id)? {
        return Err(Error::PermissionDenied(
            "Container type not allowed for this quota".into(),
        ));
    }
    if db.credits_left(user.id)? < ct.credits_cost {
        return Err(Error::PermissionDenied(
            "Not enough credits for selected type".into(),
        ));
    }
    Ok(())
}

/// Active, healthy nodes with a fresh heartbeat.
pub fn candidate_nodes(db: &Db, heartbeat_ttl_s: i64) -> Result<Vec<Node>> {
    let cutoff = now_ts() - heartbeat_ttl_s;
    Ok(db
        .list_nodes()?
        .into_iter()
        .filter(|n| n.active && n.healthy && n.heartbeat_at.map_or(false, |hb| hb >= cutoff))
        .collect())
}

/// Free memory is worth twice a free vCPU; each running VM costs half a
/// point.
pub fn node_score(free_mem_mb: i64, free_vcpus: i64, running_count: i64) -> f64 {
    2.0 * free_mem_mb as f64 + free_vcpus as f64 - 0.5 * running_count as f64
}

/// Pick the feasible candidate with the highest score. Ties break on
/// iteration order (node id), which keeps the choice deterministic.
pub fn choose_node(db: &Db, needed_vcpus: i64, needed_mem_mb: i64) -> Result<Option<Node>> {
    let mut best: Option<(Node, f64)> = None;
    for node in candidate_nodes(db, HEARTBEAT_TTL_S)? {
        let (used_vcpus, used_mem, running) = db.running_usage_on_node(node.id)?;
        let free_vcpus = node.capacity_vcpus - used_vcpus;
        let free_mem = node.capacity_mem_mb - used_mem;
        if free_vcpus < needed_vcpus || free_mem < needed_mem_mb {
            continue;
        }
        let score = node_score(free_mem, free_vcpus, running);
        if best.as_ref().map_or(true, |(_, s)| score > *s) {
            best = Some((node, score));
        }
    }
    Ok(best.map(|(n, _)| n))
}

/// Full placement: scheduler choice, or a random active node with an
/// explicit warning when nothing feasible exists.
pub fn place(db: &Db, needed_vcpus: i64, needed_mem_mb: i64) -> Result<Placement> {
    if let Some(node) = choose_node(db, needed_vcpus, needed_mem_mb)? {
        info!(node = %node.name, "Scheduled onto node");
        return Ok(Placement {
            node,
            warning: None,
        });
    }

    warn!(needed_vcpus, needed_mem_mb, "{}", BEST_EFFORT_WARNING);
    let node = db
        .random_active_node()?
        .ok_or_else(|| Error::Upstream("No node available".into()))?;
    Ok(Placement {
        node,
        warning: Some(BEST_EFFORT_WARNING.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DesiredState;

    fn db_with_user() -> (Db, User) {
        let db = Db::open_memory().unwrap();
        let user = db.create_user("alice", "tok", false).unwrap();
        (db, user)
    }

    fn heartbeat(db: &Db, node: &Node) {
        db.update_node_health(node.id, true, Some(now_ts())).unwrap();
    }

    #[test]
    fn admission_rejects_missing_quota_disallowed_type_and_exhausted_credits() {
        let (db, user) = db_with_user();
        let small = db
            .create_container_type("small", 1, 256, 10, 1, false)
            .unwrap();

        let err = check_admission(&db, &user, &small).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));

        db.upsert_quota(user.id, 1, 5).unwrap();
        let err = check_admission(&db, &user, &small).unwrap_err();
        assert!(err.to_string().contains("not allowed"));

        db.allow_type(user.id, small.id).unwrap();
        check_admission(&db, &user, &small).unwrap();

        // Consume the single credit with a running container.
        let node = db
            .create_node("n1", "http://127.0.0.1:1", "", 4, 4096)
            .unwrap();
        db.create_container(user.id, node.id, Some(small.id), "", "vm-1", 256, 1, 10, "creating")
            .unwrap();
        let err = check_admission(&db, &user, &small).unwrap_err();
        assert!(err.to_string().contains("Not enough credits"));
    }

    #[test]
    fn admission_recovers_when_container_is_powered_off() {
        let (db, user) = db_with_user();
        let small = db
            .create_container_type("small", 1, 256, 10, 1, false)
            .unwrap();
        db.upsert_quota(user.id, 1, 5).unwrap();
        db.allow_type(user.id, small.id).unwrap();
        let node = db
            .create_node("n1", "http://127.0.0.1:1", "", 4, 4096)
            .unwrap();
        let c = db
            .create_container(user.id, node.id, Some(small.id), "", "vm-1", 256, 1, 10, "creating")
            .unwrap();

        assert!(check_admission(&db, &user, &small).is_err());
        db.update_desired_state(c.id, DesiredState::Stopped).unwrap();
        check_admission(&db, &user, &small).unwrap();
    }

    #[test]
    fn candidates_require_active_healthy_and_fresh_heartbeat() {
        let (db, _) = db_with_user();
        let fresh = db
            .create_node("fresh", "http://127.0.0.1:1", "", 4, 4096)
            .unwrap();
        heartbeat(&db, &fresh);

        let stale = db
            .create_node("stale", "http://127.0.0.1:2", "", 4, 4096)
            .unwrap();
        db.update_node_health(stale.id, true, Some(now_ts() - 300)).unwrap();

        let unhealthy = db
            .create_node("unhealthy", "http://127.0.0.1:3", "", 4, 4096)
            .unwrap();
        db.update_node_health(unhealthy.id, false, Some(now_ts())).unwrap();

        let names: Vec<String> = candidate_nodes(&db, HEARTBEAT_TTL_S)
            .unwrap()
            .into_iter()
            .map(|n| n.name)
            .collect();
        assert_eq!(names, vec!["fresh"]);
    }

    #[test]
    fn memory_heavy_node_wins_the_score() {
        // Node A: 4 vCPU / 4 GiB free. Node B: 8 vCPU / 2 GiB free.
        // 2*4096 + 4 > 2*2048 + 8, so A wins for a 2 vCPU / 1 GiB request.
        let (db, _) = db_with_user();
        let a = db
            .create_node("a", "http://127.0.0.1:1", "", 4, 4096)
            .unwrap();
        let b = db
            .create_node("b", "http://127.0.0.1:2", "", 8, 2048)
            .unwrap();
        heartbeat(&db, &a);
        heartbeat(&db, &b);

        let chosen = choose_node(&db, 2, 1024).unwrap().unwrap();
        assert_eq!(chosen.name, "a");
    }

    #[test]
    fn infeasible_capacity_is_skipped() {
        let (db, user) = db_with_user();
        let big = db
            .create_node("big", "http://127.0.0.1:1", "", 8, 8192)
            .unwrap();
        let small = db
            .create_node("small", "http://127.0.0.1:2", "", 2, 1024)
            .unwrap();
        heartbeat(&db, &big);
        heartbeat(&db, &small);

        // Fill the big node with running containers.
        let ct = db
            .create_container_type("large", 8, 8192, 10, 1, false)
            .unwrap();
        let c = db
            .create_container(user.id, big.id, Some(ct.id), "", "vm-big", 8192, 8, 10, "creating")
            .unwrap();
        db.update_container_status(c.id, "running").unwrap();

        // A 4-vCPU request fits neither: big is full, small is too small.
        assert!(choose_node(&db, 4, 2048).unwrap().is_none());

        // A 1-vCPU request still fits the small node.
        let chosen = choose_node(&db, 1, 512).unwrap().unwrap();
        assert_eq!(chosen.name, "small");
    }

    #[test]
    fn place_falls_back_with_observable_warning() {
        let (db, _) = db_with_user();
        let n = db
            .create_node("only", "http://127.0.0.1:1", "", 1, 512)
            .unwrap();
        // No heartbeat: not a candidate, but still active for the fallback.
        let placement = place(&db, 8, 8192).unwrap();
        assert_eq!(placement.node.id, n.id);
        assert_eq!(placement.warning.as_deref(), Some(BEST_EFFORT_WARNING));
    }

    #[test]
    fn running_vm_count_breaks_near_ties() {
        let (db, user) = db_with_user();
        let a = db
            .create_node("a", "http://127.0.0.1:1", "", 4, 2048)
            .unwrap();
        let b = db
            .create_node("b", "http://127.0.0.1:2", "", 4, 2048)
            .unwrap();
        heartbeat(&db, &a);
        heartbeat(&db, &b);

        // One tiny running container on A: same free memory story would tie,
        // but A also loses free resources, so B wins.
        let ct = db.create_container_type("t", 1, 64, 10, 1, false).unwrap();
        let c = db
            .create_container(user.id, a.id, Some(ct.id), "", "vm-a", 64, 1, 10, "creating")
            .unwrap();
        db.update_container_status(c.id, "running").unwrap();

        let chosen = choose_node(&db, 1, 512).unwrap().unwrap();
        assert_eq!(chosen.name, "b");
    }
}
