//! File templates: seed a container's `/app` on its first interactive
//! attach.

use crate::client::NodeClient;
use crate::db::{Container, Db, FileTemplate};
use skiff_common::types::{ElementResponse, VmFile, VmUploadFiles};
use skiff_common::Result;
use tracing::{info, warn};

pub const DEFAULT_TEMPLATE_SLUG: &str = "default";

/// Push every template item into the container's filesystem.
pub async fn apply_template(
    db: &Db,
    client: &NodeClient,
    container: &Container,
    template: &FileTemplate,
    dest_path: &str,
    clean: bool,
) -> Result<ElementResponse> {
    let files: Vec<VmFile> = db
        .template_items(template.id)?
        .into_iter()
        .map(|it| VmFile {
            path: it.path,
            text: Some(it.content),
            content_b64: None,
            mode: it.mode,
        })
        .collect();

    let payload = VmUploadFiles {
        dest_path: dest_path.to_string(),
        clean,
        files,
    };
    client.upload_files(&container.container_id, &payload).await
}

/// Apply the default template the first time a running container is
/// attached, then clear the flag. Best-effort; a failed apply is logged and
/// retried on the next attach.
pub async fn ensure_first_start(db: &Db, client: &NodeClient, container: &Container) {
    if !container.first_start || container.status != "running" {
        return;
    }

    let template = match db.template_by_slug(DEFAULT_TEMPLATE_SLUG) {
        Ok(Some(t)) => Some(t),
        Ok(None) => match db.latest_template() {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "Template lookup failed");
                return;
            }
        },
        Err(e) => {
            warn!(error = %e, "Template lookup failed");
            return;
        }
    };

    let Some(template) = template else {
        // Nothing to seed; still clear the flag so we stop checking.
        let _ = db.clear_first_start(container.id);
        return;
    };

    match apply_template(db, client, container, &template, "/app", true).await {
        Ok(resp) if resp.ok => {
            info!(container = container.id, template = %template.slug, "First-start template applied");
            let _ = db.clear_first_start(container.id);
        }
        Ok(resp) => warn!(container = container.id, reason = %resp.reason, "Template apply reported failure"),
        Err(e) => warn!(container = container.id, error = %e, "Template apply failed"),
    }
}
