//! Typed HTTP client for the node agent API.

use crate::db::Node;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use skiff_common::types::{
    ElementResponse, FileContent, ListDirItem, MachineMetrics, SearchHit, SearchRequest,
    VmActionRequest, VmCreate, VmOut, VmPath, VmPaths, VmSh, VmShResponse, VmUploadFiles,
};
use skiff_common::{Error, Result};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct NodeClient {
    base_url: String,
    auth_token: String,
    http: reqwest::Client,
    /// Client without a request timeout, for streaming downloads.
    http_unbounded: reqwest::Client,
}

impl NodeClient {
    pub fn new(node: &Node) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .expect("reqwest client builds");
        let http_unbounded = reqwest::Client::new();
        Self {
            base_url: node.base_url.trim_end_matches('/').to_string(),
            auth_token: node.auth_token.clone(),
            http,
            http_unbounded,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// The node's `/vms/{id}/tty` endpoint as a ws:// or wss:// URL.
    pub fn tty_url(&self, vm_id: &str) -> String {
        let ws_base = self
            .base_url
            .replacen("http://", "ws://", 1)
            .replacen("https://", "wss://", 1);
        format!("{ws_base}/vms/{vm_id}/tty")
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.auth_token)
    }

    async fn handle<T: DeserializeOwned>(&self, resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::not_found("vm", "upstream"));
        }
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(Error::Upstream(format!("node returned {status}: {detail}")));
        }
        resp.json::<T>()
            .await
            .map_err(|e| Error::Upstream(format!("invalid node response: {e}")))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(self.url(path))
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("node request failed: {e}")))?;
        self.handle(resp).await
    }

    async fn post_json<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let resp = self
            .http
            .post(self.url(path))
            .header("Authorization", self.bearer())
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("node request failed: {e}")))?;
        self.handle(resp).await
    }

    pub async fn health(&self) -> Result<()> {
        let resp = self
            .http
            .get(self.url("/health"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("health check failed: {e}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::Upstream(format!(
                "health check returned {}",
                resp.status()
            )))
        }
    }

    pub async fn create_vm(&self, req: &VmCreate) -> Result<VmOut> {
        self.post_json("/vms", req).await
    }

    pub async fn get_vm(&self, vm_id: &str) -> Result<VmOut> {
        self.get_json(&format!("/vms/{vm_id}")).await
    }

    /// Bulk fetch; ids missing on the node are simply absent from the reply.
    pub async fn get_vms(&self, vm_ids: &[String]) -> Result<Vec<VmOut>> {
        let csv = vm_ids.join(",");
        self.get_json(&format!("/vms/list/{csv}")).await
    }

    pub async fn delete_vm(&self, vm_id: &str) -> Result<VmOut> {
        let resp = self
            .http
            .delete(self.url(&format!("/vms/{vm_id}")))
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("node request failed: {e}")))?;
        self.handle(resp).await
    }

    pub async fn action_vm(&self, vm_id: &str, action: &VmActionRequest) -> Result<VmOut> {
        self.post_json(&format!("/vms/{vm_id}/actions"), action).await
    }

    pub async fn upload_files(&self, vm_id: &str, req: &VmUploadFiles) -> Result<ElementResponse> {
        self.post_json(&format!("/vms/{vm_id}/upload-files"), req).await
    }

    pub async fn list_dirs(&self, vm_id: &str, req: &VmPaths) -> Result<Vec<ListDirItem>> {
        self.post_json(&format!("/vms/{vm_id}/list-dirs"), req).await
    }

    pub async fn read_file(&self, vm_id: &str, path: &str) -> Result<FileContent> {
        self.post_json(
            &format!("/vms/{vm_id}/read-file"),
            &VmPath {
                path: path.to_string(),
            },
        )
        .await
    }

    pub async fn create_dir(&self, vm_id: &str, path: &str) -> Result<ElementResponse> {
        self.post_json(
            &format!("/vms/{vm_id}/create-dir"),
            &VmPath {
                path: path.to_string(),
            },
        )
        .await
    }

    pub async fn execute_sh(&self, vm_id: &str, command: &str, timeout: u64) -> Result<VmShResponse> {
        self.post_json(
            &format!("/vms/{vm_id}/execute-sh"),
            &VmSh {
                command: command.to_string(),
                timeout,
            },
        )
        .await
    }

    pub async fn search(&self, vm_id: &str, req: &SearchRequest) -> Result<Vec<SearchHit>> {
        self.post_json(&format!("/vms/{vm_id}/search"), req).await
    }

    pub async fn metrics(&self, vm_id: &str) -> Result<MachineMetrics> {
        self.get_json(&format!("/metrics/{vm_id}")).await
    }

    /// Stream a single-file download; returns (bytes, content-type,
    /// content-disposition).
    pub async fn download_file(&self, vm_id: &str, path: &str) -> Result<(Vec<u8>, String, String)> {
        self.download(&format!("/vms/{vm_id}/download-file"), &[("path", path)])
            .await
    }

    pub async fn download_folder(
        &self,
        vm_id: &str,
        root: &str,
        prefer_fmt: &str,
    ) -> Result<(Vec<u8>, String, String)> {
        self.download(
            &format!("/vms/{vm_id}/download-folder"),
            &[("root", root), ("prefer_fmt", prefer_fmt)],
        )
        .await
    }

    async fn download(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<(Vec<u8>, String, String)> {
        let resp = self
            .http_unbounded
            .get(self.url(path))
            .query(query)
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("node request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(Error::Upstream(format!("node returned {status}: {detail}")));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let disposition = resp
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("attachment")
            .to_string();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::Upstream(format!("download failed: {e}")))?;
        Ok((bytes.to_vec(), content_type, disposition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(url: &str) -> Node {
        Node {
            id: 1,
            name: "n1".into(),
            base_url: url.into(),
            auth_token: "secret".into(),
            active: true,
            healthy: true,
            heartbeat_at: None,
            capacity_vcpus: 4,
            capacity_mem_mb: 4096,
        }
    }

    #[test]
    fn tty_url_swaps_scheme_and_keeps_path() {
        let c = NodeClient::new(&node("http://10.0.0.5:8080/"));
        assert_eq!(c.tty_url("vm-1"), "ws://10.0.0.5:8080/vms/vm-1/tty");

        let c = NodeClient::new(&node("https://agent.example.com"));
        assert_eq!(c.tty_url("x"), "wss://agent.example.com/vms/x/tty");
    }

    #[test]
    fn bearer_header_carries_node_token() {
        let c = NodeClient::new(&node("http://127.0.0.1:8080"));
        assert_eq!(c.bearer(), "Bearer secret");
    }
}
