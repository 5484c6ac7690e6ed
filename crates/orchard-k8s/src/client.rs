//! Minimal cluster-orchestrator API client.
//!
//! A thin typed layer over the cluster's REST API. Errors are normalized
//! to a readable message pulled from the API error body; 404s become
//! `NotFound` so teardown paths can swallow them.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use orchard_backend::ProgressSink;
use orchard_core::{OrchardError, OrchardResult};

use crate::resources::{
    ApiStatus, CronJob, Deployment, Ingress, List, Node, Pod, Secret, Service,
};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Client for one cluster API server.
#[derive(Clone)]
pub struct ClusterClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ClusterClient {
    /// Client for an explicit API endpoint (tests, out-of-cluster dev).
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> OrchardResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| OrchardError::backend(format!("cluster client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Client using the pod's mounted service account.
    pub fn in_cluster() -> OrchardResult<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| OrchardError::Validation("not running inside a cluster".to_string()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let sa_dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(sa_dir.join("token"))
            .map_err(|e| OrchardError::Validation(format!("service account token: {e}")))?;
        let ca_pem = std::fs::read(sa_dir.join("ca.crt"))
            .map_err(|e| OrchardError::Validation(format!("service account CA: {e}")))?;
        let ca = reqwest::Certificate::from_pem(&ca_pem)
            .map_err(|e| OrchardError::Validation(format!("service account CA: {e}")))?;

        let http = reqwest::Client::builder()
            .add_root_certificate(ca)
            .build()
            .map_err(|e| OrchardError::backend(format!("cluster client: {e}")))?;

        Ok(Self {
            http,
            base_url: format!("https://{host}:{port}"),
            token: Some(token.trim().to_string()),
        })
    }

    // ── Pods ───────────────────────────────────────────────────────

    pub async fn create_pod(&self, namespace: &str, pod: &Pod) -> OrchardResult<Pod> {
        self.post(&format!("/api/v1/namespaces/{namespace}/pods"), pod)
            .await
    }

    pub async fn read_pod(&self, namespace: &str, name: &str) -> OrchardResult<Pod> {
        self.get(&format!("/api/v1/namespaces/{namespace}/pods/{name}"), &[])
            .await
    }

    pub async fn list_pods(&self, namespace: &str, selector: &str) -> OrchardResult<Vec<Pod>> {
        let list: List<Pod> = self
            .get(
                &format!("/api/v1/namespaces/{namespace}/pods"),
                &[("labelSelector", selector)],
            )
            .await?;
        Ok(list.items)
    }

    pub async fn delete_pod(&self, namespace: &str, name: &str) -> OrchardResult<()> {
        self.delete(&format!("/api/v1/namespaces/{namespace}/pods/{name}"))
            .await
    }

    /// Delete every pod matching the selector.
    pub async fn delete_pods_by_selector(
        &self,
        namespace: &str,
        selector: &str,
    ) -> OrchardResult<()> {
        let url = format!("{}/api/v1/namespaces/{namespace}/pods", self.base_url);
        let response = self
            .authorized(self.http.delete(&url))
            .query(&[("labelSelector", selector)])
            .send()
            .await
            .map_err(|e| OrchardError::backend(format!("cluster request failed: {e}")))?;
        Self::check(response).await?;
        Ok(())
    }

    /// Plain (non-following) log read for one container.
    pub async fn pod_log(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail_lines: Option<usize>,
    ) -> OrchardResult<String> {
        let url = format!(
            "{}/api/v1/namespaces/{namespace}/pods/{pod}/log",
            self.base_url
        );
        let mut request = self
            .authorized(self.http.get(&url))
            .query(&[("container", container)]);
        if let Some(tail) = tail_lines {
            request = request.query(&[("tailLines", tail.to_string())]);
        }
        let response = request
            .send()
            .await
            .map_err(|e| OrchardError::backend(format!("cluster request failed: {e}")))?;
        let response = Self::check(response).await?;
        response
            .text()
            .await
            .map_err(|e| OrchardError::backend(format!("cluster response: {e}")))
    }

    /// Follow a container's log, pushing each line through the sink until
    /// the stream ends or the task is dropped.
    pub async fn follow_pod_log(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        progress: &ProgressSink,
    ) -> OrchardResult<()> {
        let url = format!(
            "{}/api/v1/namespaces/{namespace}/pods/{pod}/log",
            self.base_url
        );
        let response = self
            .authorized(self.http.get(&url))
            .query(&[("container", container), ("follow", "true")])
            .send()
            .await
            .map_err(|e| OrchardError::backend(format!("cluster request failed: {e}")))?;
        let mut response = Self::check(response).await?;

        let mut pending = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| OrchardError::backend(format!("log stream: {e}")))?
        {
            pending.extend_from_slice(&chunk);
            while let Some(newline) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=newline).collect();
                let text = String::from_utf8_lossy(&line);
                let trimmed = text.trim_end();
                if !trimmed.is_empty() {
                    progress.message(trimmed.to_string()).await;
                }
            }
        }
        if !pending.is_empty() {
            progress
                .message(String::from_utf8_lossy(&pending).into_owned())
                .await;
        }
        Ok(())
    }

    // ── Deployments ────────────────────────────────────────────────

    pub async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> OrchardResult<Deployment> {
        self.post(
            &format!("/apis/apps/v1/namespaces/{namespace}/deployments"),
            deployment,
        )
        .await
    }

    pub async fn list_deployments(
        &self,
        namespace: &str,
        selector: &str,
    ) -> OrchardResult<Vec<Deployment>> {
        let list: List<Deployment> = self
            .get(
                &format!("/apis/apps/v1/namespaces/{namespace}/deployments"),
                &[("labelSelector", selector)],
            )
            .await?;
        Ok(list.items)
    }

    /// Strategic-merge patch of one deployment.
    pub async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> OrchardResult<()> {
        let url = format!(
            "{}/apis/apps/v1/namespaces/{namespace}/deployments/{name}",
            self.base_url
        );
        let response = self
            .authorized(self.http.patch(&url))
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/strategic-merge-patch+json",
            )
            .body(patch.to_string())
            .send()
            .await
            .map_err(|e| OrchardError::backend(format!("cluster request failed: {e}")))?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn delete_deployment(&self, namespace: &str, name: &str) -> OrchardResult<()> {
        self.delete(&format!(
            "/apis/apps/v1/namespaces/{namespace}/deployments/{name}"
        ))
        .await
    }

    // ── Services / ingresses ───────────────────────────────────────

    pub async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> OrchardResult<Service> {
        self.post(
            &format!("/api/v1/namespaces/{namespace}/services"),
            service,
        )
        .await
    }

    pub async fn delete_service(&self, namespace: &str, name: &str) -> OrchardResult<()> {
        self.delete(&format!("/api/v1/namespaces/{namespace}/services/{name}"))
            .await
    }

    pub async fn create_ingress(
        &self,
        namespace: &str,
        ingress: &Ingress,
    ) -> OrchardResult<Ingress> {
        self.post(
            &format!("/apis/networking.k8s.io/v1/namespaces/{namespace}/ingresses"),
            ingress,
        )
        .await
    }

    pub async fn delete_ingress(&self, namespace: &str, name: &str) -> OrchardResult<()> {
        self.delete(&format!(
            "/apis/networking.k8s.io/v1/namespaces/{namespace}/ingresses/{name}"
        ))
        .await
    }

    // ── CronJobs / nodes / secrets ─────────────────────────────────

    /// Server-side apply of the cleanup cronjob — an upsert that
    /// reconciles rather than duplicates.
    pub async fn apply_cron_job(
        &self,
        namespace: &str,
        name: &str,
        cron_job: &CronJob,
        field_manager: &str,
    ) -> OrchardResult<()> {
        let url = format!(
            "{}/apis/batch/v1/namespaces/{namespace}/cronjobs/{name}",
            self.base_url
        );
        let body = serde_json::to_string(cron_job)
            .map_err(|e| OrchardError::backend(format!("encode cronjob: {e}")))?;
        let response = self
            .authorized(self.http.patch(&url))
            .query(&[("fieldManager", field_manager), ("force", "true")])
            .header(reqwest::header::CONTENT_TYPE, "application/apply-patch+yaml")
            .body(body)
            .send()
            .await
            .map_err(|e| OrchardError::backend(format!("cluster request failed: {e}")))?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn list_nodes(&self) -> OrchardResult<Vec<Node>> {
        let list: List<Node> = self.get("/api/v1/nodes", &[]).await?;
        Ok(list.items)
    }

    pub async fn read_secret(&self, namespace: &str, name: &str) -> OrchardResult<Secret> {
        self.get(
            &format!("/api/v1/namespaces/{namespace}/secrets/{name}"),
            &[],
        )
        .await
    }

    // ── Transport ──────────────────────────────────────────────────

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> OrchardResult<T> {
        debug!(%path, "cluster GET");
        let response = self
            .authorized(self.http.get(format!("{}{path}", self.base_url)))
            .query(query)
            .send()
            .await
            .map_err(|e| OrchardError::backend(format!("cluster request failed: {e}")))?;
        Self::json(response).await
    }

    async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> OrchardResult<T> {
        debug!(%path, "cluster POST");
        let response = self
            .authorized(self.http.post(format!("{}{path}", self.base_url)))
            .json(body)
            .send()
            .await
            .map_err(|e| OrchardError::backend(format!("cluster request failed: {e}")))?;
        Self::json(response).await
    }

    async fn delete(&self, path: &str) -> OrchardResult<()> {
        debug!(%path, "cluster DELETE");
        let response = self
            .authorized(self.http.delete(format!("{}{path}", self.base_url)))
            .send()
            .await
            .map_err(|e| OrchardError::backend(format!("cluster request failed: {e}")))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn json<T: DeserializeOwned>(response: reqwest::Response) -> OrchardResult<T> {
        let response = Self::check(response).await?;
        response
            .json()
            .await
            .map_err(|e| OrchardError::backend(format!("cluster response decode: {e}")))
    }

    /// Normalize non-2xx responses using the API error body.
    async fn check(response: reqwest::Response) -> OrchardResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiStatus>(&body)
            .ok()
            .and_then(|api| api.message)
            .filter(|message| !message.is_empty())
            .unwrap_or_else(|| format!("cluster API returned {status}"));
        if status == reqwest::StatusCode::NOT_FOUND {
            Err(OrchardError::NotFound(message))
        } else {
            Err(OrchardError::backend(message))
        }
    }
}
