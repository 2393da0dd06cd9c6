use std::{sync::Mutex, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::CollabError,
    types::{ClaimOutcome, Repository, StatusUpdate, WorkItem},
};

/// Facade over the external issue tracker. Claim semantics MUST be atomic at
/// the tracker; on `Conflict` the caller abandons the item without retrying.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    async fn list_active_repositories(&self) -> Result<Vec<Repository>, CollabError>;
    async fn list_candidate_items(&self, project_id: &str) -> Result<Vec<WorkItem>, CollabError>;
    async fn claim_item(
        &self,
        project_id: &str,
        item_id: &str,
        claimant: &str,
    ) -> Result<ClaimOutcome, CollabError>;
    async fn update_item_status(
        &self,
        project_id: &str,
        item_id: &str,
        update: StatusUpdate,
    ) -> Result<(), CollabError>;
    async fn health(&self) -> Result<(), CollabError>;
}

/// HTTP-backed tracker client, grounded in the tracker's illustrative REST
/// contract: `GET /active-repos`, `GET /projects/{id}/tasks`,
/// `POST /projects/{id}/claim`, `PUT /projects/{id}/status`, `GET /health`.
pub struct HttpTrackerClient {
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    retry_count: u32,
    client: reqwest::Client,
}

impl HttpTrackerClient {
    pub fn new(base_url: String, api_key: Option<String>, timeout_secs: u64, retry_count: u32) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout: Duration::from_secs(timeout_secs),
            retry_count,
            client: reqwest::Client::new(),
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    /// Retries idempotent GETs up to `retry_count` times on transport-level
    /// failure; does not retry claim/status mutations (conflict is a valid
    /// non-error outcome there, not a transient failure).
    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, CollabError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0;
        loop {
            let result = self
                .authed(self.client.get(&url))
                .timeout(self.timeout)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.json::<T>().await?);
                }
                Ok(resp) => {
                    return Err(CollabError::Http(format!(
                        "{} returned {}",
                        url,
                        resp.status()
                    )));
                }
                Err(e) if attempt < self.retry_count => {
                    attempt += 1;
                    warn!(url, attempt, "tracker request failed, retrying: {e}");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[derive(Deserialize)]
struct ActiveReposResponse {
    repositories: Vec<Repository>,
}

#[derive(Serialize)]
struct ClaimRequest<'a> {
    task_number: &'a str,
    agent_id: &'a str,
    claimed_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
impl TrackerClient for HttpTrackerClient {
    async fn list_active_repositories(&self) -> Result<Vec<Repository>, CollabError> {
        let resp: ActiveReposResponse = self.get_json("/active-repos").await?;
        Ok(resp.repositories)
    }

    async fn list_candidate_items(&self, project_id: &str) -> Result<Vec<WorkItem>, CollabError> {
        self.get_json(&format!("/projects/{project_id}/tasks")).await
    }

    async fn claim_item(
        &self,
        project_id: &str,
        item_id: &str,
        claimant: &str,
    ) -> Result<ClaimOutcome, CollabError> {
        let url = format!("{}/projects/{project_id}/claim", self.base_url);
        let body = ClaimRequest {
            task_number: item_id,
            agent_id: claimant,
            claimed_at: chrono::Utc::now(),
        };
        let resp = self
            .authed(self.client.post(&url))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Ok(ClaimOutcome::Conflict);
        }
        if !resp.status().is_success() {
            return Err(CollabError::Http(format!(
                "{} returned {}",
                url,
                resp.status()
            )));
        }
        debug!(project_id, item_id, claimant, "claimed item");
        Ok(ClaimOutcome::Ok)
    }

    async fn update_item_status(
        &self,
        project_id: &str,
        item_id: &str,
        update: StatusUpdate,
    ) -> Result<(), CollabError> {
        let url = format!("{}/projects/{project_id}/status", self.base_url);
        let _ = item_id;
        let resp = self
            .authed(self.client.put(&url))
            .timeout(self.timeout)
            .json(&update)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(CollabError::Http(format!(
                "{} returned {}",
                url,
                resp.status()
            )));
        }
        Ok(())
    }

    async fn health(&self) -> Result<(), CollabError> {
        let url = format!("{}/health", self.base_url);
        let resp = self.client.get(&url).timeout(self.timeout).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(CollabError::Http(format!("{url} returned {}", resp.status())))
        }
    }
}

/// In-memory tracker used by engine tests: repositories/items are seeded up
/// front, claims are exclusive, and the first claimant wins.
#[derive(Default)]
pub struct MockTrackerClient {
    repositories: Vec<Repository>,
    items: Mutex<Vec<WorkItem>>,
    claims: Mutex<Vec<(String, String)>>,
    status_updates: Mutex<Vec<(String, String, StatusUpdate)>>,
}

impl MockTrackerClient {
    pub fn new(repositories: Vec<Repository>, items: Vec<WorkItem>) -> Self {
        Self {
            repositories,
            items: Mutex::new(items),
            claims: Mutex::new(Vec::new()),
            status_updates: Mutex::new(Vec::new()),
        }
    }

    pub fn status_updates(&self) -> Vec<(String, String, StatusUpdate)> {
        self.status_updates.lock().unwrap().clone()
    }

    pub fn claims(&self) -> Vec<(String, String)> {
        self.claims.lock().unwrap().clone()
    }
}

#[async_trait]
impl TrackerClient for MockTrackerClient {
    async fn list_active_repositories(&self) -> Result<Vec<Repository>, CollabError> {
        Ok(self.repositories.clone())
    }

    async fn list_candidate_items(&self, project_id: &str) -> Result<Vec<WorkItem>, CollabError> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn claim_item(
        &self,
        project_id: &str,
        item_id: &str,
        claimant: &str,
    ) -> Result<ClaimOutcome, CollabError> {
        let mut claims = self.claims.lock().unwrap();
        let key = (project_id.to_string(), item_id.to_string());
        if claims.iter().any(|(p, i)| *p == key.0 && *i == key.1) {
            return Ok(ClaimOutcome::Conflict);
        }
        claims.push(key);
        debug!(project_id, item_id, claimant, "mock tracker claimed item");
        Ok(ClaimOutcome::Ok)
    }

    async fn update_item_status(
        &self,
        project_id: &str,
        item_id: &str,
        update: StatusUpdate,
    ) -> Result<(), CollabError> {
        self.status_updates
            .lock()
            .unwrap()
            .push((project_id.to_string(), item_id.to_string(), update));
        Ok(())
    }

    async fn health(&self) -> Result<(), CollabError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkItemState;

    fn item(project: &str, id: &str) -> WorkItem {
        WorkItem {
            item_id: id.into(),
            project_id: project.into(),
            title: "title".into(),
            body: "body".into(),
            state: WorkItemState::Open,
            labels: vec![],
            assignee: None,
            task_type: "feature".into(),
            priority: 1,
            requirements: vec![],
            deliverables: vec![],
            context: Default::default(),
        }
    }

    #[tokio::test]
    async fn second_claim_on_same_item_conflicts() {
        let tracker = MockTrackerClient::new(vec![], vec![item("1", "42")]);
        assert_eq!(
            tracker.claim_item("1", "42", "node-a").await.unwrap(),
            ClaimOutcome::Ok
        );
        assert_eq!(
            tracker.claim_item("1", "42", "node-b").await.unwrap(),
            ClaimOutcome::Conflict
        );
    }

    #[tokio::test]
    async fn candidate_items_are_filtered_by_project() {
        let tracker = MockTrackerClient::new(vec![], vec![item("1", "a"), item("2", "b")]);
        let items = tracker.list_candidate_items("1").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item_id, "a");
    }
}
