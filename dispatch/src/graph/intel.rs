//! Optional graph-intelligence overlay.
//!
//! A read-only analytics service that ranks items by structural importance.
//! Every call degrades to an empty result when the service is unreachable —
//! the orchestrator keeps functioning with reduced intelligence.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Request timeout for overlay calls.
const INTEL_TIMEOUT: Duration = Duration::from_secs(5);

/// One parallel track of the recommended execution plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionTrack {
    pub name: String,
    pub item_ids: Vec<String>,
}

/// Structural insights over the dependency graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphInsights {
    /// Items many others are waiting on.
    #[serde(default)]
    pub bottlenecks: Vec<String>,
    /// Items whose completion opens the most downstream work.
    #[serde(default)]
    pub keystones: Vec<String>,
    /// Cycles the service found, as id paths.
    #[serde(default)]
    pub cycles: Vec<Vec<String>>,
}

/// Ranking hint for one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityRecommendation {
    pub id: String,
    /// How many other items this one unblocks.
    pub unblock_count: usize,
}

/// HTTP client for the overlay service.
pub struct GraphIntelClient {
    base_url: String,
    client: reqwest::Client,
}

impl GraphIntelClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned + Default>(&self, path: &str) -> T {
        let url = format!("{}/{path}", self.base_url);
        let result = self
            .client
            .get(&url)
            .timeout(INTEL_TIMEOUT)
            .send()
            .await
            .and_then(|resp| resp.error_for_status());
        match result {
            Ok(resp) => match resp.json::<T>().await {
                Ok(value) => value,
                Err(e) => {
                    warn!(url = %url, error = %e, "Intel response unparseable — treating as empty");
                    T::default()
                }
            },
            Err(e) => {
                warn!(url = %url, error = %e, "Intel overlay unreachable — treating as empty");
                T::default()
            }
        }
    }

    /// Recommended parallel execution tracks. Empty when unavailable.
    pub async fn execution_plan(&self) -> Vec<ExecutionTrack> {
        self.get_json("execution-plan").await
    }

    /// Bottlenecks, keystones and cycles. Default-empty when unavailable.
    pub async fn insights(&self) -> GraphInsights {
        self.get_json("insights").await
    }

    /// Per-item unblock counts. Empty when unavailable.
    pub async fn priority_recommendations(&self) -> Vec<PriorityRecommendation> {
        self.get_json("priority-recommendations").await
    }

    /// Whether the overlay answers at all right now.
    pub async fn is_reachable(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).timeout(INTEL_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
