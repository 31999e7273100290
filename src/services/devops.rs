use std::time::Duration as StdDuration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::config::DevOpsConfig;
use crate::core::orchestrator::WorkItemSource;
use crate::core::WorkItem;
use crate::error::{AppError, AppResult};

const DEVOPS_BASE_URL: &str = "https://dev.azure.com";

const FIELD_TITLE: &str = "System.Title";
const FIELD_TAGS: &str = "System.Tags";
const FIELD_ASSIGNED_TO: &str = "System.AssignedTo";
const FIELD_STATE: &str = "System.State";
const FIELD_CHANGED_DATE: &str = "System.ChangedDate";
const FIELD_ORIGINAL_ESTIMATE: &str = "Microsoft.VSTS.Scheduling.OriginalEstimate";
const FIELD_COMPLETED_WORK: &str = "Microsoft.VSTS.Scheduling.CompletedWork";

/// Azure DevOps work-item client authenticated with a personal access token.
///
/// Patches are idempotent from this caller's perspective: re-applying the
/// same completed-work value is accepted by the service without error.
#[derive(Debug, Clone)]
pub struct DevOpsService {
    client: Client,
    base_url: String,
    project: String,
    auth_header: String,
    api_version: String,
    iteration_path: Option<String>,
}

// ============================================================================
// DevOps API Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct WiqlResponse {
    #[serde(rename = "workItems", default)]
    work_items: Vec<WorkItemRef>,
}

#[derive(Debug, Deserialize)]
struct WorkItemRef {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct WorkItemBatchResponse {
    #[serde(default)]
    value: Vec<WorkItemDto>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkItemDto {
    pub id: i64,
    #[serde(default)]
    pub fields: serde_json::Value,
}

impl DevOpsService {
    pub fn new(config: &DevOpsConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()
            .map_err(AppError::Request)?;

        // PAT basic auth: empty user, token as password.
        let auth_header = format!("Basic {}", BASE64.encode(format!(":{}", config.pat)));

        Ok(DevOpsService {
            client,
            base_url: format!("{}/{}", DEVOPS_BASE_URL, config.organization),
            project: config.project.clone(),
            auth_header,
            api_version: config.api_version.clone(),
            iteration_path: config.iteration_path.clone(),
        })
    }

    fn check_status(status: reqwest::StatusCode, body: &str) -> AppResult<()> {
        match status.as_u16() {
            401 | 403 => Err(AppError::Credentials(format!(
                "Azure DevOps rejected the PAT: {}",
                truncate(body, 200)
            ))),
            429 => Err(AppError::RateLimited),
            503 => Err(AppError::ServiceUnavailable(
                "Azure DevOps is temporarily unavailable".to_string(),
            )),
            s if !status.is_success() => Err(AppError::WorkItemApi {
                status: s,
                message: truncate(body, 200),
            }),
            _ => Ok(()),
        }
    }

    fn wiql_query(&self) -> String {
        let mut query = String::from(
            "SELECT [System.Id] FROM WorkItems \
             WHERE [System.TeamProject] = @project \
             AND [System.WorkItemType] IN ('Task', 'Bug', 'User Story')",
        );
        if let Some(path) = &self.iteration_path {
            query.push_str(&format!(
                " AND [System.IterationPath] = '{}'",
                path.replace('\'', "''")
            ));
        }
        query.push_str(" ORDER BY [System.Id]");
        query
    }

    async fn query_ids(&self) -> AppResult<Vec<i64>> {
        let url = format!(
            "{}/{}/_apis/wit/wiql?api-version={}",
            self.base_url,
            urlencoding::encode(&self.project),
            self.api_version
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", &self.auth_header)
            .json(&json!({ "query": self.wiql_query() }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Self::check_status(status, &body)?;

        let parsed: WiqlResponse = serde_json::from_str(&body)
            .map_err(|e| AppError::MalformedRecord(format!("WIQL response: {}", e)))?;
        Ok(parsed.work_items.into_iter().map(|w| w.id).collect())
    }

    async fn fetch_batch(&self, ids: &[i64]) -> AppResult<Vec<WorkItemDto>> {
        let id_list = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let fields = [
            FIELD_TITLE,
            FIELD_TAGS,
            FIELD_ASSIGNED_TO,
            FIELD_STATE,
            FIELD_CHANGED_DATE,
            FIELD_ORIGINAL_ESTIMATE,
            FIELD_COMPLETED_WORK,
        ]
        .join(",");

        let url = format!(
            "{}/{}/_apis/wit/workitems?ids={}&fields={}&api-version={}",
            self.base_url,
            urlencoding::encode(&self.project),
            id_list,
            fields,
            self.api_version
        );

        let response = self
            .client
            .get(&url)
            .header("Authorization", &self.auth_header)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Self::check_status(status, &body)?;

        let parsed: WorkItemBatchResponse = serde_json::from_str(&body)
            .map_err(|e| AppError::MalformedRecord(format!("work item batch: {}", e)))?;
        Ok(parsed.value)
    }
}

#[async_trait]
impl WorkItemSource for DevOpsService {
    async fn list_work_items(&self) -> AppResult<Vec<WorkItem>> {
        let ids = self.query_ids().await?;
        tracing::info!("WIQL scope query returned {} work items", ids.len());

        let mut items = Vec::with_capacity(ids.len());
        // The batch read endpoint accepts at most 200 ids per call.
        for chunk in ids.chunks(200) {
            for dto in self.fetch_batch(chunk).await? {
                items.push(to_work_item(dto));
            }
        }
        Ok(items)
    }

    async fn update_completed_work(
        &self,
        work_item_id: i64,
        hours: f64,
        comment: &str,
    ) -> AppResult<()> {
        let url = format!(
            "{}/{}/_apis/wit/workitems/{}?api-version={}",
            self.base_url,
            urlencoding::encode(&self.project),
            work_item_id,
            self.api_version
        );

        let operations = json!([
            {
                "op": "add",
                "path": format!("/fields/{}", FIELD_COMPLETED_WORK),
                "value": hours
            },
            {
                "op": "add",
                "path": "/fields/System.History",
                "value": comment
            }
        ]);

        let response = self
            .client
            .patch(&url)
            .header("Authorization", &self.auth_header)
            .header("Content-Type", "application/json-patch+json")
            .json(&operations)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Self::check_status(status, &body)?;

        tracing::debug!("Patched work item {} to {:.2}h", work_item_id, hours);
        Ok(())
    }
}

/// Flatten the tracker's field map into our WorkItem shape. Absent or
/// unexpected fields degrade to defaults rather than failing the fetch.
fn to_work_item(dto: WorkItemDto) -> WorkItem {
    let fields = &dto.fields;

    let title = fields[FIELD_TITLE].as_str().unwrap_or_default().to_string();

    let tags = fields[FIELD_TAGS]
        .as_str()
        .map(|raw| {
            raw.split(';')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();

    // AssignedTo is an identity object on modern API versions but a plain
    // display string on older ones.
    let assigned = match &fields[FIELD_ASSIGNED_TO] {
        serde_json::Value::Object(identity) => identity
            .get("uniqueName")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        serde_json::Value::String(s) => Some(s.clone()),
        _ => None,
    };

    let changed_at = fields[FIELD_CHANGED_DATE]
        .as_str()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc));

    WorkItem {
        id: dto.id,
        title,
        tags,
        team: assigned.into_iter().collect(),
        estimated_hours: fields[FIELD_ORIGINAL_ESTIMATE].as_f64().unwrap_or(0.0),
        completed_hours: fields[FIELD_COMPLETED_WORK].as_f64(),
        changed_at,
        state: fields[FIELD_STATE].as_str().unwrap_or_default().to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut t: String = s.chars().take(max).collect();
        t.push_str("...");
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(iteration_path: Option<&str>) -> DevOpsService {
        DevOpsService::new(&DevOpsConfig {
            organization: "acme".to_string(),
            project: "Platform".to_string(),
            pat: "secret".to_string(),
            iteration_path: iteration_path.map(|s| s.to_string()),
            api_version: "7.1".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn wiql_scopes_by_iteration_and_escapes_quotes() {
        let q = service(Some("Platform\\Sprint '25")).wiql_query();
        assert!(q.contains("[System.IterationPath] = 'Platform\\Sprint ''25'"));

        let q = service(None).wiql_query();
        assert!(!q.contains("IterationPath"));
        assert!(q.contains("[System.TeamProject] = @project"));
    }

    #[test]
    fn dto_fields_flatten_into_work_item() {
        let dto: WorkItemDto = serde_json::from_value(serde_json::json!({
            "id": 101,
            "fields": {
                "System.Title": "Checkout rework",
                "System.Tags": "payments; backend ;",
                "System.State": "Active",
                "System.AssignedTo": { "uniqueName": "dev@example.com", "displayName": "Dev" },
                "System.ChangedDate": "2025-03-01T12:00:00Z",
                "Microsoft.VSTS.Scheduling.OriginalEstimate": 8.0,
                "Microsoft.VSTS.Scheduling.CompletedWork": 2.5
            }
        }))
        .unwrap();

        let item = to_work_item(dto);
        assert_eq!(item.id, 101);
        assert_eq!(item.tags, vec!["payments", "backend"]);
        assert_eq!(item.team, vec!["dev@example.com"]);
        assert_eq!(item.estimated_hours, 8.0);
        assert_eq!(item.completed_hours, Some(2.5));
        assert!(item.changed_at.is_some());
    }

    #[test]
    fn sparse_dto_degrades_to_defaults() {
        let dto: WorkItemDto = serde_json::from_value(serde_json::json!({
            "id": 102,
            "fields": { "System.AssignedTo": "Old Style Name" }
        }))
        .unwrap();

        let item = to_work_item(dto);
        assert_eq!(item.estimated_hours, 0.0);
        assert_eq!(item.completed_hours, None);
        assert!(item.tags.is_empty());
        assert_eq!(item.team, vec!["Old Style Name"]);
    }

    #[test]
    fn rate_limit_and_auth_statuses_classify() {
        let err =
            DevOpsService::check_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "").unwrap_err();
        assert!(err.is_transient());

        let err = DevOpsService::check_status(reqwest::StatusCode::UNAUTHORIZED, "").unwrap_err();
        assert!(err.is_fatal());

        let err =
            DevOpsService::check_status(reqwest::StatusCode::BAD_GATEWAY, "upstream").unwrap_err();
        assert!(err.is_transient());

        let err = DevOpsService::check_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, "")
            .unwrap_err();
        assert!(err.is_transient());

        assert!(DevOpsService::check_status(reqwest::StatusCode::OK, "").is_ok());
    }
}
