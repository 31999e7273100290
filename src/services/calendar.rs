use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::config::GraphConfig;
use crate::core::orchestrator::CalendarSource;
use crate::core::MeetingRecord;
use crate::error::{AppError, AppResult};

const GRAPH_LOGIN_URL: &str = "https://login.microsoftonline.com";
const GRAPH_API_URL: &str = "https://graph.microsoft.com/v1.0";

/// Microsoft Graph calendar client.
///
/// Holds an app-only access token obtained via client credentials and
/// refreshed when it nears expiry. Token refresh flows beyond that single
/// grant are out of scope.
#[derive(Debug, Clone)]
pub struct CalendarService {
    client: Client,
    client_id: String,
    client_secret: String,
    tenant_id: String,
    app_access_token: Arc<RwLock<Option<AppAccessToken>>>,
}

#[derive(Debug, Clone)]
struct AppAccessToken {
    token: String,
    expires_at: DateTime<Utc>,
}

// ============================================================================
// Graph API Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    #[serde(default)]
    value: Vec<CalendarEvent>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: Option<String>,
    pub subject: Option<String>,
    pub is_cancelled: Option<bool>,
    pub start: Option<GraphDateTime>,
    pub end: Option<GraphDateTime>,
    #[serde(default)]
    pub attendees: Vec<GraphAttendee>,
    pub organizer: Option<GraphRecipient>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDateTime {
    pub date_time: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphAttendee {
    pub email_address: Option<GraphEmailAddress>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphRecipient {
    pub email_address: Option<GraphEmailAddress>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEmailAddress {
    pub address: Option<String>,
}

impl CalendarService {
    pub fn new(config: &GraphConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()
            .map_err(AppError::Request)?;

        Ok(CalendarService {
            client,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            tenant_id: config.tenant_id.clone(),
            app_access_token: Arc::new(RwLock::new(None)),
        })
    }

    /// Get a valid app access token, requesting a fresh one when the cached
    /// token is missing or within a minute of expiry.
    async fn get_app_access_token(&self) -> AppResult<String> {
        {
            let guard = self.app_access_token.read().await;
            if let Some(token) = guard.as_ref() {
                if token.expires_at > Utc::now() + Duration::seconds(60) {
                    return Ok(token.token.clone());
                }
            }
        }

        let url = format!("{}/{}/oauth2/v2.0/token", GRAPH_LOGIN_URL, self.tenant_id);
        let response = self
            .client
            .post(&url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", "https://graph.microsoft.com/.default"),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 400 || status.as_u16() == 401 {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Credentials(format!(
                "Graph token request rejected: {}",
                truncate(&body, 200)
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::CalendarApi {
                status: status.as_u16(),
                message: truncate(&body, 200),
            });
        }

        let token: TokenResponse = response.json().await?;
        let expires_at = Utc::now() + Duration::seconds(token.expires_in);

        *self.app_access_token.write().await = Some(AppAccessToken {
            token: token.access_token.clone(),
            expires_at,
        });

        tracing::debug!("Obtained Graph app access token (expires {})", expires_at);
        Ok(token.access_token)
    }

    async fn fetch_events_page(&self, url: &str, token: &str) -> AppResult<EventsResponse> {
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .header("Prefer", "outlook.timezone=\"UTC\"")
            .send()
            .await?;

        let status = response.status();
        match status.as_u16() {
            401 | 403 => {
                let body = response.text().await.unwrap_or_default();
                Err(AppError::Credentials(format!(
                    "Graph rejected the request: {}",
                    truncate(&body, 200)
                )))
            }
            429 => Err(AppError::RateLimited),
            _ if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                Err(AppError::CalendarApi {
                    status: status.as_u16(),
                    message: truncate(&body, 200),
                })
            }
            _ => Ok(response.json().await?),
        }
    }
}

#[async_trait]
impl CalendarSource for CalendarService {
    async fn list_meetings(
        &self,
        user: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Vec<MeetingRecord>> {
        let token = self.get_app_access_token().await?;

        let mut url = format!(
            "{}/users/{}/calendarView?startDateTime={}&endDateTime={}&$top=200",
            GRAPH_API_URL,
            urlencoding::encode(user),
            urlencoding::encode(&start.to_rfc3339()),
            urlencoding::encode(&end.to_rfc3339()),
        );

        let mut meetings = Vec::new();
        let mut skipped = 0usize;

        // Follow server paging; Graph caps page size regardless of $top.
        for _ in 0..20 {
            let page = self.fetch_events_page(&url, &token).await?;
            for event in page.value {
                match parse_event(&event) {
                    Some(meeting) => meetings.push(meeting),
                    None => {
                        skipped += 1;
                        tracing::warn!(
                            "Skipping malformed calendar event {:?} for {}",
                            event.id,
                            user
                        );
                    }
                }
            }
            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }

        tracing::info!(
            "Fetched {} meetings for {} ({} malformed skipped)",
            meetings.len(),
            user,
            skipped
        );
        Ok(meetings)
    }
}

/// Map one Graph event to a MeetingRecord. Events missing an id or a
/// parseable start/end are data errors: dropped with a warning by the
/// caller, never fatal.
fn parse_event(event: &CalendarEvent) -> Option<MeetingRecord> {
    let id = event.id.clone()?;
    let start = parse_graph_datetime(&event.start.as_ref()?.date_time)?;
    let end = parse_graph_datetime(&event.end.as_ref()?.date_time)?;

    let attendees = event
        .attendees
        .iter()
        .filter_map(|a| a.email_address.as_ref().and_then(|e| e.address.clone()))
        .collect();

    let organizer = event
        .organizer
        .as_ref()
        .and_then(|o| o.email_address.as_ref())
        .and_then(|e| e.address.clone())
        .unwrap_or_default();

    Some(MeetingRecord {
        id,
        subject: event.subject.clone().unwrap_or_else(|| "No Subject".to_string()),
        organizer,
        start,
        end,
        attendees,
        is_cancelled: event.is_cancelled.unwrap_or(false),
    })
}

/// Graph returns naive timestamps like `2025-03-03T09:00:00.0000000` (UTC
/// under our Prefer header), but offsets appear in some tenants; accept both.
fn parse_graph_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
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
