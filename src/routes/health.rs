use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::scheduler::SchedulerHealth;
use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    pub dry_run: bool,
    pub scheduler: SchedulerHealth,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let scheduler = state.scheduler.health().await;

    let response = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        dry_run: state.config.apply.dry_run,
        scheduler,
    };

    (StatusCode::OK, Json(response))
}

#[cfg(test)]
mod tests {
    use crate::config::{Config, OverlapPolicy, SchedulerConfig};
    use crate::core::orchestrator::{RunDriver, RunHandles};
    use crate::core::report::{ReportTotals, RunReport, TriggerKind};
    use crate::db::test_pool;
    use crate::error::AppResult;
    use crate::scheduler::Scheduler;
    use crate::AppState;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct NoopDriver;

    #[async_trait]
    impl RunDriver for NoopDriver {
        async fn execute(&self, trigger: TriggerKind) -> AppResult<RunReport> {
            Ok(RunReport {
                run_id: "noop".to_string(),
                trigger,
                resumed: false,
                dry_run: false,
                started_at: chrono::Utc::now(),
                finished_at: chrono::Utc::now(),
                succeeded: vec![],
                skipped: vec![],
                conflicted: vec![],
                failed: vec![],
                conflicts: vec![],
                comparisons: vec![],
                unmatched: vec![],
                excluded_meetings: 0,
                totals: ReportTotals::default(),
                cancelled: false,
            })
        }
    }

    #[tokio::test]
    async fn health_endpoint_reports_scheduler_state() {
        let pool = test_pool().await;
        let scheduler = Scheduler::new(
            &SchedulerConfig {
                cron: None,
                interval_minutes: None,
                overlap_policy: OverlapPolicy::Queue,
                history_capacity: 10,
            },
            Arc::new(NoopDriver),
        )
        .unwrap();

        let state = Arc::new(AppState {
            db: pool,
            config: Config::default(),
            scheduler,
            run_handles: RunHandles::new(),
        });

        let app = Router::new()
            .route("/health", get(super::health_check))
            .with_state(state);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "healthy");
        assert_eq!(parsed["scheduler"]["status"], "up");
        assert_eq!(parsed["scheduler"]["run_active"], false);
    }
}
