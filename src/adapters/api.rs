use actix_web::{HttpResponse, Responder, get, post, web};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::app::commands::PowerCommands;
use crate::app::services::ServiceError;
use crate::domain::models::{OutageEvent, OutageStats};

#[derive(Clone)]
pub struct ApiState {
    pub commands: PowerCommands,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub state: String,
    pub last_checked_at: Option<String>,
    pub open_event_id: Option<i64>,
    pub outage_started_at: Option<String>,
    pub downtime_seconds: Option<i64>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutageResponse {
    pub id: i64,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub duration_seconds: Option<i64>,
    pub ongoing: bool,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutageListResponse {
    pub items: Vec<OutageResponse>,
    pub total: i64,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub page: u32,
    pub page_count: u32,
    pub total: i64,
    pub window_days: i64,
    pub items: Vec<OutageResponse>,
    pub stats: StatsResponse,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub days: i64,
    pub count: i64,
    pub closed_count: i64,
    pub total_downtime_seconds: i64,
    pub average_duration_seconds: i64,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FixResponse {
    pub changed: bool,
    pub state: String,
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct OutagesQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub days: Option<i64>,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(get_status_endpoint)
        .service(list_outages_endpoint)
        .service(get_stats_endpoint)
        .service(fix_endpoint);
}

fn api_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn outage_response(event: OutageEvent) -> OutageResponse {
    OutageResponse {
        id: event.id,
        started_at: api_timestamp(event.started_at),
        ongoing: event.is_open(),
        ended_at: event.ended_at.map(api_timestamp),
        duration_seconds: event.duration_seconds,
    }
}

fn stats_response(days: i64, stats: OutageStats) -> StatsResponse {
    StatsResponse {
        days,
        count: stats.count,
        closed_count: stats.closed_count,
        total_downtime_seconds: stats.total_downtime_seconds,
        average_duration_seconds: stats.average_duration_seconds,
    }
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[get("/status")]
async fn get_status_endpoint(state: web::Data<ApiState>) -> impl Responder {
    match state.commands.status() {
        Ok(report) => HttpResponse::Ok().json(StatusResponse {
            state: report.state.to_string(),
            last_checked_at: report.last_checked_at.map(api_timestamp),
            open_event_id: report.outage.as_ref().map(|outage| outage.event_id),
            outage_started_at: report
                .outage
                .as_ref()
                .map(|outage| api_timestamp(outage.started_at)),
            downtime_seconds: report.outage.as_ref().map(|outage| outage.elapsed_seconds),
        }),
        Err(error) => service_error_response(error),
    }
}

/// `?page=N` pages the recent history window; `?limit=&offset=` walks the
/// whole history.
#[get("/outages")]
async fn list_outages_endpoint(
    state: web::Data<ApiState>,
    query: web::Query<OutagesQuery>,
) -> impl Responder {
    if let Some(page) = query.page {
        return match state.commands.history(page) {
            Ok(history) => HttpResponse::Ok().json(HistoryResponse {
                page: history.page,
                page_count: history.page_count,
                total: history.total,
                window_days: history.window_days,
                items: history.outages.into_iter().map(outage_response).collect(),
                stats: stats_response(history.window_days, history.stats),
            }),
            Err(error) => service_error_response(error),
        };
    }

    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0);

    match state.commands.outages(limit, offset) {
        Ok(page) => HttpResponse::Ok().json(OutageListResponse {
            items: page.outages.into_iter().map(outage_response).collect(),
            total: page.total,
            limit: page.limit,
            offset: page.offset,
        }),
        Err(error) => service_error_response(error),
    }
}

#[get("/stats")]
async fn get_stats_endpoint(
    state: web::Data<ApiState>,
    query: web::Query<StatsQuery>,
) -> impl Responder {
    let days = query.days.unwrap_or(30).clamp(1, 3_650);

    match state.commands.stats(days) {
        Ok(stats) => HttpResponse::Ok().json(stats_response(days, stats)),
        Err(error) => service_error_response(error),
    }
}

#[post("/fix")]
async fn fix_endpoint(state: web::Data<ApiState>) -> impl Responder {
    let commands = state.commands.clone();

    match web::block(move || commands.fix()).await {
        Ok(Ok(outcome)) => HttpResponse::Ok().json(FixResponse {
            changed: outcome.changed(),
            state: outcome.state().to_string(),
            description: outcome.describe(),
        }),
        Ok(Err(error)) => service_error_response(error),
        Err(error) => HttpResponse::InternalServerError().json(serde_json::json!({
            "error": format!("fix did not complete: {error}")
        })),
    }
}

fn service_error_response(error: ServiceError) -> HttpResponse {
    match error {
        ServiceError::DbLockPoisoned => {
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "database lock poisoned"
            }))
        }
        ServiceError::Database(error) => {
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": format!("database query failed: {error}")
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use actix_web::{App, body::to_bytes, http::StatusCode, test, web};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use crate::adapters::db;
    use crate::domain::models::{CurrentStatus, PowerState};
    use crate::test_support::{CommandsHarness, commands_harness};

    use super::{ApiState, configure_routes};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 20, 12, 0, 0).unwrap()
    }

    fn state(harness: &CommandsHarness) -> web::Data<ApiState> {
        web::Data::new(ApiState {
            commands: harness.commands.clone(),
        })
    }

    fn seed_closed_outages(harness: &CommandsHarness, count: i64) {
        harness
            .store
            .with_transaction(|tx| {
                for index in 0..count {
                    let start = now() - Duration::hours(index + 1);
                    db::insert_closed_outage(tx, start, start + Duration::minutes(5))?;
                }
                Ok(())
            })
            .expect("seed should be written");
    }

    #[actix_web::test]
    async fn health_endpoint_returns_ok() {
        let harness = commands_harness("api-health", now());
        let app = test::init_service(
            App::new()
                .app_data(state(&harness))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn status_is_unknown_before_first_check() {
        let harness = commands_harness("api-status-empty", now());
        let app = test::init_service(
            App::new()
                .app_data(state(&harness))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/status").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = to_bytes(resp.into_body())
            .await
            .expect("body should be readable");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("body should be json");
        assert_eq!(json["state"], "UNKNOWN");
        assert_eq!(json["lastCheckedAt"], serde_json::Value::Null);
    }

    #[actix_web::test]
    async fn status_reports_ongoing_outage() {
        let harness = commands_harness("api-status-down", now());
        harness
            .store
            .with_transaction(|tx| {
                let id = db::record_outage_start(tx, now() - Duration::minutes(10))?;
                db::set_current_status(
                    tx,
                    &CurrentStatus {
                        state: PowerState::Down,
                        last_checked_at: now(),
                        open_event_id: Some(id),
                    },
                )
            })
            .expect("seed should be written");

        let app = test::init_service(
            App::new()
                .app_data(state(&harness))
                .configure(configure_routes),
        )
        .await;
        let req = test::TestRequest::get().uri("/status").to_request();
        let resp = test::call_service(&app, req).await;

        let body = to_bytes(resp.into_body())
            .await
            .expect("body should be readable");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("body should be json");
        assert_eq!(json["state"], "DOWN");
        assert_eq!(json["outageStartedAt"], "2026-02-20T11:50:00.000Z");
        assert_eq!(json["downtimeSeconds"], 600);
    }

    #[actix_web::test]
    async fn outages_page_returns_history_window() {
        let harness = commands_harness("api-outages-page", now());
        seed_closed_outages(&harness, 25);

        let app = test::init_service(
            App::new()
                .app_data(state(&harness))
                .configure(configure_routes),
        )
        .await;
        let req = test::TestRequest::get()
            .uri("/outages?page=3")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = to_bytes(resp.into_body())
            .await
            .expect("body should be readable");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("body should be json");
        assert_eq!(json["pageCount"], 3);
        assert_eq!(json["total"], 25);
        assert_eq!(json["items"].as_array().map(Vec::len), Some(5));
        assert_eq!(json["stats"]["averageDurationSeconds"], 300);
    }

    #[actix_web::test]
    async fn outages_support_limit_and_offset() {
        let harness = commands_harness("api-outages-limit", now());
        seed_closed_outages(&harness, 3);

        let app = test::init_service(
            App::new()
                .app_data(state(&harness))
                .configure(configure_routes),
        )
        .await;
        let req = test::TestRequest::get()
            .uri("/outages?limit=2&offset=1")
            .to_request();
        let resp = test::call_service(&app, req).await;

        let body = to_bytes(resp.into_body())
            .await
            .expect("body should be readable");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("body should be json");
        let items = json["items"].as_array().expect("items should be an array");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["startedAt"], "2026-02-20T10:00:00.000Z");
        assert_eq!(items[0]["ongoing"], false);
        assert_eq!(json["total"], 3);
    }

    #[actix_web::test]
    async fn stats_cover_requested_days() {
        let harness = commands_harness("api-stats", now());
        seed_closed_outages(&harness, 4);

        let app = test::init_service(
            App::new()
                .app_data(state(&harness))
                .configure(configure_routes),
        )
        .await;
        let req = test::TestRequest::get().uri("/stats?days=7").to_request();
        let resp = test::call_service(&app, req).await;

        let body = to_bytes(resp.into_body())
            .await
            .expect("body should be readable");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("body should be json");
        assert_eq!(json["days"], 7);
        assert_eq!(json["count"], 4);
        assert_eq!(json["totalDowntimeSeconds"], 1_200);
    }

    #[actix_web::test]
    async fn fix_marks_power_down_once() {
        let harness = commands_harness("api-fix", now());
        harness.probe.set(false);

        let app = test::init_service(
            App::new()
                .app_data(state(&harness))
                .configure(configure_routes),
        )
        .await;

        let first = test::call_service(&app, test::TestRequest::post().uri("/fix").to_request()).await;
        assert_eq!(first.status(), StatusCode::OK);
        let body = to_bytes(first.into_body())
            .await
            .expect("body should be readable");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("body should be json");
        assert_eq!(json["changed"], true);
        assert_eq!(json["state"], "DOWN");

        let second =
            test::call_service(&app, test::TestRequest::post().uri("/fix").to_request()).await;
        let body = to_bytes(second.into_body())
            .await
            .expect("body should be readable");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("body should be json");
        assert_eq!(json["changed"], false);
    }
}
