//! HTTP surface (A4): status page, Prometheus exposition, and liveness
//! endpoints. Hand-rolled HTML via `format!` — a templating engine is out
//! of scope for a handful of small, static-shaped pages.

use crate::metrics::Metrics;
use crate::status::{Readiness, StatusAggregator};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{extract::State, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const FAVICON_SVG: &str = include_str!("../assets/icon.svg");

#[derive(Clone)]
pub struct AppState {
    pub status: StatusAggregator,
    pub metrics: Arc<Metrics>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(status_page))
        .route("/favicon.ico", get(favicon))
        .route("/metrics", get(metrics_page))
        .route("/livez", get(ok_page))
        .route("/healthz", get(ok_page))
        .route("/readyz", get(readyz))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn favicon() -> Response {
    ([("content-type", "image/svg+xml")], FAVICON_SVG).into_response()
}

async fn metrics_page(State(state): State<AppState>) -> Response {
    state.metrics.render().into_response()
}

async fn ok_page() -> &'static str {
    "ok\n"
}

async fn readyz(State(state): State<AppState>) -> Response {
    let readiness = state.status.readiness();
    let body = format!("{}\n", readiness.as_str());
    if readiness == Readiness::Ready {
        (StatusCode::OK, body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}

async fn status_page(State(state): State<AppState>) -> Html<String> {
    let snapshot = state.status.snapshot();

    let mut rows = String::new();
    for crontab in &snapshot {
        for entry in &crontab.tasks {
            let (timestamp, duration, exit_code) = match &entry.status {
                Some(s) => (
                    s.timestamp.to_rfc3339(),
                    format!("{:?}", s.duration),
                    s.exit_code.to_string(),
                ),
                None => ("never run".to_string(), "-".to_string(), "?".to_string()),
            };
            rows.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                html_escape(&crontab.path),
                html_escape(&entry.task.string()),
                html_escape(&timestamp),
                html_escape(&duration),
                html_escape(&exit_code),
                html_escape(&entry.task.user),
            ));
        }
    }

    Html(format!(
        "<!DOCTYPE html><html><head><title>concron</title></head><body>\n\
         <h1>concron</h1>\n\
         <table border=\"1\">\n\
         <tr><th>source</th><th>task</th><th>last run</th><th>duration</th><th>exit code</th><th>user</th></tr>\n\
         {rows}\
         </table>\n\
         </body></html>\n"
    ))
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Html("<!DOCTYPE html><html><body><h1>Not found</h1></body></html>\n"))
        .into_response()
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> AppState {
        AppState {
            status: StatusAggregator::new(Arc::new(Metrics::new("0", "x"))),
            metrics: Arc::new(Metrics::new("0", "x")),
        }
    }

    #[tokio::test]
    async fn livez_returns_ok() {
        let app = router(state());
        let res = app
            .oneshot(Request::builder().uri("/livez").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_is_503_while_loading() {
        let app = router(state());
        let res = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn readyz_is_200_once_ready() {
        let state = state();
        state.status.finish_first_load();
        let app = router(state);
        let res = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let app = router(state());
        let res = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn post_to_root_is_405() {
        let app = router(state());
        let res = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn metrics_endpoint_exposes_info_gauge() {
        let app = router(state());
        let res = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
}
