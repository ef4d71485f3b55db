//! switchyard-api — REST surface for Switchyard.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/health` | Liveness |
//! | GET | `/api/v1/instances` | List instances |
//! | POST | `/api/v1/instances` | Register an externally started instance |
//! | GET | `/api/v1/instances/:id` | Instance details |
//! | DELETE | `/api/v1/instances/:id` | Remove an instance |
//! | POST | `/api/v1/instances/:id/usage` | Push resource usage |
//! | GET | `/api/v1/sessions?user_id=` | List sessions |
//! | DELETE | `/api/v1/sessions/:id` | Drop a session |
//! | GET | `/api/v1/connections?instance_id=` | List live connections |
//! | GET | `/api/v1/connections/:id` | Connection details |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;
pub mod prometheus;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::routing::{delete, get, post};

use switchyard_autoscale::Autoscaler;
use switchyard_registry::InstanceRegistry;
use switchyard_router::ConnectionTable;
use switchyard_sessions::SessionStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<InstanceRegistry>,
    pub sessions: Arc<SessionStore>,
    pub autoscaler: Arc<Autoscaler>,
    pub connections: Arc<ConnectionTable>,
    pub started: Instant,
}

/// Build the REST router (API + health + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route(
            "/instances",
            get(handlers::list_instances).post(handlers::register_instance),
        )
        .route(
            "/instances/{id}",
            get(handlers::get_instance).delete(handlers::delete_instance),
        )
        .route("/instances/{id}/usage", post(handlers::report_usage))
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/{id}", delete(handlers::delete_session))
        .route("/connections", get(handlers::list_connections))
        .route("/connections/{id}", get(handlers::get_connection))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(handlers::health).with_state(state.clone()))
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use switchyard_core::config::AutoScalingConfig;
    use switchyard_core::{ConnectionInfo, InstanceMetadata, SessionClaims};

    fn state() -> ApiState {
        let registry = Arc::new(InstanceRegistry::with_limits(4, 10));
        ApiState {
            autoscaler: Arc::new(Autoscaler::new(
                registry.clone(),
                AutoScalingConfig::default(),
            )),
            registry,
            sessions: Arc::new(SessionStore::new(Duration::from_secs(60))),
            connections: Arc::new(ConnectionTable::new()),
            started: Instant::now(),
        }
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = build_router(state());
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn instances_round_trip_through_router() {
        let state = state();
        let app = build_router(state.clone());

        let resp = app
            .clone()
            .oneshot(
                Request::post("/api/v1/instances")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"endpoint":"ws://10.0.0.5:9000/mcp","metadata":{"zone":"a"}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        let id = created["data"]["id"].as_str().unwrap().to_string();
        assert_eq!(created["data"]["status"], "active");
        assert_eq!(created["data"]["metadata"]["zone"], "a");

        let resp = app
            .clone()
            .oneshot(
                Request::post(format!("/api/v1/instances/{id}/usage"))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"cpu":91.5,"memory":40}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(Request::get("/api/v1/instances").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let list = body_json(resp).await;
        assert_eq!(list["success"], true);
        assert_eq!(list["data"][0]["resourceUsage"]["cpu"], 91.5);

        let resp = app
            .oneshot(
                Request::delete(format!("/api/v1/instances/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn missing_instance_is_404_with_error_body() {
        let app = build_router(state());
        let resp = app
            .oneshot(
                Request::get("/api/v1/instances/inst-missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "instance not found");
    }

    #[tokio::test]
    async fn sessions_query_by_user() {
        let state = state();
        state
            .sessions
            .get_or_create_session(&SessionClaims::new("alice", None));
        state
            .sessions
            .get_or_create_session(&SessionClaims::new("alice", Some("org-2".to_string())));
        state
            .sessions
            .get_or_create_session(&SessionClaims::new("bob", None));
        let app = build_router(state);

        let resp = app
            .clone()
            .oneshot(
                Request::get("/api/v1/sessions?user_id=alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["data"].as_array().unwrap().len(), 2);

        let resp = app
            .oneshot(Request::get("/api/v1/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["data"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn connections_listed_and_filtered_by_instance() {
        let state = state();
        for (id, instance, opened_at) in [("c1", "inst-a", 10), ("c2", "inst-b", 20), ("c3", "inst-a", 30)] {
            state.connections.insert(ConnectionInfo {
                id: id.to_string(),
                session_id: "sess-1".to_string(),
                instance_id: instance.to_string(),
                opened_at,
            });
        }
        let app = build_router(state);

        let resp = app
            .clone()
            .oneshot(Request::get("/api/v1/connections").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let all = body_json(resp).await;
        assert_eq!(all["data"].as_array().unwrap().len(), 3);
        assert_eq!(all["data"][0]["id"], "c1");

        let resp = app
            .clone()
            .oneshot(
                Request::get("/api/v1/connections?instance_id=inst-a")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let ids: Vec<String> = body_json(resp).await["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["c1", "c3"]);

        let resp = app
            .clone()
            .oneshot(Request::get("/api/v1/connections/c2").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["data"]["instanceId"], "inst-b");

        let resp = app
            .oneshot(Request::get("/api/v1/connections/c9").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_session_then_missing() {
        let state = state();
        let session = state
            .sessions
            .get_or_create_session(&SessionClaims::new("alice", None));
        let app = build_router(state.clone());

        let uri = format!("/api/v1/sessions/{}", session.id);
        let resp = app
            .clone()
            .oneshot(Request::delete(uri.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.sessions.get_session(&session.id).is_none());

        let resp = app
            .oneshot(Request::delete(uri.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_lists_instances() {
        let state = state();
        let inst = state.registry.create_instance(InstanceMetadata::new()).unwrap();
        let app = build_router(state);

        let resp = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains(&format!("switchyard_connections{{instance=\"{}\"}} 0", inst.id)));
    }
}
