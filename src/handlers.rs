//! Axum handlers for the switcher API
use crate::backend::StateSnapshot;
use crate::errors::ApiError;
use crate::switcher::Switcher;
use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchResponse {
    pub status: String,
    pub active: String,
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

/// Every backend with its current status, and the active id
#[instrument(skip_all)]
pub async fn models(State(switcher): State<Switcher>) -> Json<StateSnapshot> {
    Json(switcher.list_state())
}

/// Switch to the requested backend and wait for the result.
///
/// The switch runs on its own task. If the client goes away the task's token
/// is cancelled, so the switch stops at its next step and records where it
/// got to instead of being dropped halfway through.
#[instrument(skip_all)]
pub async fn switch(
    State(switcher): State<Switcher>,
    Json(request): Json<SwitchRequest>,
) -> Result<Json<SwitchResponse>, ApiError> {
    info!(id = %request.id, "Received switch request");

    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let id = request.id.clone();
    let task = tokio::spawn(async move { switcher.switch(&id, &cancel).await });

    match task.await {
        Ok(Ok(())) => Ok(Json(SwitchResponse {
            status: "success".to_string(),
            active: request.id,
        })),
        Ok(Err(e)) => {
            error!(id = %request.id, error = %e, "Switch failed");
            Err(e.into())
        }
        Err(e) => {
            error!(error = %e, "Switch task panicked");
            Err(ApiError::Internal(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::BackendStatus;
    use crate::build_router;
    use crate::client::{ClientError, Operation};
    use crate::switcher::testing::{ep, fixture};
    use axum_test::TestServer;
    use serde_json::{Value, json};

    #[tokio::test]
    async fn test_health() {
        let (switcher, _) = fixture(64.0);
        let server = TestServer::new(build_router(switcher)).unwrap();

        let response = server.get("/health").await;

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.json::<Value>(), json!({"status": "healthy"}));
    }

    #[tokio::test]
    async fn test_models_lists_backends_in_order() {
        let (switcher, _) = fixture(64.0);
        let server = TestServer::new(build_router(switcher)).unwrap();

        let response = server.get("/models").await;

        assert_eq!(response.status_code(), 200);
        let body: Value = response.json();
        assert_eq!(body["active"], "a");
        let ids: Vec<&str> = body["backends"]
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        assert_eq!(body["backends"][2]["status"], "disabled");
        assert_eq!(body["backends"][0]["name"], "Model A");
    }

    #[tokio::test]
    async fn test_switch_success() {
        let (switcher, _) = fixture(64.0);
        let server = TestServer::new(build_router(switcher.clone())).unwrap();

        let response = server.post("/switch").json(&json!({"id": "b"})).await;

        assert_eq!(response.status_code(), 200);
        assert_eq!(
            response.json::<Value>(),
            json!({"status": "success", "active": "b"})
        );
        assert_eq!(switcher.list_state().active.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_switch_unknown_and_disabled_are_404() {
        let (switcher, _) = fixture(64.0);
        let server = TestServer::new(build_router(switcher)).unwrap();

        let response = server.post("/switch").json(&json!({"id": "nope"})).await;
        assert_eq!(response.status_code(), 404);
        assert_eq!(
            response.json::<Value>(),
            json!({"error": "backend not found: nope"})
        );

        let response = server.post("/switch").json(&json!({"id": "c"})).await;
        assert_eq!(response.status_code(), 404);
    }

    #[tokio::test]
    async fn test_switch_failure_is_500_with_cause() {
        let (switcher, client) = fixture(64.0);
        client.on_wake_up(|ep| Err(ClientError::transport(Operation::WakeUp, ep, "refused")));
        let server = TestServer::new(build_router(switcher.clone())).unwrap();

        let response = server.post("/switch").json(&json!({"id": "b"})).await;

        assert_eq!(response.status_code(), 500);
        let error = response.json::<Value>()["error"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(error.contains("failed to activate target backend b"));
        assert!(error.contains(&ep("b").to_string()));
        assert_eq!(
            switcher.registry().get("b").unwrap().status,
            BackendStatus::Error
        );
    }

    #[tokio::test]
    async fn test_switch_rejects_malformed_body() {
        let (switcher, client) = fixture(64.0);
        let server = TestServer::new(build_router(switcher)).unwrap();

        let response = server
            .post("/switch")
            .json(&json!({"model": "b"}))
            .expect_failure()
            .await;

        assert!(response.status_code().is_client_error());
        assert!(client.calls().is_empty());
    }
}
