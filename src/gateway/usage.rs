//! Token usage endpoints for the calling account.
//!
//! Callers check capacity with `/usage/check` before a billable call and
//! report the actual token counts to `/usage/llm` or `/usage/embedding`
//! afterwards. Recording never refuses on quota grounds.

use super::{parse_body, require_user, ApiError, ApiResult, AppState};
use crate::billing::{EmbeddingPurpose, EmbeddingUsageRecord, LlmUsageRecord, TokenCategory};
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

/// Default number of events returned by `/usage/events`.
const DEFAULT_EVENT_LIMIT: u32 = 50;

#[derive(Debug, Deserialize)]
pub struct CheckBody {
    pub category: TokenCategory,
    pub requested_tokens: u64,
}

#[derive(Debug, Deserialize)]
pub struct LlmUsageBody {
    pub request_id: Option<String>,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub conversation_id: Option<i64>,
    pub message_id: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingUsageBody {
    pub model: String,
    pub token_count: u32,
    pub purpose: EmbeddingPurpose,
    pub document_id: Option<i64>,
    pub chunk_id: Option<i64>,
    pub message_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<u32>,
}

/// GET /usage/me: limits, usage and totals since the last reset.
pub async fn handle_usage_me(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    let user = require_user(&state, &headers)?;
    let Some(quota) = state.ledger.quota_status(user.id)? else {
        return Err(ApiError::NotFound("User not found"));
    };
    let summary = state.ledger.summary(user.id, quota.last_token_reset_date)?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "quota": quota,
            "summary": summary,
        })),
    ))
}

/// POST /usage/check: advisory capacity check.
pub async fn handle_usage_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CheckBody>, JsonRejection>,
) -> ApiResult {
    let user = require_user(&state, &headers)?;
    let body = parse_body(body)?;

    let allowed = state
        .ledger
        .has_capacity(user.id, body.category, body.requested_tokens)?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "allowed": allowed,
            "category": body.category,
            "requested_tokens": body.requested_tokens,
        })),
    ))
}

/// POST /usage/llm: record a completed LLM call.
pub async fn handle_record_llm(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<LlmUsageBody>, JsonRejection>,
) -> ApiResult {
    let user = require_user(&state, &headers)?;
    let body = parse_body(body)?;

    let event = state.ledger.record_llm_usage(LlmUsageRecord {
        user_id: user.id,
        request_id: body
            .request_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        model: body.model,
        prompt_tokens: body.prompt_tokens,
        completion_tokens: body.completion_tokens,
        conversation_id: body.conversation_id,
        message_id: body.message_id,
        metadata: body.metadata,
    })?;
    Ok((StatusCode::CREATED, Json(json!(event))))
}

/// POST /usage/embedding: record a completed embedding call.
pub async fn handle_record_embedding(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<EmbeddingUsageBody>, JsonRejection>,
) -> ApiResult {
    let user = require_user(&state, &headers)?;
    let body = parse_body(body)?;

    let event = state.ledger.record_embedding_usage(EmbeddingUsageRecord {
        user_id: user.id,
        model: body.model,
        token_count: body.token_count,
        purpose: body.purpose,
        document_id: body.document_id,
        chunk_id: body.chunk_id,
        message_id: body.message_id,
    })?;
    Ok((StatusCode::CREATED, Json(json!(event))))
}

/// GET /usage/events: newest events for the caller.
pub async fn handle_usage_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> ApiResult {
    let user = require_user(&state, &headers)?;
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);

    let llm = state.ledger.recent_llm_events(user.id, limit)?;
    let embedding = state.ledger.recent_embedding_events(user.id, limit)?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "llm": llm,
            "embedding": embedding,
        })),
    ))
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::auth::UserUpdate;
    use axum::response::IntoResponse;

    fn llm_body(prompt_tokens: u32, completion_tokens: u32) -> LlmUsageBody {
        LlmUsageBody {
            request_id: None,
            model: "gpt-3.5-turbo".into(),
            prompt_tokens,
            completion_tokens,
            conversation_id: Some(7),
            message_id: None,
            metadata: Some(json!({ "temperature": 0.2 })),
        }
    }

    #[tokio::test]
    async fn usage_requires_token() {
        let state = test_state();
        let response = handle_usage_me(State(state), HeaderMap::new())
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn record_llm_usage_prices_and_charges() {
        let state = test_state();
        let (_, headers) = login(&state, "ada@example.com", false);

        let response = handle_record_llm(
            State(state.clone()),
            headers.clone(),
            Ok(Json(llm_body(1000, 500))),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        let event = body_json(response).await;
        assert_eq!(event["total_tokens"], 1500);
        assert!((event["cost"].as_f64().unwrap() - 0.0025).abs() < 1e-9);
        assert!(!event["request_id"].as_str().unwrap().is_empty());

        let response = handle_usage_me(State(state), headers).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["quota"]["llm"]["used"], 1500);
        assert_eq!(json["quota"]["embedding"]["used"], 0);
        assert_eq!(json["summary"]["llm_requests"], 1);
    }

    #[tokio::test]
    async fn record_embedding_usage() {
        let state = test_state();
        let (_, headers) = login(&state, "ada@example.com", false);

        let response = handle_record_embedding(
            State(state.clone()),
            headers.clone(),
            Ok(Json(EmbeddingUsageBody {
                model: "some-new-embedder".into(),
                token_count: 2000,
                purpose: EmbeddingPurpose::DocumentIndexing,
                document_id: Some(3),
                chunk_id: Some(12),
                message_id: None,
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        let event = body_json(response).await;
        assert_eq!(event["purpose"], "document_indexing");
        assert!((event["cost"].as_f64().unwrap() - 0.0002).abs() < 1e-9);

        let response = handle_usage_events(
            State(state),
            headers,
            Query(EventsQuery { limit: Some(10) }),
        )
        .await
        .into_response();
        let json = body_json(response).await;
        assert_eq!(json["embedding"].as_array().unwrap().len(), 1);
        assert!(json["llm"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn check_honours_limit_boundary() {
        let state = test_state();
        let (ada, headers) = login(&state, "ada@example.com", false);
        state
            .accounts
            .update_user(
                ada.id,
                UserUpdate {
                    monthly_llm_token_limit: Some(2000),
                    ..Default::default()
                },
            )
            .unwrap();

        let (status, _) = handle_record_llm(
            State(state.clone()),
            headers.clone(),
            Ok(Json(llm_body(1000, 500))),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let check = |requested_tokens| {
            handle_usage_check(
                State(state.clone()),
                headers.clone(),
                Ok(Json(CheckBody {
                    category: TokenCategory::Llm,
                    requested_tokens,
                })),
            )
        };

        let json = body_json(check(500).await.into_response()).await;
        assert_eq!(json["allowed"], true);

        let json = body_json(check(501).await.into_response()).await;
        assert_eq!(json["allowed"], false);
    }
}
