//! Account management endpoints.
//!
//! Listing, creation, deletion and counter resets are admin-only. Reading
//! and updating an account is allowed for the account itself or an admin;
//! non-admins cannot touch their own flags or limits.

use super::{blocking, parse_body, require_admin, require_user, ApiError, ApiResult, AppState};
use crate::auth::{NewUser, UserUpdate};
use crate::auth::store::DEFAULT_PAGE_LIMIT;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Default, Deserialize)]
pub struct ListUsersQuery {
    pub skip: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserBody {
    pub email: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_admin: bool,
}

fn default_true() -> bool {
    true
}

/// GET /users: page through accounts (admin).
pub async fn handle_list_users(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListUsersQuery>,
) -> ApiResult {
    require_admin(&state, &headers)?;
    let users = state.accounts.list_users(
        query.skip.unwrap_or(0),
        query.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
    )?;
    Ok((StatusCode::OK, Json(json!(users))))
}

/// POST /users: create an account with explicit flags (admin).
pub async fn handle_create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CreateUserBody>, JsonRejection>,
) -> ApiResult {
    let admin = require_admin(&state, &headers)?;
    let body = parse_body(body)?;

    let accounts = state.accounts.clone();
    let user = blocking(move || {
        accounts
            .create_user(NewUser {
                email: body.email,
                password: body.password,
                is_active: body.is_active,
                is_admin: body.is_admin,
            })
            .map_err(ApiError::from)
    })
    .await?;

    tracing::info!(admin_id = admin.id, user_id = user.id, "Account created by admin");
    Ok((StatusCode::CREATED, Json(json!(user))))
}

/// GET /users/{id}: read one account (self or admin).
pub async fn handle_get_user(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    headers: HeaderMap,
) -> ApiResult {
    let caller = require_user(&state, &headers)?;
    if caller.id != user_id && !caller.is_admin {
        return Err(ApiError::Forbidden("Not enough permissions"));
    }

    let user = state
        .accounts
        .get_user(user_id)?
        .ok_or(ApiError::NotFound("User not found"))?;
    Ok((StatusCode::OK, Json(json!(user))))
}

/// PUT /users/{id}: partial update (self or admin).
pub async fn handle_update_user(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    headers: HeaderMap,
    body: Result<Json<UserUpdate>, JsonRejection>,
) -> ApiResult {
    let caller = require_user(&state, &headers)?;
    if caller.id != user_id && !caller.is_admin {
        return Err(ApiError::Forbidden("Not enough permissions"));
    }
    let update = parse_body(body)?;
    if !caller.is_admin && update.touches_privileged_fields() {
        return Err(ApiError::Forbidden(
            "Only administrators can change account flags or limits",
        ));
    }

    let accounts = state.accounts.clone();
    let user = blocking(move || accounts.update_user(user_id, update).map_err(ApiError::from))
        .await?
        .ok_or(ApiError::NotFound("User not found"))?;
    Ok((StatusCode::OK, Json(json!(user))))
}

/// DELETE /users/{id}: remove an account (admin, not self).
pub async fn handle_delete_user(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    headers: HeaderMap,
) -> ApiResult {
    let admin = require_admin(&state, &headers)?;
    if admin.id == user_id {
        return Err(ApiError::BadRequest("Administrators cannot delete themselves".into()));
    }
    if !state.accounts.delete_user(user_id)? {
        return Err(ApiError::NotFound("User not found"));
    }

    tracing::info!(admin_id = admin.id, user_id, "Account deleted by admin");
    Ok((
        StatusCode::OK,
        Json(json!({ "status": "deleted", "user_id": user_id })),
    ))
}

/// POST /users/{id}/usage/reset: zero monthly counters (admin).
pub async fn handle_reset_usage(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    headers: HeaderMap,
) -> ApiResult {
    let admin = require_admin(&state, &headers)?;
    if !state.ledger.reset_usage(user_id)? {
        return Err(ApiError::NotFound("User not found"));
    }

    tracing::info!(admin_id = admin.id, user_id, "Usage counters reset by admin");
    let status = state
        .ledger
        .quota_status(user_id)?
        .ok_or(ApiError::NotFound("User not found"))?;
    Ok((StatusCode::OK, Json(json!(status))))
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::billing::LlmUsageRecord;
    use axum::response::IntoResponse;

    #[tokio::test]
    async fn list_requires_admin() {
        let state = test_state();
        let (_, user_headers) = login(&state, "ada@example.com", false);
        let (_, admin_headers) = login(&state, "root@example.com", true);

        let response = handle_list_users(
            State(state.clone()),
            user_headers,
            Query(ListUsersQuery::default()),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = handle_list_users(
            State(state),
            admin_headers,
            Query(ListUsersQuery {
                skip: Some(1),
                limit: Some(10),
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["email"], "root@example.com");
    }

    #[tokio::test]
    async fn admin_creates_admin() {
        let state = test_state();
        let (_, admin_headers) = login(&state, "root@example.com", true);

        let response = handle_create_user(
            State(state.clone()),
            admin_headers.clone(),
            Ok(Json(CreateUserBody {
                email: "ops@example.com".into(),
                password: PASSWORD.into(),
                is_active: true,
                is_admin: true,
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_json(response).await["is_admin"], true);

        let response = handle_create_user(
            State(state),
            admin_headers,
            Ok(Json(CreateUserBody {
                email: "ops@example.com".into(),
                password: PASSWORD.into(),
                is_active: true,
                is_admin: false,
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_is_self_or_admin() {
        let state = test_state();
        let (ada, ada_headers) = login(&state, "ada@example.com", false);
        let (bob, _) = login(&state, "bob@example.com", false);
        let (_, admin_headers) = login(&state, "root@example.com", true);

        let response = handle_get_user(State(state.clone()), Path(ada.id), ada_headers.clone())
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let response = handle_get_user(State(state.clone()), Path(bob.id), ada_headers)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = handle_get_user(State(state.clone()), Path(bob.id), admin_headers.clone())
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let response = handle_get_user(State(state), Path(9_999), admin_headers)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn user_cannot_raise_own_limits() {
        let state = test_state();
        let (ada, headers) = login(&state, "ada@example.com", false);

        let response = handle_update_user(
            State(state.clone()),
            Path(ada.id),
            headers.clone(),
            Ok(Json(UserUpdate {
                monthly_llm_token_limit: Some(10_000_000),
                ..Default::default()
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = handle_update_user(
            State(state.clone()),
            Path(ada.id),
            headers,
            Ok(Json(UserUpdate {
                email: Some("ada.l@example.com".into()),
                ..Default::default()
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["email"], "ada.l@example.com");
    }

    #[tokio::test]
    async fn admin_updates_limits() {
        let state = test_state();
        let (ada, _) = login(&state, "ada@example.com", false);
        let (_, admin_headers) = login(&state, "root@example.com", true);

        let response = handle_update_user(
            State(state),
            Path(ada.id),
            admin_headers,
            Ok(Json(UserUpdate {
                monthly_embedding_token_limit: Some(500),
                is_active: Some(false),
                ..Default::default()
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["monthly_embedding_token_limit"], 500);
        assert_eq!(json["is_active"], false);
    }

    #[tokio::test]
    async fn delete_rules() {
        let state = test_state();
        let (ada, ada_headers) = login(&state, "ada@example.com", false);
        let (root, admin_headers) = login(&state, "root@example.com", true);

        let response = handle_delete_user(State(state.clone()), Path(ada.id), ada_headers)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = handle_delete_user(State(state.clone()), Path(root.id), admin_headers.clone())
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = handle_delete_user(State(state.clone()), Path(ada.id), admin_headers.clone())
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let response = handle_delete_user(State(state), Path(ada.id), admin_headers)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn admin_resets_usage() {
        let state = test_state();
        let (ada, _) = login(&state, "ada@example.com", false);
        let (_, admin_headers) = login(&state, "root@example.com", true);

        state
            .ledger
            .record_llm_usage(LlmUsageRecord {
                user_id: ada.id,
                request_id: "req-1".into(),
                model: "gpt-4".into(),
                prompt_tokens: 100,
                completion_tokens: 50,
                ..Default::default()
            })
            .unwrap();

        let response = handle_reset_usage(State(state), Path(ada.id), admin_headers)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["llm"]["used"], 0);
        assert_eq!(json["llm"]["remaining"], 100_000);
    }
}
