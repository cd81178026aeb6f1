use std::sync::Arc;

use anyhow::Result;
use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower::ServiceExt; // for `oneshot`

use gatekeeper::app::AuthzState;
use gatekeeper::authz::{
    require_permissions, Authorize, CurrentActor, EvalContext, RequirePermissions,
    StrategyRegistry,
};
use gatekeeper::config::AuthzConfig;
use gatekeeper::errors::AppError;

/// Stand-in for the routing layer's authentication: reads the actor from `x-actor`.
async fn authenticate(mut request: axum::extract::Request, next: Next) -> Response {
    let actor = request
        .headers()
        .get("x-actor")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok());
    if let Some(actor) = actor {
        request.extensions_mut().insert(CurrentActor::new(actor));
    }
    next.run(request).await
}

async fn create_post(Authorize(auth): Authorize) -> Result<Json<Value>, AppError> {
    let perms = auth.get_permissions(None, None).await?;
    Ok(Json(json!({"created": true, "permission_count": perms.len()})))
}

async fn approve_post(Authorize(auth): Authorize) -> Result<Json<Value>, AppError> {
    let post = json!({"created_by_id": "author", "status": "pending"});
    let ctx = EvalContext::new().with_condition("not_creator", true);
    auth.require("posts:approve", Some(&post), &ctx).await?;
    Ok(Json(json!({"approved": true})))
}

async fn ok() -> &'static str {
    "ok"
}

fn app() -> Result<Router> {
    let state = AuthzState::new(
        AuthzConfig::default(),
        Arc::new(StrategyRegistry::with_builtins()),
    )?;

    let guarded = |rule: RequirePermissions| {
        middleware::from_fn_with_state((state.clone(), rule), require_permissions)
    };

    let router = Router::new()
        .route(
            "/posts",
            post(create_post).route_layer(guarded(RequirePermissions::all(["posts:create"]))),
        )
        .route(
            "/posts/approve",
            post(approve_post).route_layer(guarded(RequirePermissions::all(["posts:approve"]))),
        )
        .route(
            "/posts/1",
            delete(ok).route_layer(guarded(RequirePermissions::any(["posts:delete", "moderation:*"]))),
        )
        .route("/admin", get(ok).route_layer(guarded(RequirePermissions::admin())))
        .with_state(state)
        .layer(middleware::from_fn(authenticate));
    Ok(router)
}

async fn send(method: &str, uri: &str, actor: Option<Value>) -> Result<(StatusCode, Value)> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(actor) = actor {
        builder = builder.header("x-actor", actor.to_string());
    }
    let response = app()?.oneshot(builder.body(Body::empty())?).await?;
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1_048_576).await?;
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    Ok((status, body))
}

#[tokio::test]
async fn missing_actor_is_unauthorized() -> Result<()> {
    let (status, body) = send("POST", "/posts", None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");
    Ok(())
}

#[tokio::test]
async fn required_permission_gates_the_handler() -> Result<()> {
    let writer = json!({"id": "u1", "permissions": ["posts:create"]});
    let (status, body) = send("POST", "/posts", Some(writer)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["created"], true);

    let reader = json!({"id": "u2"});
    let (status, body) = send("POST", "/posts", Some(reader)).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "Permission required: posts:create");
    Ok(())
}

#[tokio::test]
async fn any_of_accepts_a_wildcard_grant() -> Result<()> {
    let moderator = json!({"id": "m1", "permissions": ["moderation:*"]});
    let (status, _) = send("DELETE", "/posts/1", Some(moderator)).await?;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send("DELETE", "/posts/1", Some(json!({"id": "u3"}))).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["message"]
        .as_str()
        .unwrap_or_default()
        .starts_with("One of these permissions required"));
    Ok(())
}

#[tokio::test]
async fn admin_route_requires_admin_flag() -> Result<()> {
    let (status, _) = send("GET", "/admin", Some(json!({"id": "root", "is_admin": true}))).await?;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send("GET", "/admin", Some(json!({"id": "u1"}))).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "Admin access required");
    Ok(())
}

#[tokio::test]
async fn handler_level_conditions_become_forbidden_responses() -> Result<()> {
    let author = json!({"id": "author", "permissions": ["posts:approve"]});
    let (status, body) = send("POST", "/posts/approve", Some(author)).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["message"]
        .as_str()
        .unwrap_or_default()
        .contains("segregation of duties"));

    let reviewer = json!({"id": "reviewer", "permissions": ["posts:approve"]});
    let (status, body) = send("POST", "/posts/approve", Some(reviewer)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["approved"], true);
    Ok(())
}
