//! axum integration: the routing layer resolves the actor and stores it as a
//! [`CurrentActor`] request extension; these guards and extractors read it from there.
//!
//! ```ignore
//! let rule = RequirePermissions::all(["posts:create"]);
//! let routes = Router::new()
//!     .route("/posts", post(create_post))
//!     .route_layer(middleware::from_fn_with_state((state.clone(), rule), require_permissions));
//! ```

use std::sync::Arc;

use axum::async_trait;
use axum::extract::{FromRef, FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;

use super::principal::{actor_id, flag, Attributes};
use super::service::AuthorizationService;
use crate::app::AuthzState;
use crate::errors::{AppError, AppResult};

/// The authenticated actor of the current request.
#[derive(Clone)]
pub struct CurrentActor(pub Arc<dyn Attributes>);

impl CurrentActor {
    pub fn new(actor: impl Attributes + 'static) -> Self {
        Self(Arc::new(actor))
    }
}

fn current_actor(extensions: &axum::http::Extensions) -> AppResult<CurrentActor> {
    extensions
        .get::<CurrentActor>()
        .cloned()
        .ok_or_else(|| AppError::unauthorized("Authentication required"))
}

#[async_trait]
impl<S> FromRequestParts<S> for CurrentActor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        current_actor(&parts.extensions)
    }
}

/// An [`AuthorizationService`] bound to the request's actor.
pub struct Authorize(pub AuthorizationService);

#[async_trait]
impl<S> FromRequestParts<S> for Authorize
where
    AuthzState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let actor = current_actor(&parts.extensions)?;
        let state = AuthzState::from_ref(state);
        Ok(Authorize(state.for_actor(actor.0)))
    }
}

/// Permissions a route demands. `all_of` must all be held, at least one of `any_of`,
/// and with `admin_only` the actor must carry the admin flag.
#[derive(Debug, Clone, Default)]
pub struct RequirePermissions {
    pub all_of: Vec<String>,
    pub any_of: Vec<String>,
    pub admin_only: bool,
}

impl RequirePermissions {
    pub fn all<I, S>(permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            all_of: permissions.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn any<I, S>(permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            any_of: permissions.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn admin() -> Self {
        Self {
            admin_only: true,
            ..Self::default()
        }
    }

    pub async fn check(&self, state: &AuthzState, actor: &dyn Attributes) -> AppResult<()> {
        if self.admin_only && !flag(actor, &state.config.admin_field) {
            return Err(AppError::forbidden("Admin access required"));
        }

        for permission in &self.all_of {
            if !state.policy_engine.has_permission(actor, permission, None).await? {
                tracing::debug!(actor_id = ?actor_id(actor), permission = %permission, "guard denied");
                return Err(AppError::forbidden(format!("Permission required: {permission}")));
            }
        }

        if !self.any_of.is_empty() {
            let mut granted = false;
            for permission in &self.any_of {
                if state.policy_engine.has_permission(actor, permission, None).await? {
                    granted = true;
                    break;
                }
            }
            if !granted {
                tracing::debug!(actor_id = ?actor_id(actor), any_of = ?self.any_of, "guard denied");
                return Err(AppError::forbidden(format!(
                    "One of these permissions required: {:?}",
                    self.any_of
                )));
            }
        }

        Ok(())
    }
}

/// Middleware for `axum::middleware::from_fn_with_state`.
pub async fn require_permissions(
    State((state, rule)): State<(AuthzState, RequirePermissions)>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let actor = current_actor(request.extensions())?;
    rule.check(&state, actor.0.as_ref()).await?;
    Ok(next.run(request).await)
}
