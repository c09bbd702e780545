use crate::api::ErrorResponse;
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";

/// Caller identity forwarded by the gateway after it verified credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub id: i32,
    pub email: String,
}

impl Principal {
    fn from_headers(headers: &HeaderMap) -> Result<Self, &'static str> {
        let id = headers
            .get(USER_ID_HEADER)
            .ok_or("Missing user identity")?
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<i32>().ok())
            .filter(|id| *id > 0)
            .ok_or("Invalid user identity")?;

        let email = headers
            .get(USER_EMAIL_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or("Missing user email")?
            .to_string();

        Ok(Self { id, email })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_headers(&parts.headers).map_err(|reason| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new(reason, "UNAUTHORIZED")),
            )
        })
    }
}
