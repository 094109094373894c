use warp::{Filter, Rejection};

use crate::routes::ApiError;

pub const TOKEN_HEADER: &str = "x-auth-token";

/// The presented credential: `X-Auth-Token` first, then `Authorization: Bearer`.
fn presented(header: Option<String>, authorization: Option<String>) -> Option<String> {
  header.filter(|t| !t.is_empty()).or_else(|| {
    authorization
      .as_deref()
      .and_then(|v| v.strip_prefix("Bearer "))
      .filter(|t| !t.is_empty())
      .map(str::to_string)
  })
}

/// Rejects with [`ApiError::Unauthorized`] unless the request carries
/// `token`. With no token configured every request passes.
pub fn with_auth(token: Option<String>) -> impl Filter<Extract = (), Error = Rejection> + Clone {
  warp::header::optional::<String>(TOKEN_HEADER)
    .and(warp::header::optional::<String>("authorization"))
    .and_then(move |header: Option<String>, authorization: Option<String>| {
      let token = token.clone();
      async move {
        match token {
          None => Ok(()),
          Some(expected) if presented(header, authorization).as_deref() == Some(expected.as_str()) => Ok(()),
          Some(_) => Err(warp::reject::custom(ApiError::Unauthorized)),
        }
      }
    })
    .untuple_one()
}
