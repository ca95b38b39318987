//! Contract for authorization modules gating requests.
//!
//! The core never implements a module; it only calls one. `request_access` is
//! awaited before every gated request and again once after a 401, and the
//! fields returned by `authorization_fields` are merged into the request
//! headers at build time, fresh for every attempt.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::BoxError;
use crate::params::Parameters;

#[async_trait]
pub trait AuthzModule: Send + Sync {
    /// Ensure valid credentials are available. An error aborts the pending
    /// request before anything is sent.
    async fn request_access(&self) -> Result<(), BoxError>;

    /// Fields to merge into the next request. `url` and `parameters` are
    /// those of the request being built, for schemes that sign them.
    fn authorization_fields(
        &self,
        url: &str,
        parameters: Option<&Parameters>,
    ) -> Option<HashMap<String, String>>;
}
