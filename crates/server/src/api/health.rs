//! Liveness endpoint.

/// Tag for OpenAPI documentation.
pub const MISC_TAG: &str = "Miscellaneous";

/// Liveness endpoint.
#[utoipa::path(
    method(get, head),
    path = "/healthz",
    tag = MISC_TAG,
    operation_id = "Health Check",
    summary = "Liveness check",
    description = "Returns `ok` once the configuration has been loaded and the listener is accepting \
                   requests. It does not exercise the configured components.",
    responses(
        (status = 200, description = "Server is running", body = str, content_type = "text/plain", example = "ok")
    )
)]
pub async fn health() -> &'static str {
    "ok"
}
