//! OpenAPI/Utoipa configuration.

use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};

use crate::api::{health::MISC_TAG, token::TOKEN_TAG};

/// Registers the HTTP Basic scheme used by the Docker token flow.
pub struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);

        let basic = HttpBuilder::new()
            .scheme(HttpAuthScheme::Basic)
            .description(Some(
                "Registry credentials. Omit them to request a token for the anonymous subject.",
            ))
            .build();
        components.add_security_scheme("basic", SecurityScheme::Http(basic));
    }
}

/// OpenAPI documentation configuration.
#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    info(
        title = "Registry Auth API",
        version = "1.0.0",
        description = "Token authentication server for Docker/OCI registries."
    ),
    tags(
        (name = TOKEN_TAG, description = "Token issuance endpoints"),
        (name = MISC_TAG, description = "Miscellaneous endpoints")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documents_basic_scheme() {
        let doc = ApiDoc::openapi();
        let components = doc.components.expect("components");
        assert!(components.security_schemes.contains_key("basic"));
    }
}
