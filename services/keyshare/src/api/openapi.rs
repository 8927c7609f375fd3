use super::handlers::{console, health};
use utoipa::openapi::{InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    // Reuse the same router wiring and only return the generated spec.
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Build the router that also drives the `OpenAPI` document.
///
/// Add new endpoints here via `.routes(routes!(...))` so they are both
/// served and documented.
pub(crate) fn api_router() -> OpenApiRouter {
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(console::login::login_irma))
        .routes(routes!(console::login::login_email))
        .routes(routes!(console::login::login_token_candidates))
        .routes(routes!(console::login::login_token))
        .routes(routes!(console::login::verify_email))
        .routes(routes!(console::session::logout))
        .routes(routes!(console::session::check_session))
        .routes(routes!(console::user::user_info))
        .routes(routes!(console::user::user_logs))
        .routes(routes!(console::user::delete_user))
        .routes(routes!(console::email::add_email))
        .routes(routes!(console::email::remove_email));

    let mut console_tag = Tag::new("console");
    console_tag.description = Some("Self-service account console".to_string());
    let mut health_tag = Tag::new("health");
    health_tag.description = Some("Service health".to_string());
    router.get_openapi_mut().tags = Some(vec![console_tag, health_tag]);

    router
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    // Spec metadata comes from Cargo.toml instead of the crate defaults.
    let info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();
    let mut openapi = OpenApiBuilder::new().info(info).build();
    openapi.info.license = cargo_license();
    openapi
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &'static str) -> Option<&'static str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_info_from_cargo() {
        let spec = openapi();
        assert_eq!(spec.info.title, env!("CARGO_PKG_NAME"));
        assert_eq!(spec.info.version, env!("CARGO_PKG_VERSION"));
        let license = spec.info.license;
        assert!(license.is_some());
        if let Some(license) = license {
            assert_eq!(license.name, "BSD-3-Clause");
        }
    }

    #[test]
    fn openapi_covers_the_console_surface() {
        let spec = openapi();
        for path in [
            "/login/irma",
            "/login/email",
            "/login/token/candidates",
            "/login/token",
            "/logout",
            "/verify",
            "/checksession",
            "/user",
            "/user/logs/{offset}",
            "/user/delete",
            "/email/add",
            "/email/remove",
            "/health",
        ] {
            assert!(
                spec.paths.paths.contains_key(path),
                "missing path {path} in OpenAPI spec"
            );
        }
    }
}
