//! REST endpoint paths and API base derivation
//!
//! Matching is by substring on the request path, so `/api/Auth/login` and
//! `/Auth/login?next=x` both count as the login endpoint.

/// Refresh endpoint, relative to the API base. Authenticated by cookie.
pub const REFRESH_PATH: &str = "/Auth/refresh";

/// Endpoints that must never carry an `Authorization` header. Some backends
/// reject authenticated calls to public endpoints.
pub const PUBLIC_PATHS: &[&str] = &[
    "/Auth/login",
    "/Auth/register",
    REFRESH_PATH,
    "/Auth/login-google",
    "/Auth/verify-otp",
    "/Auth/resend-otp",
    "/Auth/forgot-password",
    "/Auth/reset-password",
];

/// Endpoints whose 401 is reported as-is instead of triggering a refresh.
/// Logout is authenticated but a 401 there means the session is already gone.
pub const AUTH_FAMILY_PATHS: &[&str] = &[
    "/Auth/login",
    "/Auth/register",
    REFRESH_PATH,
    "/Auth/forgot-password",
    "/Auth/reset-password",
    "/Auth/logout",
    "/Auth/login-google",
    "/Auth/verify-otp",
    "/Auth/resend-otp",
];

/// Whether `path` is on the unauthenticated allow-list.
pub fn is_public(path: &str) -> bool {
    PUBLIC_PATHS.iter().any(|p| path.contains(p))
}

/// Whether a 401 on `path` must skip the refresh-and-retry path.
pub fn is_auth_family(path: &str) -> bool {
    AUTH_FAMILY_PATHS.iter().any(|p| path.contains(p))
}

/// Derive the REST base from a configured host URL.
///
/// Trailing slashes are trimmed and `/api` is appended unless already present.
/// An empty host yields the relative `/api`.
pub fn api_base(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/api".to_string()
    } else if trimmed.ends_with("/api") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/api")
    }
}
