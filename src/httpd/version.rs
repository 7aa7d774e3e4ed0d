use axum::Json;

pub fn versions() -> shim_json::Versions {
    shim_json::Versions {
        shim_httpd_git: git_version::git_version!(fallback = "unknown").to_string(),
        shim_httpd_version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

pub async fn get_version() -> Json<shim_json::Versions> {
    Json(versions())
}
