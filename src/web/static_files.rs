use axum::{
    body::Body,
    http::{header, Response, StatusCode},
    response::IntoResponse,
};
use rust_embed::Embed;

/// Browser bootstrap page and negotiation script
#[derive(Embed)]
#[folder = "web/static"]
pub struct StaticAssets;

/// Serve index.html for root path
pub async fn index_handler() -> Response<Body> {
    serve_file("index.html")
}

pub async fn client_js_handler() -> Response<Body> {
    serve_file("client.js")
}

fn serve_file(path: &str) -> Response<Body> {
    let Some(asset) = StaticAssets::get(path) else {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };

    let mime = mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string();

    (
        [
            (header::CONTENT_TYPE, mime),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        asset.data.into_owned(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_assets_are_embedded() {
        let index = index_handler().await;
        assert_eq!(index.status(), StatusCode::OK);
        assert!(index.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/html"));

        let script = client_js_handler().await;
        assert_eq!(script.status(), StatusCode::OK);
        assert!(script.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .contains("javascript"));
    }

    #[test]
    fn test_missing_asset() {
        assert_eq!(serve_file("nope.txt").status(), StatusCode::NOT_FOUND);
    }
}
