//! Static assets compiled into the binary.
//!
//! Everything under `assets/static/` is embedded with `rust-embed`. At
//! startup each file is gzipped once; files that gzip does not shrink by at
//! least 10% are marked not worth compressing and always go out raw.

use std::collections::HashMap;
use std::io::{self, Write};
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use flate2::Compression;
use flate2::write::GzEncoder;
use rust_embed::RustEmbed;
use tracing::debug;

use crate::streamer::timed_bytes;

#[derive(RustEmbed)]
#[folder = "$CARGO_MANIFEST_DIR/assets/static/"]
struct StaticFiles;

pub const CACHE_FOREVER: &str = "public, max-age=31536000, immutable";

/// Template the page handler renders.
pub const PAGE_TEMPLATE: &str = "page.html";

#[derive(Debug, Clone)]
pub struct Asset {
    pub content_type: String,
    pub raw: Bytes,
    /// `None` when the asset is not worth compressing.
    pub gzipped: Option<Bytes>,
}

/// Immutable set of static assets, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct AssetBundle {
    assets: HashMap<String, Asset>,
}

fn content_type_for(name: &str) -> String {
    match name {
        "favicon.ico" => "image/x-icon".to_string(),
        "compile.css" => "text/css".to_string(),
        "_script.js" => "application/javascript".to_string(),
        "_script.js.map" => "application/json".to_string(),
        _ => mime_guess::from_path(name)
            .first_or_octet_stream()
            .to_string(),
    }
}

fn gzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Gzip has to save at least a tenth of the size to be worth it.
fn worth_compressing(raw_len: usize, gzipped_len: usize) -> bool {
    gzipped_len * 10 <= raw_len * 9
}

impl AssetBundle {
    /// Bundle every embedded file.
    pub fn embedded() -> io::Result<Self> {
        let files = StaticFiles::iter().filter_map(|name| {
            StaticFiles::get(&name).map(|file| (name.to_string(), file.data.into_owned()))
        });
        Self::from_files(files)
    }

    pub fn from_files(files: impl IntoIterator<Item = (String, Vec<u8>)>) -> io::Result<Self> {
        let mut assets = HashMap::new();
        for (name, data) in files {
            let compressed = gzip(&data)?;
            let gzipped = worth_compressing(data.len(), compressed.len()).then(|| Bytes::from(compressed));
            debug!(
                asset = %name,
                bytes = data.len(),
                gzip = gzipped.is_some(),
                "bundled static asset"
            );
            assets.insert(
                name.clone(),
                Asset {
                    content_type: content_type_for(&name),
                    raw: Bytes::from(data),
                    gzipped,
                },
            );
        }
        Ok(Self { assets })
    }

    pub fn get(&self, name: &str) -> Option<&Asset> {
        self.assets.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|asset| std::str::from_utf8(&asset.raw).ok())
    }
}

/// Whether the client listed gzip in `Accept-Encoding` (and did not
/// refuse it with `q=0`).
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|item| {
            let mut parts = item.split(';').map(str::trim);
            let coding = parts.next().unwrap_or_default();
            let refused = parts.any(|p| p.replace(' ', "") == "q=0" || p.replace(' ', "") == "q=0.0");
            (coding.eq_ignore_ascii_case("gzip") || coding == "*") && !refused
        })
}

/// Serve `name` from the bundle through the write-timeout streamer.
pub fn serve_asset(
    bundle: &AssetBundle,
    name: &str,
    request_headers: &HeaderMap,
    write_timeout: Duration,
) -> Response {
    let Some(asset) = bundle.get(name) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let gzipped = asset
        .gzipped
        .as_ref()
        .filter(|_| accepts_gzip(request_headers));
    let body = gzipped.unwrap_or(&asset.raw).clone();

    let mut response = Response::new(timed_bytes(body.clone(), write_timeout, name.to_string()));
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&asset.content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_FOREVER));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    if gzipped.is_some() {
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }
    if asset.gzipped.is_some() {
        headers.insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use http_body_util::BodyExt;
    use std::io::Read;

    fn bundle() -> AssetBundle {
        // A repetitive stylesheet compresses well; a short pseudo-random
        // blob does not.
        let css = "body { margin: 0; }\n".repeat(200).into_bytes();
        let mut noise = Vec::with_capacity(512);
        let mut x: u32 = 0x1234_5678;
        for _ in 0..512 {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            noise.push((x & 0xff) as u8);
        }
        AssetBundle::from_files([
            ("compile.css".to_string(), css),
            ("favicon.ico".to_string(), noise),
        ])
        .unwrap()
    }

    fn gzip_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_embedded_bundle_has_routes_assets() {
        let bundle = AssetBundle::embedded().unwrap();
        for name in ["favicon.ico", "compile.css", "_script.js", "_script.js.map", PAGE_TEMPLATE] {
            assert!(bundle.get(name).is_some(), "missing {}", name);
        }
        assert_eq!(bundle.get("favicon.ico").unwrap().content_type, "image/x-icon");
        assert_eq!(bundle.get("compile.css").unwrap().content_type, "text/css");
        assert_eq!(
            bundle.get("_script.js").unwrap().content_type,
            "application/javascript"
        );
        assert_eq!(
            bundle.get("_script.js.map").unwrap().content_type,
            "application/json"
        );
        assert!(bundle.text(PAGE_TEMPLATE).unwrap().contains("{{path}}"));
    }

    #[test]
    fn test_worth_compressing_threshold() {
        assert!(worth_compressing(100, 90));
        assert!(!worth_compressing(100, 91));
        assert!(!worth_compressing(100, 120));
    }

    #[test]
    fn test_accepts_gzip() {
        assert!(accepts_gzip(&gzip_headers("gzip, deflate, br")));
        assert!(accepts_gzip(&gzip_headers("br;q=1.0, GZIP;q=0.5")));
        assert!(accepts_gzip(&gzip_headers("*")));
        assert!(!accepts_gzip(&gzip_headers("deflate, br")));
        assert!(!accepts_gzip(&gzip_headers("gzip;q=0")));
        assert!(!accepts_gzip(&HeaderMap::new()));
    }

    #[tokio::test]
    async fn test_gzip_served_when_accepted() {
        let bundle = bundle();
        let resp = serve_asset(&bundle, "compile.css", &gzip_headers("gzip"), Duration::from_secs(2));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_ENCODING], "gzip");
        assert_eq!(resp.headers()[header::CACHE_CONTROL], CACHE_FOREVER);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/css");

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let mut plain = String::new();
        GzDecoder::new(&body[..]).read_to_string(&mut plain).unwrap();
        assert!(plain.starts_with("body { margin: 0; }"));
    }

    #[tokio::test]
    async fn test_raw_served_without_accept_encoding() {
        let bundle = bundle();
        let resp = serve_asset(&bundle, "compile.css", &HeaderMap::new(), Duration::from_secs(2));
        assert!(resp.headers().get(header::CONTENT_ENCODING).is_none());
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.len(), bundle.get("compile.css").unwrap().raw.len());
    }

    #[tokio::test]
    async fn test_incompressible_asset_served_raw_even_if_accepted() {
        let bundle = bundle();
        assert!(bundle.get("favicon.ico").unwrap().gzipped.is_none());
        let resp = serve_asset(&bundle, "favicon.ico", &gzip_headers("gzip"), Duration::from_secs(2));
        assert!(resp.headers().get(header::CONTENT_ENCODING).is_none());
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/x-icon");
        assert_eq!(resp.headers()[header::CACHE_CONTROL], CACHE_FOREVER);
    }

    #[test]
    fn test_missing_asset_is_not_found() {
        let resp = serve_asset(&bundle(), "nope.js", &HeaderMap::new(), Duration::from_secs(2));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
