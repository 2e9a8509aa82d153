//! Local directory serving for origin-form requests

use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{Filter, FilterAction, MockResponse, Session};
use crate::http::{path_and_query, unquote_plus, Request};

/// Content type for a file name, by extension
#[must_use]
pub fn guess_content_type(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "crt" | "pem" => "application/x-x509-ca-cert",
        "html" | "htm" => "text/html",
        "txt" => "text/plain",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "gif" => "image/gif",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "bmp" => "image/bmp",
        "ico" => "image/x-icon",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "zip" => "application/zip",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Serve files under `root` for requests whose target was a bare path,
/// i.e. requests addressed to the proxy itself
#[derive(Debug)]
pub struct StaticFileFilter {
    root: PathBuf,
}

impl StaticFileFilter {
    /// Serve from `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// File system path for a request path, refusing traversal
    fn resolve(&self, url_path: &str) -> Option<PathBuf> {
        let relative = unquote_plus(url_path.trim_start_matches('/'));
        let relative = Path::new(&relative);
        if relative.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
            return None;
        }
        Some(self.root.join(relative))
    }

    async fn listing(dir: &Path, url_path: &str) -> std::io::Result<MockResponse> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_dir() {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();

        let base = if url_path.ends_with('/') {
            url_path.to_string()
        } else {
            format!("{url_path}/")
        };
        let mut html = format!(
            "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Index of {base}</title></head><body><h1>Index of {base}</h1><ul>"
        );
        for name in names {
            let _ = write!(html, "<li><a href=\"{base}{}\">{name}</a></li>", urlencoding::encode(&name).replace("%2F", "/"));
        }
        html.push_str("</ul></body></html>");

        Ok(MockResponse::new(200)
            .header("Content-Type", "text/html; charset=utf-8")
            .header("Content-Length", html.len().to_string())
            .header("Connection", "close")
            .body(html))
    }
}

#[async_trait]
impl Filter for StaticFileFilter {
    fn name(&self) -> &'static str {
        "static_file"
    }

    async fn filter(&self, req: &mut Request, _session: &mut Session) -> Option<FilterAction> {
        if !req.origin_form {
            return None;
        }
        let (url_path, _) = path_and_query(&req.path);
        let target = self.resolve(url_path)?;
        let meta = tokio::fs::metadata(&target).await.ok()?;

        let response = if meta.is_dir() {
            let index = target.join("index.html");
            if tokio::fs::metadata(&index).await.is_ok_and(|m| m.is_file()) {
                let body = tokio::fs::read(&index).await.ok()?;
                MockResponse::new(200)
                    .header("Content-Type", "text/html")
                    .header("Content-Length", body.len().to_string())
                    .header("Connection", "close")
                    .body(body)
            } else {
                Self::listing(&target, url_path).await.ok()?
            }
        } else {
            let body = tokio::fs::read(&target).await.ok()?;
            let name = target.to_string_lossy();
            MockResponse::new(200)
                .header("Content-Type", guess_content_type(&name))
                .header("Content-Length", body.len().to_string())
                .header("Connection", "close")
                .body(body)
        };
        debug!(path = %target.display(), status = response.status, "static file");
        Some(FilterAction::Mock(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::testing::{request, session};
    use crate::http::Scheme;

    fn local(target: &str) -> Request {
        crate::filter::testing::request_with_scheme("GET", target, &[("Host", "127.0.0.1:8087")], Scheme::Http)
    }

    #[test]
    fn test_guess_content_type() {
        assert_eq!(guess_content_type("CA.crt"), "application/x-x509-ca-cert");
        assert_eq!(guess_content_type("a/b.PNG"), "image/png");
        assert_eq!(guess_content_type("noext"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_serves_file_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("CA.crt"), b"-----BEGIN CERTIFICATE-----").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let f = StaticFileFilter::new(dir.path());

        let mut req = local("/CA.crt");
        let Some(FilterAction::Mock(resp)) = f.filter(&mut req, &mut session()).await else {
            panic!("expected file");
        };
        assert_eq!(resp.headers.get("Content-Type"), Some("application/x-x509-ca-cert"));
        assert_eq!(resp.headers.get("Connection"), Some("close"));

        let mut root = local("/");
        let Some(FilterAction::Mock(resp)) = f.filter(&mut root, &mut session()).await else {
            panic!("expected listing");
        };
        let html = String::from_utf8_lossy(&resp.body);
        assert!(html.contains("CA.crt"));
        assert!(html.contains("sub/"));
        assert_eq!(resp.headers.get("Content-Type"), Some("text/html; charset=utf-8"));
    }

    #[tokio::test]
    async fn test_index_html_preferred() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), b"<p>home</p>").unwrap();
        let f = StaticFileFilter::new(dir.path());
        let mut req = local("/");
        let Some(FilterAction::Mock(resp)) = f.filter(&mut req, &mut session()).await else {
            panic!("expected index");
        };
        assert_eq!(&resp.body[..], b"<p>home</p>");
    }

    #[tokio::test]
    async fn test_traversal_and_missing_fall_through() {
        let dir = tempfile::tempdir().unwrap();
        let f = StaticFileFilter::new(dir.path());
        let mut up = local("/../etc/passwd");
        assert!(f.filter(&mut up, &mut session()).await.is_none());
        let mut encoded = local("/%2e%2e/secret");
        assert!(f.filter(&mut encoded, &mut session()).await.is_none());
        let mut missing = local("/nope.txt");
        assert!(f.filter(&mut missing, &mut session()).await.is_none());
        let mut connect = request("CONNECT", "example.com:443", &[]);
        assert!(f.filter(&mut connect, &mut session()).await.is_none());

        std::fs::write(dir.path().join("page.txt"), b"x").unwrap();
        let mut proxied = request("GET", "http://example.com/page.txt", &[]);
        assert!(f.filter(&mut proxied, &mut session()).await.is_none());
    }
}
