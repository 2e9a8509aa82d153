//! Answer every request locally

use async_trait::async_trait;
use bytes::Bytes;

use super::{Filter, FilterAction, MockResponse, Session};
use crate::http::{path_and_query, Request};

/// 1x1 transparent GIF
pub const BLANK_GIF: &[u8] = b"GIF89a\x01\x00\x01\x00\x80\xff\x00\xc0\xc0\xc0\x00\x00\x00!\xf9\x04\x01\x00\x00\x00\x00,\x00\x00\x00\x00\x01\x00\x01\x00\x00\x02\x02D\x01\x00;";

const IMAGE_EXTENSIONS: [&str; 5] = [".jpg", ".gif", ".png", ".jpeg", ".bmp"];

/// Swallow requests: tunnels are stripped, proxied URLs get an empty
/// cacheable answer (a blank GIF for images) and the rest a 404
#[derive(Debug, Default)]
pub struct BlackholeFilter;

#[async_trait]
impl Filter for BlackholeFilter {
    fn name(&self) -> &'static str {
        "blackhole"
    }

    async fn filter(&self, req: &mut Request, _session: &mut Session) -> Option<FilterAction> {
        if req.is_connect() {
            return Some(FilterAction::Strip);
        }
        if !(req.path.starts_with("http://") || req.path.starts_with("https://")) {
            return Some(FilterAction::Mock(
                MockResponse::new(404)
                    .header("Content-Length", "0")
                    .header("Connection", "close"),
            ));
        }

        let mut resp = MockResponse::new(200)
            .header("Cache-Control", "max-age=86400")
            .header("Expires", "Oct, 01 Aug 2100 00:00:00 GMT")
            .header("Connection", "close");
        let (path, _) = path_and_query(&req.path);
        let path = path.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
            resp = resp
                .header("Content-Type", "image/gif")
                .body(Bytes::from_static(BLANK_GIF));
        }
        Some(FilterAction::Mock(resp))
    }
}
