//! Canned responses

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::info;

use crate::filter::{MockResponse, Session};
use crate::http::{write_response_head, Request};

/// Writes a [`MockResponse`] to the client
#[derive(Debug, Default, Clone, Copy)]
pub struct MockPlugin;

impl MockPlugin {
    /// Send `resp` for `req`
    ///
    /// Header names are title-cased, `Transfer-Encoding` is dropped and
    /// `Content-Length`/`Connection` are defaulted. Returns whether the
    /// client connection may stay open.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub async fn respond<W>(&self, client: &mut W, req: &Request, session: &Session, resp: &MockResponse) -> std::io::Result<bool>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        info!(
            "{} \"MOCK {} {} HTTP/1.{}\" {} {}",
            session.client,
            req.method,
            req.path,
            req.version,
            resp.status,
            resp.body.len()
        );

        let mut headers = resp.headers.title_cased();
        headers.remove("Transfer-Encoding");
        headers.set_default("Content-Length", resp.body.len().to_string());
        headers.set_default("Connection", "close");
        let keep_alive = req.keep_alive() && !headers.has_token("Connection", "close");

        let mut out = write_response_head(resp.status, &headers);
        if !req.method.eq_ignore_ascii_case("HEAD") {
            out.extend_from_slice(&resp.body);
        }
        client.write_all(&out).await?;
        client.flush().await?;
        Ok(keep_alive)
    }
}
