//! Request handler.
//!
//! - `GET`: responds with `hello {User-Agent}\n`
//! - anything else: echoes the request body back
//!
//! Each body chunk of a non-GET request is logged with its length.

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::body::{BodyError, BodyReader};
use crate::config::EchoPolicy;
use crate::gzip;
use crate::protocol::{Method, RequestHead, Response, StatusCode};

/// Rendered in the greeting when the request has no `User-Agent` header
pub const MISSING_USER_AGENT: &str = "undefined";

/// Greeting body for a GET request. The user agent is copied byte for byte.
pub fn greeting(user_agent: Option<&[u8]>) -> Bytes {
    let user_agent = user_agent.unwrap_or(MISSING_USER_AGENT.as_bytes());
    let mut body = BytesMut::with_capacity(user_agent.len() + 7);
    body.extend_from_slice(b"hello ");
    body.extend_from_slice(user_agent);
    body.extend_from_slice(b"\n");
    body.freeze()
}

/// Turns one request into one response.
#[derive(Debug, Clone, Copy)]
pub struct Handler {
    policy: EchoPolicy,
    max_body_size: usize,
}

impl Handler {
    pub fn new(policy: EchoPolicy, max_body_size: usize) -> Self {
        Handler {
            policy,
            max_body_size,
        }
    }

    /// Build the response, consuming the whole request body.
    ///
    /// The body is always read to its end so the next request on the
    /// connection starts at a clean boundary.
    pub async fn respond<S>(
        &self,
        head: &RequestHead,
        body: &mut BodyReader<'_, S>,
    ) -> Result<Response, BodyError>
    where
        S: AsyncRead + Unpin,
    {
        if head.method == Method::Get {
            let discarded = body.drain().await?;
            if discarded > 0 {
                debug!(bytes = discarded, "Discarded GET request body");
            }
            return Ok(Response::ok(greeting(head.user_agent())));
        }

        let echoed = match self.policy {
            EchoPolicy::Full => {
                let mut collected = BytesMut::new();
                while let Some(chunk) = body.next_chunk().await? {
                    info!(bytes = chunk.len(), "Received body chunk");
                    collected.extend_from_slice(&chunk);
                }

                if head.is_gzip() && !collected.is_empty() {
                    match gzip::decompress(&collected, self.max_body_size) {
                        Ok(decoded) => {
                            debug!(
                                compressed = collected.len(),
                                decoded = decoded.len(),
                                "Decoded gzip body"
                            );
                            Bytes::from(decoded)
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to decode gzip body");
                            return Ok(Response::error(
                                StatusCode::BadRequest,
                                &format!("Invalid gzip body: {}", e),
                            ));
                        }
                    }
                } else {
                    collected.freeze()
                }
            }
            EchoPolicy::FirstChunk => {
                let mut first = None;
                while let Some(chunk) = body.next_chunk().await? {
                    info!(bytes = chunk.len(), "Received body chunk");
                    if first.is_none() {
                        first = Some(chunk);
                    }
                }
                first.unwrap_or_default()
            }
        };

        Ok(Response::ok(echoed))
    }
}
