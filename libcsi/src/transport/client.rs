//! Client used by an orchestrator (or tests) to issue CSI requests.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, instrument};

use super::{Endpoint, Envelope, frame_codec};
use crate::error::CsiError;
use crate::message::CsiMessage;

/// Extra time granted on top of a request deadline for the server's
/// `DeadlineExceeded` answer to arrive.
const DEADLINE_GRACE: Duration = Duration::from_secs(1);

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// A CSI client holding one connection.  Requests are sent one at a time.
pub struct CsiClient {
    framed: Framed<Box<dyn Io>, LengthDelimitedCodec>,
    next_id: u64,
}

impl CsiClient {
    /// Connect to a server at `endpoint`.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, CsiError> {
        let io: Box<dyn Io> = match endpoint {
            Endpoint::Unix(path) => Box::new(
                UnixStream::connect(path)
                    .await
                    .map_err(CsiError::transport)?,
            ),
            Endpoint::Tcp(addr) => Box::new(
                TcpStream::connect(addr.as_str())
                    .await
                    .map_err(CsiError::transport)?,
            ),
        };
        debug!(%endpoint, "CSI connection established");
        Ok(Self {
            framed: Framed::new(io, frame_codec()),
            next_id: 1,
        })
    }

    /// Send a request and wait for the corresponding response.
    ///
    /// A failed RPC comes back as `Ok(CsiMessage::Error(_))`; `Err` is
    /// reserved for transport failures.  Use
    /// [`CsiMessage::into_result`] to fold the two.
    pub async fn request(&mut self, msg: CsiMessage) -> Result<CsiMessage, CsiError> {
        self.call(msg, None).await
    }

    /// Like [`request`](Self::request), but the server abandons the call
    /// with `DeadlineExceeded` once `timeout` elapses.
    pub async fn request_with_timeout(
        &mut self,
        msg: CsiMessage,
        timeout: Duration,
    ) -> Result<CsiMessage, CsiError> {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        tokio::time::timeout(timeout + DEADLINE_GRACE, self.call(msg, Some(millis)))
            .await
            .map_err(|_| CsiError::DeadlineExceeded(format!("no response within {timeout:?}")))?
    }

    #[instrument(skip(self), fields(msg = %msg))]
    async fn call(&mut self, msg: CsiMessage, timeout_ms: Option<u64>) -> Result<CsiMessage, CsiError> {
        let id = self.next_id;
        self.next_id += 1;

        let mut request = Envelope::new(id, msg);
        request.timeout_ms = timeout_ms;
        self.framed
            .send(request.encode()?)
            .await
            .map_err(CsiError::transport)?;

        loop {
            let frame = self
                .framed
                .next()
                .await
                .ok_or_else(|| CsiError::TransportError("connection closed by server".into()))?
                .map_err(CsiError::transport)?;
            let response = Envelope::decode(&frame)?;
            // Late answers to calls abandoned by a local timeout.
            if response.id != id {
                debug!(expected = id, got = response.id, "skipping stale response");
                continue;
            }
            debug!(response = %response.message, "CSI response received");
            return Ok(response.message);
        }
    }
}
