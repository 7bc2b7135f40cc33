//! CSI server that runs on each node and dispatches incoming requests to the
//! appropriate trait implementations.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, instrument, warn};

use super::{Endpoint, Envelope, Inbound, frame_codec};
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;

/// Responses queued per connection before request tasks wait on the writer.
const RESPONSE_QUEUE: usize = 64;

/// Back-off after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

enum Listener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

/// A CSI server that accepts stream connections and dispatches
/// [`CsiMessage`] requests to an [`CsiIdentity`] + [`CsiController`] +
/// [`CsiNode`] implementation.
pub struct CsiServer<T> {
    listener: Listener,
    handler: Arc<T>,
}

impl<T> CsiServer<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    /// Bind to `endpoint`.  A leftover socket file at a `unix://` path is
    /// removed first.
    pub async fn bind(endpoint: &Endpoint, handler: Arc<T>) -> Result<Self, CsiError> {
        let listener = match endpoint {
            Endpoint::Unix(path) => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(CsiError::transport)?;
                }
                match tokio::fs::remove_file(path).await {
                    Ok(()) => debug!(path = %path.display(), "removed stale socket"),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(CsiError::TransportError(format!(
                            "remove stale socket {}: {e}",
                            path.display()
                        )));
                    }
                }
                let listener = UnixListener::bind(path).map_err(CsiError::transport)?;
                Listener::Unix {
                    listener,
                    path: path.clone(),
                }
            }
            Endpoint::Tcp(addr) => Listener::Tcp(
                TcpListener::bind(addr.as_str())
                    .await
                    .map_err(CsiError::transport)?,
            ),
        };

        let server = Self { listener, handler };
        info!(endpoint = %server.local_endpoint()?, "CSI server listening");
        Ok(server)
    }

    /// The address actually bound, with the real port for `tcp://host:0`.
    pub fn local_endpoint(&self) -> Result<Endpoint, CsiError> {
        match &self.listener {
            Listener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
            Listener::Tcp(listener) => listener
                .local_addr()
                .map(|addr| Endpoint::Tcp(addr.to_string()))
                .map_err(CsiError::transport),
        }
    }

    /// Accept connections until the process exits.
    pub async fn serve(self) -> Result<(), CsiError> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Each accepted connection is handled on its own task, and each request
    /// within a connection is dispatched concurrently.  Connections already
    /// accepted keep running after shutdown until their peer hangs up.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<(), CsiError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("CSI server shutting down");
                    break;
                }
                accepted = self.accept() => {
                    if let Err(e) = accepted {
                        warn!(error = %e, "CSI accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }

        if let Listener::Unix { path, .. } = &self.listener
            && let Err(e) = tokio::fs::remove_file(path).await
        {
            debug!(path = %path.display(), error = %e, "socket file not removed");
        }
        Ok(())
    }

    async fn accept(&self) -> std::io::Result<()> {
        match &self.listener {
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                self.spawn_connection(stream, "unix".to_owned());
            }
            Listener::Tcp(listener) => {
                let (stream, remote) = listener.accept().await?;
                self.spawn_connection(stream, remote.to_string());
            }
        }
        Ok(())
    }

    fn spawn_connection<S>(&self, stream: S, remote: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            debug!(%remote, "CSI connection accepted");
            match Self::handle_connection(stream, handler).await {
                Ok(()) => debug!(%remote, "CSI connection closed"),
                Err(e) => warn!(%remote, error = %e, "CSI connection error"),
            }
        });
    }

    /// Read request frames until the peer hangs up, spawning one task per
    /// request.  Responses go through a single writer task.
    async fn handle_connection<S>(stream: S, handler: Arc<T>) -> Result<(), CsiError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, mut frames) = Framed::new(stream, frame_codec()).split();
        let (tx, rx) = mpsc::channel(RESPONSE_QUEUE);
        let writer = tokio::spawn(write_responses(sink, rx));

        let outcome = loop {
            let frame = match frames.next().await {
                None => break Ok(()),
                Some(Ok(frame)) => frame,
                Some(Err(e)) => break Err(CsiError::transport(e)),
            };
            // Without a readable id there is nobody to answer.
            let request = match Envelope::decode_request(&frame) {
                Ok(Inbound::Request(request)) => request,
                Ok(Inbound::Rejected(reply)) => {
                    warn!(id = reply.id, "rejecting malformed request");
                    if tx.send(reply).await.is_err() {
                        break Ok(());
                    }
                    continue;
                }
                Err(e) => break Err(e),
            };

            let handler = Arc::clone(&handler);
            let tx = tx.clone();
            tokio::spawn(async move {
                let response = Self::respond(&handler, request).await;
                // Fails only if the connection is gone.
                let _ = tx.send(response).await;
            });
        };

        drop(tx);
        if let Err(e) = writer.await {
            warn!(error = %e, "CSI response writer panicked");
        }
        outcome
    }

    /// Dispatch one request, bounded by its deadline if it carries one.
    #[instrument(skip_all, fields(id = request.id, method = %request.message))]
    async fn respond(handler: &T, request: Envelope) -> Envelope {
        let Envelope {
            id,
            timeout_ms,
            message,
        } = request;

        let response = if !message.is_request() {
            warn!("unexpected message variant received as request");
            CsiMessage::Error(CsiError::InvalidArgument(format!(
                "unexpected message: {message}"
            )))
        } else if let Some(ms) = timeout_ms {
            let method = message.to_string();
            tokio::time::timeout(Duration::from_millis(ms), Self::dispatch(handler, message))
                .await
                .unwrap_or_else(|_| {
                    CsiMessage::Error(CsiError::DeadlineExceeded(format!(
                        "{method} did not finish within {ms}ms"
                    )))
                })
        } else {
            Self::dispatch(handler, message).await
        };

        match &response {
            CsiMessage::Error(e) => error!(code = %e.code(), error = %e, "CSI call failed"),
            ok => debug!(response = %ok, "CSI call finished"),
        }
        Envelope::new(id, response)
    }

    /// Map a [`CsiMessage`] request to the correct trait method call and
    /// wrap the result in a response [`CsiMessage`].
    async fn dispatch(handler: &T, request: CsiMessage) -> CsiMessage {
        use CsiMessage as M;

        match request {
            // --- Identity ---------------------------------------------------
            M::GetPluginInfo => reply(handler.get_plugin_info().await, M::PluginInfo),
            M::GetPluginCapabilities => {
                reply(handler.get_plugin_capabilities().await, M::PluginCapabilities)
            }
            M::Probe => reply(handler.probe().await, |ready| M::ProbeResult { ready }),

            // --- Controller -------------------------------------------------
            M::CreateVolume(req) => reply(handler.create_volume(req).await, M::VolumeCreated),
            M::DeleteVolume { volume_id } => {
                reply(handler.delete_volume(&volume_id).await, |()| M::Ok)
            }
            M::ControllerPublishVolume(req) => {
                reply(handler.controller_publish_volume(req).await, |()| M::Ok)
            }
            M::ControllerUnpublishVolume { volume_id, node_id } => reply(
                handler
                    .controller_unpublish_volume(&volume_id, &node_id)
                    .await,
                |()| M::Ok,
            ),
            M::ValidateVolumeCapabilities {
                volume_id,
                volume_capabilities,
            } => reply(
                handler
                    .validate_volume_capabilities(&volume_id, &volume_capabilities)
                    .await,
                M::Validation,
            ),
            M::ListVolumes(req) => reply(handler.list_volumes(req).await, M::VolumeList),
            M::GetCapacity => reply(handler.get_capacity().await, |available_capacity| {
                M::Capacity { available_capacity }
            }),
            M::ControllerGetCapabilities => reply(
                handler.controller_get_capabilities().await,
                M::ControllerCapabilities,
            ),
            M::ControllerExpandVolume {
                volume_id,
                capacity_range,
            } => reply(
                handler
                    .controller_expand_volume(&volume_id, capacity_range)
                    .await,
                M::ControllerExpanded,
            ),
            M::ControllerGetVolume { volume_id } => reply(
                handler.controller_get_volume(&volume_id).await,
                M::VolumeDescription,
            ),
            M::CreateSnapshot {
                source_volume_id,
                name,
            } => reply(
                handler.create_snapshot(&source_volume_id, &name).await,
                |()| M::Ok,
            ),
            M::DeleteSnapshot { snapshot_id } => {
                reply(handler.delete_snapshot(&snapshot_id).await, |()| M::Ok)
            }
            M::ListSnapshots => reply(handler.list_snapshots().await, |()| M::Ok),

            // --- Node -------------------------------------------------------
            M::NodeStageVolume(req) => reply(handler.stage_volume(req).await, |()| M::Ok),
            M::NodeUnstageVolume {
                volume_id,
                staging_target_path,
            } => reply(
                handler
                    .unstage_volume(&volume_id, &staging_target_path)
                    .await,
                |()| M::Ok,
            ),
            M::NodePublishVolume(req) => reply(handler.publish_volume(req).await, |()| M::Ok),
            M::NodeUnpublishVolume {
                volume_id,
                target_path,
            } => reply(
                handler.unpublish_volume(&volume_id, &target_path).await,
                |()| M::Ok,
            ),
            M::NodeGetVolumeStats {
                volume_id,
                volume_path,
            } => reply(
                handler.get_volume_stats(&volume_id, &volume_path).await,
                M::VolumeStats,
            ),
            M::NodeExpandVolume(req) => reply(handler.expand_volume(req).await, |capacity_bytes| {
                M::NodeExpanded { capacity_bytes }
            }),
            M::NodeGetCapabilities => reply(handler.get_capabilities().await, M::NodeCapabilities),
            M::NodeGetInfo => reply(handler.get_info().await, M::NodeInfo),

            // --- Filtered out by `respond` ----------------------------------
            other => CsiMessage::Error(CsiError::InvalidArgument(format!(
                "unexpected message: {other}"
            ))),
        }
    }
}

fn reply<V>(result: Result<V, CsiError>, wrap: impl FnOnce(V) -> CsiMessage) -> CsiMessage {
    result.map_or_else(CsiMessage::Error, wrap)
}

/// Drain `rx` into the connection until every request task is done or the
/// peer goes away.
async fn write_responses<S>(
    mut sink: SplitSink<Framed<S, LengthDelimitedCodec>, Bytes>,
    mut rx: mpsc::Receiver<Envelope>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let frame = match response.encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!(id = response.id, error = %e, "failed to encode response");
                match Envelope::new(response.id, CsiMessage::Error(e)).encode() {
                    Ok(frame) => frame,
                    Err(_) => continue,
                }
            }
        };
        if let Err(e) = sink.send(frame).await {
            debug!(error = %e, "peer went away before the response was written");
            break;
        }
    }
}
