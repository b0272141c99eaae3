use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::error::TrackerError;
use crate::service::protocol::{ControlReply, ControlRequest};

const CONNECT_RETRY: Duration = Duration::from_millis(100);

fn codec_error(err: LinesCodecError) -> TrackerError {
    match err {
        LinesCodecError::Io(err) => TrackerError::Io(err),
        LinesCodecError::MaxLineLengthExceeded => {
            TrackerError::Process("service line too long".to_string())
        }
    }
}

/// Keeps dialling `address` until it answers or `timeout` has passed.
pub async fn connect_with_retry(address: &str, timeout: Duration) -> Result<TcpStream, TrackerError> {
    let deadline = Instant::now() + timeout;
    loop {
        match TcpStream::connect(address).await {
            Ok(stream) => {
                log::debug!("Connected to {address}");
                return Ok(stream);
            }
            Err(err) if Instant::now() < deadline => {
                log::trace!("{address} not up yet: {err}");
                tokio::time::sleep(CONNECT_RETRY).await;
            }
            Err(err) => {
                return Err(TrackerError::Process(format!(
                    "could not reach {address} within {timeout:?}: {err}"
                )));
            }
        }
    }
}

/// Request/reply channel. Requests are serialised, each waits for its reply.
pub struct ControlChannel {
    lines: Mutex<Framed<TcpStream, LinesCodec>>,
    reply_timeout: Duration,
}

impl ControlChannel {
    pub async fn connect(
        address: &str,
        connect_timeout: Duration,
        reply_timeout: Duration,
    ) -> Result<Self, TrackerError> {
        let stream = connect_with_retry(address, connect_timeout).await?;
        Ok(Self {
            lines: Mutex::new(Framed::new(stream, LinesCodec::new())),
            reply_timeout,
        })
    }

    pub async fn request(&self, request: &ControlRequest) -> Result<ControlReply, TrackerError> {
        let line = serde_json::to_string(request)
            .map_err(|e| TrackerError::Process(format!("unencodable request: {e}")))?;

        let mut lines = self.lines.lock().await;
        lines.send(line).await.map_err(codec_error)?;

        let reply = match tokio::time::timeout(self.reply_timeout, lines.next()).await {
            Ok(Some(Ok(reply))) => reply,
            Ok(Some(Err(err))) => return Err(codec_error(err)),
            Ok(None) => {
                return Err(TrackerError::Process(
                    "control channel closed by the service".to_string(),
                ));
            }
            Err(_) => {
                return Err(TrackerError::Process(format!(
                    "no reply to {} within {:?}",
                    request.subject(),
                    self.reply_timeout
                )));
            }
        };
        drop(lines);

        let reply: ControlReply = serde_json::from_str(&reply).map_err(|e| {
            TrackerError::Process(format!("bad reply to {}: {e}", request.subject()))
        })?;
        log::debug!("{} -> ok={} {}", request.subject(), reply.ok, reply.message);
        Ok(reply)
    }

    /// Like [`ControlChannel::request`] but a refusal is an error.
    pub async fn command(&self, request: &ControlRequest) -> Result<(), TrackerError> {
        let reply = self.request(request).await?;
        if !reply.ok {
            return Err(TrackerError::Process(format!(
                "{} refused: {}",
                request.subject(),
                reply.message
            )));
        }
        Ok(())
    }
}

/// Subscription to the service's data stream.
pub struct DataChannel {
    lines: Framed<TcpStream, LinesCodec>,
}

impl DataChannel {
    pub async fn subscribe(
        address: &str,
        connect_timeout: Duration,
        topics: &[&str],
    ) -> Result<Self, TrackerError> {
        let stream = connect_with_retry(address, connect_timeout).await?;
        let mut lines = Framed::new(stream, LinesCodec::new());
        lines
            .send(serde_json::json!({ "subscribe": topics }).to_string())
            .await
            .map_err(codec_error)?;
        log::info!("Subscribed to {topics:?} on {address}");
        Ok(Self { lines })
    }

    /// `Ok(None)` when nothing arrived within `timeout`.
    pub async fn next_line(&mut self, timeout: Duration) -> Result<Option<String>, TrackerError> {
        match tokio::time::timeout(timeout, self.lines.next()).await {
            Err(_) => Ok(None),
            Ok(Some(Ok(line))) => Ok(Some(line)),
            Ok(Some(Err(err))) => Err(codec_error(err)),
            Ok(None) => Err(TrackerError::Process(
                "data channel closed by the service".to_string(),
            )),
        }
    }
}
