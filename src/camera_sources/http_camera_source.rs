use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::time::{Duration, SystemTime};

use hyper::http;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use crate::camera::{Frame, FrameSource, decode_jpeg};
use crate::error::TrackerError;

const HTTP_CONNECTION_TIMEOUT: Duration = Duration::from_secs(1);
/// A frame older than this counts as dropped.
const HTTP_FRAME_TIMEOUT: Duration = Duration::from_millis(500);
/// Time for the stream to deliver its first frame when opening.
const HTTP_FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// MJPEG camera served as `multipart/x-mixed-replace` over HTTP.
///
/// A tokio task keeps the connection alive and hands decoded frames over a
/// two-slot channel. Frames the acquisition thread is too slow to take are
/// discarded.
///
/// The resolution is the one the stream actually delivers, probed from the
/// first frame.
pub struct HttpCameraSource {
    url: String,
    resolution: (u32, u32),
    frames: Receiver<Frame>,
    first_frame: Option<Frame>,
    task: JoinHandle<()>,
}

impl HttpCameraSource {
    pub fn connect(url: String, resolution: (u32, u32)) -> Result<Self, TrackerError> {
        http::Uri::try_from(url.as_str())
            .map_err(|e| TrackerError::Device(format!("{url}: {e}")))?;
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| TrackerError::Device(format!("{url}: {e}")))?;

        let (tx, rx) = std::sync::mpsc::sync_channel(2);
        let task = handle.spawn(stream_frames(url.clone(), tx));

        // Blocks the acquisition thread, never a runtime worker.
        let first_frame = match rx.recv_timeout(HTTP_FIRST_FRAME_TIMEOUT) {
            Ok(frame) => frame,
            Err(err) => {
                task.abort();
                let reason = match err {
                    RecvTimeoutError::Timeout => format!(
                        "no frame within {} s",
                        HTTP_FIRST_FRAME_TIMEOUT.as_secs()
                    ),
                    RecvTimeoutError::Disconnected => "stream task ended".to_string(),
                };
                return Err(TrackerError::Device(format!("{url}: {reason}")));
            }
        };
        if first_frame.size() != resolution {
            task.abort();
            return Err(TrackerError::Device(format!(
                "{url} delivers {:?}, configured for {resolution:?}",
                first_frame.size()
            )));
        }

        Ok(Self {
            url,
            resolution,
            frames: rx,
            first_frame: Some(first_frame),
            task,
        })
    }
}

impl Drop for HttpCameraSource {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FrameSource for HttpCameraSource {
    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, TrackerError> {
        if let Some(frame) = self.first_frame.take() {
            return Ok(Some(frame));
        }
        match self.frames.recv_timeout(HTTP_FRAME_TIMEOUT) {
            Ok(frame) if frame.size() != self.resolution => Err(TrackerError::Device(format!(
                "{} switched from {:?} to {:?}",
                self.url,
                self.resolution,
                frame.size()
            ))),
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TrackerError::Device(format!(
                "{} stream task ended",
                self.url
            ))),
        }
    }
}

async fn stream_frames(url: String, tx: SyncSender<Frame>) {
    let mut reconnect = false;
    let mut index = 0u64;

    'connect_loop: loop {
        if reconnect {
            log::info!("Reconnecting in a sec to {url}");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        reconnect = true;

        let Ok(uri) = http::Uri::try_from(url.as_str()) else {
            return;
        };
        let client = hyper::Client::builder()
            .pool_idle_timeout(HTTP_CONNECTION_TIMEOUT)
            .build_http::<hyper::Body>();
        let res = match client.get(uri).await {
            Ok(res) => res,
            Err(err) => {
                log::warn!("{url}: {err:?}");
                continue 'connect_loop;
            }
        };

        if !res.status().is_success() {
            log::warn!("HTTP request failed with status {}", res.status());
            continue 'connect_loop;
        }
        let content_type: Option<mime::Mime> = res
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok());
        let boundary = match &content_type {
            Some(ct) if ct.type_() == mime::MULTIPART => ct.get_param(mime::BOUNDARY),
            _ => None,
        };
        let Some(boundary) = boundary else {
            log::error!("{url} is not a multipart stream: {content_type:?}");
            continue 'connect_loop;
        };

        let stream = res.into_body();
        let mut stream = multipart_stream::parse(stream, boundary.as_str());
        while let Some(p) = stream.next().await {
            let p = match p {
                Ok(p) => p,
                Err(err) => {
                    log::warn!("Camera stream error:\n{err:?}");
                    continue 'connect_loop;
                }
            };
            let timestamp = SystemTime::now();
            let buf = p.body;

            let Some(pixels) = decode_jpeg(&buf) else {
                continue;
            };

            let mut frame = Frame::new(pixels, timestamp, index);
            frame.raw_jpeg_data = Some(buf.to_vec());
            index += 1;

            match tx.try_send(frame) {
                Ok(()) | Err(TrySendError::Full(_)) => (),
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}
