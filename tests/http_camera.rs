mod common;

use std::time::Duration;

use eyetrack_session::config::TrackerConfig;
use eyetrack_session::{EyeTracker, InProcessTracker, TrackerError, TrackerStatus};
use image::codecs::jpeg::JpegEncoder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use common::disk_frame;

fn jpeg(size: (u32, u32)) -> Vec<u8> {
    let pixels = disk_frame(size, (size.0 as f32 / 2.0, size.1 as f32 / 2.0), size.1 as f32 / 4.0);
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, 90)
        .encode_image(&pixels)
        .unwrap();
    buf
}

/// Serves `parts` in order as an MJPEG stream, then repeats the last one.
async fn serve_mjpeg(parts: Vec<Vec<u8>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/stream", listener.local_addr().unwrap());

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let parts = parts.clone();
            tokio::spawn(async move {
                let mut request = [0u8; 1024];
                if socket.read(&mut request).await.is_err() {
                    return;
                }
                let header = "HTTP/1.1 200 OK\r\n\
                    Content-Type: multipart/x-mixed-replace; boundary=frame\r\n\
                    Connection: close\r\n\r\n";
                if socket.write_all(header.as_bytes()).await.is_err() {
                    return;
                }
                let last = parts.len() - 1;
                for i in 0.. {
                    let body = &parts[i.min(last)];
                    let head = format!(
                        "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                        body.len()
                    );
                    let written = async {
                        socket.write_all(head.as_bytes()).await?;
                        socket.write_all(body).await?;
                        socket.write_all(b"\r\n").await
                    };
                    if written.await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            });
        }
    });
    url
}

fn http_config(url: String, resolution: (u32, u32), dir: &std::path::Path) -> TrackerConfig {
    TrackerConfig {
        camera: url,
        resolution,
        output_dir: dir.to_path_buf(),
        ..TrackerConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_smaller_than_configured_fails_start() {
    let dir = tempfile::tempdir().unwrap();
    let url = serve_mjpeg(vec![jpeg((32, 24))]).await;
    let tracker = InProcessTracker::from_config(http_config(url, (64, 48), dir.path())).unwrap();

    assert!(matches!(tracker.start().await, Err(TrackerError::Device(_))));
    assert_eq!(tracker.status(), TrackerStatus::Idle);
    assert_eq!(tracker.latest_sample(), None);
    tracker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn matching_stream_delivers_samples() {
    let dir = tempfile::tempdir().unwrap();
    let url = serve_mjpeg(vec![jpeg((64, 48))]).await;
    let tracker = InProcessTracker::from_config(http_config(url, (64, 48), dir.path())).unwrap();

    tracker.start().await.unwrap();
    assert!(common::wait_for(|| tracker.latest_sample().is_some(), Duration::from_secs(5)).await);
    assert_eq!(tracker.status(), TrackerStatus::Running);
    tracker.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resolution_change_mid_stream_fails_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let url = serve_mjpeg(vec![jpeg((64, 48)), jpeg((64, 48)), jpeg((32, 24))]).await;
    let tracker = InProcessTracker::from_config(http_config(url, (64, 48), dir.path())).unwrap();

    tracker.start().await.unwrap();
    assert!(
        common::wait_for(
            || matches!(tracker.status(), TrackerStatus::Failed(_)),
            Duration::from_secs(5)
        )
        .await
    );
    tracker.stop().await.unwrap();
}
