#[tokio::main]
async fn main() {
    eyetrack_session::desktop::desktop_main().await
}
