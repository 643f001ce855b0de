//! Resume a partial download: append to an existing local file, asking the
//! peer to start at the bytes we already have.
//!
//! Usage: `cargo run --example resume -- <username> <password> <peer> <remote-path> <local-path>`

use anyhow::bail;
use slsk_client::{ClientConfig, DownloadEvent, SlskClient};
use tokio::io::AsyncWriteExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(username), Some(password), Some(peer), Some(remote_path), Some(local_path)) = (
        args.next(),
        args.next(),
        args.next(),
        args.next(),
        args.next(),
    ) else {
        bail!("usage: resume <username> <password> <peer> <remote-path> <local-path>");
    };

    let offset = match tokio::fs::metadata(&local_path).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };
    println!("resuming {remote_path} from byte {offset}");

    let client = SlskClient::connect(ClientConfig::default()).await?;
    client.login(&username, &password).await?;

    let mut download = client.download_from(&peer, &remote_path, offset).await?;

    let mut out = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&local_path)
        .await?;
    loop {
        tokio::select! {
            chunk = download.data.recv() => match chunk {
                Some(chunk) => out.write_all(&chunk).await?,
                None => break,
            },
            Some(DownloadEvent::Failed { reason }) = download.events.recv() => {
                bail!("download failed: {reason}");
            }
        }
    }
    out.flush().await?;
    println!("{local_path} is complete");
    client.close().await;
    Ok(())
}
