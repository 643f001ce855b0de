//! Log in, search, and download the first hit to a local file.
//!
//! Usage: `cargo run --example basic -- <username> <password> <query>`

use std::time::Duration;

use anyhow::{bail, Context};
use slsk_client::{ClientConfig, DownloadEvent, SlskClient};
use tokio::io::AsyncWriteExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(username), Some(password), Some(query)) = (args.next(), args.next(), args.next())
    else {
        bail!("usage: basic <username> <password> <query>");
    };

    let client = SlskClient::connect(ClientConfig::default()).await?;
    client.login(&username, &password).await?;

    let replies = client
        .search_within(&query, Duration::from_secs(5))
        .await?;
    let reply = replies
        .iter()
        .find(|r| r.slots_free)
        .or_else(|| replies.first())
        .context("no search results")?;
    let file = reply.files.first().context("reply carried no files")?;
    println!(
        "downloading {} ({} bytes) from {}",
        file.filename, file.size, reply.username
    );

    let mut download = client.download(&reply.username, &file.filename).await?;

    let mut events = download.events;
    let progress = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                DownloadEvent::Status(state) => println!("status: {}", state.status()),
                DownloadEvent::Progress { received, total } => println!("{received}/{total}"),
                DownloadEvent::Complete { received } => println!("done, {received} bytes"),
                DownloadEvent::Failed { reason } => {
                    println!("download failed: {reason}");
                    return Err(reason);
                }
            }
        }
        Ok(())
    });

    // The remote path uses backslashes; keep only the basename.
    let basename = file
        .filename
        .rsplit('\\')
        .next()
        .unwrap_or(&file.filename);
    let mut out = tokio::fs::File::create(basename).await?;
    while let Some(chunk) = download.data.recv().await {
        out.write_all(&chunk).await?;
    }
    out.flush().await?;

    if let Err(reason) = progress.await? {
        bail!("download failed: {reason}");
    }
    client.close().await;
    Ok(())
}
