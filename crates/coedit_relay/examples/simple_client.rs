//! Simple example client demonstrating the join flow
//!
//! This example shows how to:
//! 1. Create a session as host
//! 2. Join it from a second connection
//! 3. Answer the snapshot request as host
//! 4. Relay an edit from host to joiner

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

type Conn = Framed<TcpStream, LinesCodec>;

async fn recv(conn: &mut Conn) -> Result<String> {
    conn.next()
        .await
        .context("server closed the connection")?
        .context("failed to read line")
}

async fn send(conn: &mut Conn, line: &str) -> Result<()> {
    conn.send(line).await.context("failed to send line")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let addr = std::env::var("COEDIT_ADDR").unwrap_or_else(|_| "127.0.0.1:3018".to_string());
    let document = ["first line", "second line"];

    tracing::info!("1. Creating session...");
    let mut host = Framed::new(TcpStream::connect(&addr).await?, LinesCodec::new());
    send(&mut host, "create secret").await?;
    let session_id = recv(&mut host).await?;
    tracing::info!("   Session id: {}", session_id);

    tracing::info!("2. Joining session...");
    let mut guest = Framed::new(TcpStream::connect(&addr).await?, LinesCodec::new());
    send(&mut guest, &format!("join {session_id} secret")).await?;
    let answer = recv(&mut guest).await?;
    if answer != "success" {
        bail!("join refused: {answer}");
    }

    tracing::info!("3. Answering snapshot request...");
    let signal = recv(&mut host).await?;
    if signal != "request" {
        bail!("expected a snapshot request, got {signal:?}");
    }
    send(&mut host, "response").await?;
    send(&mut host, &document.len().to_string()).await?;
    for row in document {
        send(&mut host, row).await?;
    }

    let rows: usize = recv(&mut guest).await?.parse().context("bad row count")?;
    for i in 0..rows {
        tracing::info!("   row {}: {}", i, recv(&mut guest).await?);
    }

    tracing::info!("4. Relaying an edit...");
    send(&mut host, "char ! 11 0").await?;
    let mut fields = Vec::new();
    for _ in 0..4 {
        fields.push(recv(&mut guest).await?);
    }
    tracing::info!("   Guest received: {:?}", fields);

    tracing::info!("Example completed successfully!");
    Ok(())
}
