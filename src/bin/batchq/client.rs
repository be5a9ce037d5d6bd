use anyhow::{Context, Result};
use batchq::line_reader::LineReader;
use batchq::types::protocol::Command;
use batchq::types::serialisable::WireSerialisable;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// What the front end said, ready to print.
pub(crate) enum Reply {
    /// `SUBMITTED ...`, or the body of an `OK <n>` response.
    Success(String),
    /// Any other response line, such as `NOT_FOUND` or `BAD_TARGET`.
    Refused(String),
}

/// Sends one command and reads its response.
pub(crate) async fn request(server: &str, cmd: &Command) -> Result<Reply> {
    let mut conn = TcpStream::connect(server)
        .await
        .with_context(|| format!("connecting to {server}"))?;
    let (r, mut w) = conn.split();
    let mut r: LineReader<_> = r.into();

    w.write_all(&cmd.serialise_wire()).await?;
    w.flush().await?;

    let line = r
        .read_line()
        .await?
        .context("server closed the connection")?;
    let line = String::from_utf8_lossy(&line).into_owned();
    debug!(%line, "received response");

    let reply = if let Some(n) = line.strip_prefix("OK ") {
        let n: usize = n.parse().context("malformed OK response")?;
        let body = r
            .read_chunk(n)
            .await?
            .context("server closed the connection mid-response")?;
        Reply::Success(String::from_utf8_lossy(&body).into_owned())
    } else if line.starts_with("SUBMITTED ") {
        Reply::Success(line)
    } else {
        Reply::Refused(line)
    };

    // Best effort; the server also copes with a dropped connection.
    let _ = w.write_all(&Command::Quit.serialise_wire()).await;

    Ok(reply)
}
