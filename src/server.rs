//! The front end: a line protocol over TCP for submitting jobs and querying
//! their status.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::error::DispatchError;
use crate::intake::Intake;
use crate::line_reader::{LineReader, ReadError};
use crate::parser::ParsingError;
use crate::types::job::{JobSpec, Priority, Target};
use crate::types::protocol::{Command, Response};
use crate::types::serialisable::WireSerialisable;

/// Accepts connections until `cancel` fires, handling each as its own task.
/// Every task holds a clone of `shutdown_hold` until its connection closes.
pub async fn serve(
    listener: TcpListener,
    intake: Intake,
    cancel: CancellationToken,
    shutdown_hold: mpsc::Sender<()>,
) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "listening");

    loop {
        let conn = match select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => break,
        } {
            Ok((conn, _)) => conn,
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        };

        tokio::spawn(begin_handle(
            intake.clone(),
            cancel.clone(),
            shutdown_hold.clone(),
            conn,
        ));
    }

    Ok(())
}

#[instrument(name = "handle", err, fields(peer = %conn.peer_addr()?), skip_all)]
async fn begin_handle(
    intake: Intake,
    cancel: CancellationToken,
    _shutdown_hold: mpsc::Sender<()>,
    mut conn: TcpStream,
) -> io::Result<()> {
    debug!("accepted connection");

    conn.set_nodelay(true)?;

    let ret = handle_conn(&intake, &cancel, &mut conn).await;

    conn.shutdown().await?;

    debug!("closed connection");

    ret
}

/// Serves one client until it quits, disconnects, sends an over-long line, or
/// `cancel` fires.
pub async fn handle_conn<S>(
    intake: &Intake,
    cancel: &CancellationToken,
    conn: S,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Split conn into read and write halves, where the read half uses our
    // LineReader.
    let (r, mut w) = tokio::io::split(conn);
    let mut r: LineReader<_> = r.into();

    loop {
        let line = select!(
            x = r.read_line() => match x {
                Ok(Some(x)) => x,
                Ok(None) => return Ok(()),
                Err(ReadError::TooLong(max)) => {
                    debug!(max, "line too long, closing connection");
                    w.write_all(&Response::LineTooLong.serialise_wire()).await?;
                    return w.flush().await;
                },
                Err(ReadError::Io(e)) => return Err(e),
            },
            _ = cancel.cancelled() => return Ok(()),
        );

        trace!(line = %line.escape_ascii(), "processing command");

        let cmd: Result<Command, ParsingError> = (&line as &[u8]).try_into();
        let resp = match cmd {
            Ok(Command::Quit) => return Ok(()),
            Ok(cmd) => dispatch(intake, cmd).await,
            Err(error) => error.into(),
        };

        // The command has already taken effect, so the reply is written even
        // if cancellation arrives meanwhile.
        w.write_all(&resp.serialise_wire()).await?;

        // Flush any buffered packets once we've written out the one or more
        // responses. This provides a pipelined response to a pipelined request.
        w.flush().await?;
    }
}

/// Runs a parsed command against the engine.
pub async fn dispatch(intake: &Intake, cmd: Command) -> Response {
    match cmd {
        Command::Submit {
            org_id,
            app_version_id,
            test_path,
            target,
            priority,
            max_retries,
        } => {
            let target = match target.parse::<Target>() {
                Ok(target) => target,
                Err(e) => return e.into(),
            };
            let priority = match Priority::try_from(priority) {
                Ok(priority) => priority,
                Err(e) => return e.into(),
            };
            let spec = JobSpec {
                org_id,
                app_version_id,
                test_path,
                priority,
                target,
                max_retries,
            };
            match intake.submit(spec).await {
                Ok(submitted) => Response::Submitted {
                    id: submitted.id,
                    queue: submitted.queue,
                },
                Err(DispatchError::Validation(e)) => e.into(),
                Err(error) => internal(error),
            }
        },
        Command::Status { id } => match intake.status(&id).await {
            Ok(job) => Response::OkStatus { data: job.into() },
            Err(DispatchError::NotFound(_)) => Response::NotFound,
            Err(error) => internal(error),
        },
        Command::Stats => match intake.stats().await {
            Ok(data) => Response::OkStats { data },
            Err(error) => internal(error),
        },
        Command::ListDead => match intake.dead_letters().await {
            Ok(ids) => Response::OkListDead { ids },
            Err(error) => internal(error),
        },
        // Handled by the connection loop.
        Command::Quit => Response::InternalError,
    }
}

fn internal(error: DispatchError) -> Response {
    error!(%error, "command failed");
    Response::InternalError
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};

    use super::*;
    use crate::config::Settings;
    use crate::testing::fixture;
    use crate::types::job::JobId;
    use crate::types::states::JobStatus;

    struct Client {
        r: LineReader<ReadHalf<DuplexStream>>,
        w: WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, line: &str) -> String {
            self.w.write_all(line.as_bytes()).await.unwrap();
            self.w.write_all(b"\r\n").await.unwrap();
            self.read().await
        }

        async fn read(&mut self) -> String {
            let line = self.r.read_line().await.unwrap().unwrap();
            String::from_utf8(line.to_vec()).unwrap()
        }

        async fn body(&mut self, header: &str) -> String {
            let n = header.strip_prefix("OK ").unwrap().parse().unwrap();
            let body = self.r.read_chunk(n).await.unwrap().unwrap();
            String::from_utf8(body.to_vec()).unwrap()
        }
    }

    fn connect(
        intake: Intake,
        cancel: CancellationToken,
    ) -> (Client, tokio::task::JoinHandle<io::Result<()>>) {
        let (client, server) = duplex(8192);
        let task = tokio::spawn(async move {
            handle_conn(&intake, &cancel, server).await
        });
        let (r, w) = tokio::io::split(client);
        (Client { r: r.into(), w }, task)
    }

    #[tokio::test]
    async fn test_submit_then_status() {
        let f = fixture(Settings::default());
        let (mut c, task) = connect(f.intake.clone(), CancellationToken::new());

        let reply = c
            .send("submit acme v1.2 tests/login.spec.js device 8 2")
            .await;
        let mut parts = reply.split(' ');
        assert_eq!(parts.next(), Some("SUBMITTED"));
        let id: JobId = parts.next().unwrap().parse().unwrap();
        assert_eq!(parts.next(), Some("batchq:queue:p8"));

        let header = c.send(&format!("status {id}")).await;
        let body = c.body(&header).await;
        assert!(body.contains(&id.to_string()));
        assert!(body.contains("status: queued"));
        assert!(body.contains("target: device"));
        assert!(body.contains("max-retries: 2"));
        assert_eq!(f.intake.status(&id).await.unwrap().status, JobStatus::Queued);

        let header = c.send("stats").await;
        assert!(c.body(&header).await.contains("current-jobs-ready: 1"));

        c.w.write_all(b"quit\r\n").await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rejections() {
        let f = fixture(Settings::default());
        let (mut c, _task) = connect(f.intake.clone(), CancellationToken::new());

        assert_eq!(c.send("submit o v t.js moon 5 1").await, "BAD_TARGET");
        assert_eq!(c.send("submit o v t.js emulator 0 1").await, "BAD_PRIORITY");
        assert_eq!(c.send("submit o v t.js emulator 11 1").await, "BAD_PRIORITY");
        assert_eq!(
            c.send("submit o v t.js emulator 5 6").await,
            "BAD_MAX_RETRIES"
        );
        assert_eq!(c.send("submit o v t.js emulator 5").await, "BAD_FORMAT");
        assert_eq!(c.send("delete 1").await, "UNKNOWN_COMMAND");
        assert_eq!(
            c.send(&format!("status {}", JobId::generate())).await,
            "NOT_FOUND"
        );
        assert_eq!(f.intake.stats().await.unwrap().ready, 0);

        let header = c.send("list-dead").await;
        assert_eq!(c.body(&header).await, "[]\n");
    }

    #[tokio::test]
    async fn test_line_too_long_closes_connection() {
        let f = fixture(Settings::default());
        let (mut c, task) = connect(f.intake.clone(), CancellationToken::new());

        let long = "x".repeat(crate::line_reader::MAX_LINE_LEN + 10);
        assert_eq!(c.send(&long).await, "LINE_TOO_LONG");
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_ends_connection() {
        let f = fixture(Settings::default());
        let cancel = CancellationToken::new();
        let (_c, task) = connect(f.intake.clone(), cancel.clone());
        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
