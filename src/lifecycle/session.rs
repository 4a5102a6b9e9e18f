//! Byte bridging between a local terminal and a remote exec session.

use std::io::{self, Read};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, Stderr, Stdout};
use tokio::sync::mpsc;
use tracing::warn;

use crate::engine::{ExecOutput, ExecSession};

const READ_CHUNK: usize = 8 * 1024;

/// Local endpoints attached to an interactive session.
pub struct SessionIo<R, W, E> {
    pub stdin: R,
    pub stdout: W,
    pub stderr: E,
}

impl SessionIo<DetachedReader, Stdout, Stderr> {
    /// The process's own standard streams.
    ///
    /// Stdin is read on a detached thread, so a read still pending when the
    /// remote session ends does not keep the runtime from shutting down.
    pub fn stdio() -> Self {
        Self {
            stdin: DetachedReader::stdin(),
            stdout: tokio::io::stdout(),
            stderr: tokio::io::stderr(),
        }
    }
}

/// Async reader fed by a blocking reader running on its own OS thread.
///
/// The thread is never joined. It ends when its source reaches EOF or
/// fails, or on its next read after the `DetachedReader` is dropped.
#[derive(Debug)]
pub struct DetachedReader {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    pending: Vec<u8>,
    offset: usize,
}

impl DetachedReader {
    pub fn stdin() -> Self {
        Self::spawn(io::stdin())
    }

    /// Moves `source` onto a new thread and streams what it reads.
    pub fn spawn<R>(mut source: R) -> Self
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(4);
        let spawned = std::thread::Builder::new()
            .name("repocate-stdin".to_string())
            .spawn(move || loop {
                let mut chunk = vec![0; READ_CHUNK];
                let sent = match source.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        chunk.truncate(n);
                        tx.blocking_send(Ok(chunk))
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e));
                        break;
                    }
                };
                if sent.is_err() {
                    break;
                }
            });

        // Without a reader thread the sender is already gone and reads see EOF.
        if let Err(e) = spawned {
            warn!(error = %e, "Could not start input reader thread");
        }

        Self {
            rx,
            pending: Vec::new(),
            offset: 0,
        }
    }
}

impl AsyncRead for DetachedReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.offset < this.pending.len() {
                let n = buf.remaining().min(this.pending.len() - this.offset);
                buf.put_slice(&this.pending[this.offset..this.offset + n]);
                this.offset += n;
                return Poll::Ready(Ok(()));
            }

            match ready!(this.rx.poll_recv(cx)) {
                Some(Ok(chunk)) => {
                    this.pending = chunk;
                    this.offset = 0;
                }
                Some(Err(e)) => return Poll::Ready(Err(e)),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

/// Copies bytes in both directions until the remote side ends.
///
/// Local EOF closes the session's stdin but keeps draining output, so the
/// remote process sees end-of-input and can exit on its own.
pub async fn bridge<R, W, E>(session: ExecSession, io: SessionIo<R, W, E>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let ExecSession {
        mut output,
        mut input,
    } = session;
    let SessionIo {
        mut stdin,
        mut stdout,
        mut stderr,
    } = io;

    let pump_in = async {
        tokio::io::copy(&mut stdin, &mut input).await?;
        input.shutdown().await
    };

    let pump_out = async {
        while let Some(chunk) = output.next().await {
            let chunk = chunk.map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
            match chunk {
                ExecOutput::Stdout(bytes) => {
                    stdout.write_all(&bytes).await?;
                    stdout.flush().await?;
                }
                ExecOutput::Stderr(bytes) => {
                    stderr.write_all(&bytes).await?;
                    stderr.flush().await?;
                }
            }
        }
        Ok::<_, io::Error>(())
    };

    tokio::pin!(pump_in, pump_out);
    let mut input_open = true;

    loop {
        tokio::select! {
            res = &mut pump_out => return res,
            res = &mut pump_in, if input_open => {
                res?;
                input_open = false;
            }
        }
    }
}
