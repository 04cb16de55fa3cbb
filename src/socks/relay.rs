use std::io;
use std::sync::Arc;

use slog::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;

use crate::socks::codec::{write_counted, DecodeReader, EncodeWriter};

const RELAY_BUF_LEN: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { expected: usize, written: usize },
    #[error("connection torn down")]
    TornDown,
}

/// Closes both sockets of a relay pair: once triggered, every loop waiting
/// on it returns and drops its socket halves.
struct Teardown {
    tx: watch::Sender<bool>,
}

impl Teardown {
    fn new() -> Self {
        Teardown {
            tx: watch::Sender::new(false),
        }
    }

    fn trigger(&self) {
        self.tx.send_replace(true);
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in `self`, so this cannot fail
        let _ = rx.wait_for(|torn_down| *torn_down).await;
    }
}

pub struct Outcome {
    pub uploaded: Result<u64, RelayError>,
    pub downloaded: Result<u64, RelayError>,
}

/// Relays between the client and the destination until the pair is torn
/// down.
///
/// Client to destination runs in its own task. If it fails, both sockets are
/// closed; if the client merely stops sending, nothing is closed and the
/// destination keeps its connection (no FIN is forwarded). Destination to
/// client runs here; when it ends, for any reason, both sockets are closed.
pub async fn run<CR, CW, UR, UW>(
    logger: &slog::Logger,
    mut client_reader: DecodeReader<CR>,
    mut client_writer: EncodeWriter<CW>,
    mut upstream_reader: UR,
    mut upstream_writer: UW,
) -> Outcome
where
    CR: AsyncRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin,
    UR: AsyncRead + Unpin,
    UW: AsyncWrite + Unpin + Send + 'static,
{
    let teardown = Arc::new(Teardown::new());

    let inbound = {
        let teardown = teardown.clone();
        let logger = logger.clone();
        tokio::spawn(async move {
            let result = decode_copy(&mut client_reader, &mut upstream_writer, &teardown).await;
            match &result {
                Ok(n) => {
                    debug!(logger, "client finished sending"; "uploaded_bytes" => *n);
                    teardown.wait().await;
                }
                Err(RelayError::TornDown) => {}
                Err(_) => teardown.trigger(),
            }
            result
        })
    };

    let downloaded = encode_copy(&mut upstream_reader, &mut client_writer, &teardown).await;
    teardown.trigger();
    drop(upstream_reader);
    drop(client_writer);

    let uploaded = match inbound.await {
        Ok(result) => result,
        Err(e) => Err(RelayError::Io(io::Error::other(e))),
    };
    Outcome {
        uploaded,
        downloaded,
    }
}

/// Client to destination: read, decrypt, write.
async fn decode_copy(
    client: &mut DecodeReader<impl AsyncRead + Unpin>,
    upstream: &mut (impl AsyncWrite + Unpin),
    teardown: &Teardown,
) -> Result<u64, RelayError> {
    let mut buf = vec![0u8; RELAY_BUF_LEN];
    let mut total = 0u64;
    loop {
        let n = tokio::select! {
            r = client.read(&mut buf) => r?,
            _ = teardown.wait() => return Err(RelayError::TornDown),
        };
        if n == 0 {
            return Ok(total);
        }
        let written = tokio::select! {
            r = write_counted(upstream, &buf[..n]) => r?,
            _ = teardown.wait() => return Err(RelayError::TornDown),
        };
        if written != n {
            return Err(RelayError::ShortWrite {
                expected: n,
                written,
            });
        }
        total += n as u64;
    }
}

/// Destination to client: read, encrypt, write.
async fn encode_copy(
    upstream: &mut (impl AsyncRead + Unpin),
    client: &mut EncodeWriter<impl AsyncWrite + Unpin>,
    teardown: &Teardown,
) -> Result<u64, RelayError> {
    let mut buf = vec![0u8; RELAY_BUF_LEN];
    let mut total = 0u64;
    loop {
        let n = tokio::select! {
            r = upstream.read(&mut buf) => r?,
            _ = teardown.wait() => return Err(RelayError::TornDown),
        };
        if n == 0 {
            return Ok(total);
        }
        let written = tokio::select! {
            r = client.write_in_place(&mut buf[..n]) => r?,
            _ = teardown.wait() => return Err(RelayError::TornDown),
        };
        if written != n {
            return Err(RelayError::ShortWrite {
                expected: n,
                written,
            });
        }
        total += n as u64;
    }
}
