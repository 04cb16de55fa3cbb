use std::net::SocketAddr;
use std::time::{Duration, Instant};

use slog::{debug, info, o, warn};
use tokio::net::{TcpListener, TcpStream};

use crate::cipher::Cipher;
use crate::config::Settings;
use crate::socks::codec::{DecodeReader, EncodeWriter};
use crate::socks::relay::{self, RelayError};
use crate::socks::socks5;

pub struct Server {
    logger: slog::Logger,
    listener: TcpListener,
    cipher: Cipher,
    opts: socks5::Options,
}

impl Server {
    pub async fn bind(logger: slog::Logger, settings: &Settings) -> anyhow::Result<Self> {
        let addr = (settings.local_addr.ip.as_str(), settings.local_addr.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind: {e}"))?;
        Ok(Server {
            logger,
            listener,
            cipher: settings.cipher.clone(),
            opts: socks5::Options {
                handshake_timeout: settings.handshake_timeout,
                connect_timeout: settings.connect_timeout,
                failure_policy: settings.failure_policy,
            },
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(self.logger, "server started";
            "addr" => %addr,
            "mode" => %self.cipher.mode(),
        );

        let mut conn_id: u64 = 0;
        loop {
            conn_id += 1;
            match self.listener.accept().await {
                Ok((conn, addr)) => {
                    let logger = self.logger.new(o!("id" => conn_id));
                    if let Err(err) = conn.set_linger(Some(Duration::ZERO)) {
                        debug!(logger, "failed to disable linger"; "err" => %err);
                    }
                    let h = Handler {
                        logger,
                        cipher: self.cipher.clone(),
                        opts: self.opts,
                    };
                    tokio::spawn(h.handle(conn, addr));
                }
                Err(err) => {
                    slog::error!(self.logger, "failed to accept"; "err" => %err);
                }
            }
        }
    }
}

struct Handler {
    logger: slog::Logger,
    cipher: Cipher,
    opts: socks5::Options,
}

impl Handler {
    async fn handle(self, client: TcpStream, client_addr: SocketAddr) {
        if let Err(e) = self.handle_conn(client, client_addr).await {
            warn!(self.logger, "proxy failed"; "err" => %e);
        }
    }

    async fn handle_conn(&self, client: TcpStream, client_addr: SocketAddr) -> anyhow::Result<()> {
        let started_at = Instant::now();
        debug!(self.logger, "accepted"; "client_addr" => client_addr);

        let (client_reader, client_writer) = client.into_split();
        let mut client_reader = DecodeReader::new(client_reader, self.cipher.transform()?);
        let mut client_writer = EncodeWriter::new(client_writer, self.cipher.transform()?);

        let (upstream, request) =
            match socks5::handle(&mut client_reader, &mut client_writer, &self.opts).await {
                Ok(v) => v,
                Err(rejection) => {
                    debug!(self.logger, "rejected"; "client_addr" => client_addr, "reason" => %rejection);
                    return Ok(());
                }
            };
        info!(self.logger, "proxy start";
            "client_addr" => client_addr,
            "dst" => %request.address,
            "port" => request.port,
        );

        let (upstream_reader, upstream_writer) = upstream.into_split();
        let outcome = relay::run(
            &self.logger,
            client_reader,
            client_writer,
            upstream_reader,
            upstream_writer,
        )
        .await;

        for (direction, result) in [("upload", &outcome.uploaded), ("download", &outcome.downloaded)] {
            match result {
                Err(RelayError::TornDown) | Ok(_) => {}
                Err(e) => warn!(self.logger, "relay failed"; "direction" => direction, "err" => %e),
            }
        }
        let elapsed = started_at.elapsed();
        info!(self.logger, "proxy done";
            "downloaded_bytes" => outcome.downloaded.as_ref().ok(),
            "uploaded_bytes" => outcome.uploaded.as_ref().ok(),
            "elapsed" => ?elapsed,
        );
        Ok(())
    }
}
