use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};

use crate::socks::codec::{DecodeReader, EncodeWriter};
use crate::socks::*;

const AUTH_NONE: u8 = 0x00;

#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    pub handshake_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub failure_policy: FailurePolicy,
}

/// Runs the method negotiation and the CONNECT request, then dials the
/// destination. On success the client has been sent the granted reply.
pub async fn handle(
    reader: &mut DecodeReader<impl AsyncRead + Unpin>,
    writer: &mut EncodeWriter<impl AsyncWrite + Unpin>,
    opts: &Options,
) -> Result<(TcpStream, Request), Rejection> {
    let mut buf = [0u8; HANDSHAKE_BUF_LEN];
    within(opts.handshake_timeout, negotiate(reader, writer, &mut buf)).await?;

    match establish(reader, writer, &mut buf, opts).await {
        Ok(v) => Ok(v),
        Err(rejection) => {
            if opts.failure_policy == FailurePolicy::Reply {
                if let Some(status) = rejection.status() {
                    // the connection is dropped either way
                    let _ = write_response(writer, status).await;
                }
            }
            Err(rejection)
        }
    }
}

async fn negotiate(
    reader: &mut DecodeReader<impl AsyncRead + Unpin>,
    writer: &mut EncodeWriter<impl AsyncWrite + Unpin>,
    buf: &mut [u8],
) -> Result<(), Rejection> {
    // Only the version is checked; the offered methods are ignored.
    let n = reader.read(buf).await?;
    if n == 0 {
        return Err(Rejection::Closed);
    }
    if buf[0] != SOCKS5 {
        return Err(Rejection::BadVersion(buf[0]));
    }
    write_message(writer, &[SOCKS5, AUTH_NONE]).await
}

async fn establish(
    reader: &mut DecodeReader<impl AsyncRead + Unpin>,
    writer: &mut EncodeWriter<impl AsyncWrite + Unpin>,
    buf: &mut [u8],
    opts: &Options,
) -> Result<(TcpStream, Request), Rejection> {
    let request = within(opts.handshake_timeout, read_request(reader, buf)).await?;
    let upstream = within(opts.connect_timeout, connect_to_upstream(&request)).await?;
    upstream.set_linger(Some(Duration::ZERO))?;
    write_response(writer, Status::Granted).await?;
    Ok((upstream, request))
}

async fn read_request(
    reader: &mut DecodeReader<impl AsyncRead + Unpin>,
    buf: &mut [u8],
) -> Result<Request, Rejection> {
    let n = reader.read(buf).await?;
    if n == 0 {
        return Err(Rejection::Closed);
    }
    Request::parse(&buf[..n])
}

async fn resolve(request: &Request) -> Result<SocketAddr, Rejection> {
    let port = request.port;
    match &request.address {
        Address::IPv4(ip) => Ok(SocketAddr::from((Ipv4Addr::from(*ip), port))),
        Address::IPv6(ip) => Ok(SocketAddr::from((Ipv6Addr::from(*ip), port))),
        Address::Domain(d) => {
            let addrs: Vec<SocketAddr> = lookup_host((d.as_str(), port))
                .await
                .map_err(|e| Rejection::Unresolved(d.clone(), e))?
                .collect();
            addrs
                .iter()
                .find(|a| a.is_ipv4())
                .or_else(|| addrs.first())
                .copied()
                .ok_or_else(|| {
                    let e = io::Error::new(io::ErrorKind::NotFound, "no addresses");
                    Rejection::Unresolved(d.clone(), e)
                })
        }
    }
}

async fn connect_to_upstream(request: &Request) -> Result<TcpStream, Rejection> {
    let addr = resolve(request).await?;
    TcpStream::connect(addr).await.map_err(Rejection::Connect)
}

async fn write_response(
    writer: &mut EncodeWriter<impl AsyncWrite + Unpin>,
    status: Status,
) -> Result<(), Rejection> {
    #[rustfmt::skip]
    let msg = [
        SOCKS5,                 // version
        status as u8,           // status
        0x00,                   // reserved
        ATYP_IPV4,              // address type
        0x00, 0x00, 0x00, 0x00, // IPv4 address
        0x00, 0x00,             // port
    ];
    write_message(writer, &msg).await
}

async fn write_message(
    writer: &mut EncodeWriter<impl AsyncWrite + Unpin>,
    msg: &[u8],
) -> Result<(), Rejection> {
    if writer.write(msg).await? != msg.len() {
        return Err(io::Error::from(io::ErrorKind::WriteZero).into());
    }
    Ok(())
}

async fn within<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = Result<T, Rejection>>,
) -> Result<T, Rejection> {
    match limit {
        None => fut.await,
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .map_err(|_| Rejection::TimedOut)?,
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;

    use super::*;
    use crate::cipher::{Cipher, Mode};

    struct Peer {
        stream: DuplexStream,
        cipher: Cipher,
    }

    impl Peer {
        async fn send(&mut self, msg: &[u8]) {
            let mut buf = msg.to_vec();
            self.cipher.transform().unwrap().encrypt(&mut buf);
            self.stream.write_all(&buf).await.unwrap();
        }

        async fn recv_all(&mut self) -> Vec<u8> {
            let mut buf = Vec::new();
            self.stream.read_to_end(&mut buf).await.unwrap();
            self.cipher.transform().unwrap().decrypt(&mut buf);
            buf
        }
    }

    async fn run_handshake(
        opts: Options,
        handshake: &[u8],
        request: &[u8],
    ) -> (Result<(TcpStream, Request), Rejection>, Vec<u8>) {
        let cipher = Cipher::new(Mode::Replace, Mode::Replace.generate_key()).unwrap();
        let (client, server) = tokio::io::duplex(1024);
        let mut peer = Peer {
            stream: client,
            cipher: cipher.clone(),
        };

        let (r, w) = tokio::io::split(server);
        let mut reader = DecodeReader::new(r, cipher.transform().unwrap());
        let mut writer = EncodeWriter::new(w, cipher.transform().unwrap());
        let server = tokio::spawn(async move { handle(&mut reader, &mut writer, &opts).await });

        peer.send(handshake).await;
        if !request.is_empty() {
            // wait for the method reply so the two messages arrive in separate reads
            let mut reply = [0u8; 2];
            peer.stream.read_exact(&mut reply).await.unwrap();
            cipher.transform().unwrap().decrypt(&mut reply);
            assert_eq!(reply, [0x05, 0x00]);
            peer.send(request).await;
        }
        let result = server.await.unwrap();
        let rest = peer.recv_all().await;
        (result, rest)
    }

    #[tokio::test]
    async fn bad_version_writes_nothing() {
        let (result, written) = run_handshake(Options::default(), &[0x04, 0x01, 0x00], &[]).await;
        assert!(matches!(result, Err(Rejection::BadVersion(4))));
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn connect_ipv4_dials_exact_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&port.to_be_bytes());

        let (result, written) = run_handshake(Options::default(), &[0x05, 0x01, 0x00], &request).await;
        let (upstream, req) = result.unwrap();
        let (_, from) = listener.accept().await.unwrap();
        assert_eq!(upstream.local_addr().unwrap(), from);
        assert_eq!(req.address, Address::IPv4([127, 0, 0, 1]));
        assert_eq!(written, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn connect_domain_resolves() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut request = vec![0x05, 0x01, 0x00, 0x03, 9];
        request.extend_from_slice(b"localhost");
        request.extend_from_slice(&port.to_be_bytes());

        let (result, _) = run_handshake(Options::default(), &[0x05, 0x01, 0x00], &request).await;
        let (upstream, req) = result.unwrap();
        assert_eq!(req.port, port);
        assert_eq!(upstream.peer_addr().unwrap().port(), port);
        listener.accept().await.unwrap();
    }

    #[tokio::test]
    async fn undefined_address_type_is_silent_by_default() {
        let request = [0x05, 0x01, 0x00, 0x02, 127, 0, 0, 1, 0x1F, 0x90];
        let (result, written) = run_handshake(Options::default(), &[0x05, 0x01, 0x00], &request).await;
        assert!(matches!(result, Err(Rejection::UnsupportedAddressType(2))));
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn reply_policy_sends_error_code() {
        let opts = Options {
            failure_policy: FailurePolicy::Reply,
            ..Options::default()
        };
        let request = [0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90];
        let (result, written) = run_handshake(opts, &[0x05, 0x01, 0x00], &request).await;
        assert!(matches!(result, Err(Rejection::UnsupportedCommand(2))));
        assert_eq!(written, [0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn refused_dial_is_silent_by_default() {
        // bind then drop to get a port nobody listens on
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&port.to_be_bytes());
        let (result, written) = run_handshake(Options::default(), &[0x05, 0x01, 0x00], &request).await;
        assert!(matches!(result, Err(Rejection::Connect(_))));
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn handshake_timeout() {
        let opts = Options {
            handshake_timeout: Some(Duration::from_millis(50)),
            ..Options::default()
        };
        let cipher = Cipher::new(Mode::Replace, Mode::Replace.generate_key()).unwrap();
        let (_client, server) = tokio::io::duplex(64);
        let (r, w) = tokio::io::split(server);
        let mut reader = DecodeReader::new(r, cipher.transform().unwrap());
        let mut writer = EncodeWriter::new(w, cipher.transform().unwrap());
        let result = handle(&mut reader, &mut writer, &opts).await;
        assert!(matches!(result, Err(Rejection::TimedOut)));
    }
}
