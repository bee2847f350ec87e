//! In-process SSH server used only by this crate's own tests.
//!
//! Mirrors the teacher's `ssh::server::TunnelServer` (a `Server` impl that
//! spawns one `Handler` per connection) but stripped to the minimum this
//! crate's tests need: accept any public key, answer `exec "echo ping"`
//! with `"ping\n"` (the health-check probe), and bridge `direct-tcpip`
//! channels to a real local TCP connection (the tunnel data path).

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::PublicKey;
use russh::server::{Auth, Handle, Msg, Server, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::{Algorithm, PrivateKey};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct TestHandler;

#[async_trait]
impl russh::server::Handler for TestHandler {
    type Error = russh::Error;

    async fn auth_publickey(&mut self, _user: &str, _key: &PublicKey) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data);
        if command.trim() == "echo ping" {
            session.data(channel, CryptoVec::from_slice(b"ping\n"));
        }
        session.channel_success(channel);
        session.eof(channel);
        session.close(channel);
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let handle = session.handle();
        let target = format!("{host_to_connect}:{port_to_connect}");
        tokio::spawn(async move {
            let Ok(stream) = TcpStream::connect(&target).await else {
                return;
            };
            bridge_channel(channel, stream, handle).await;
        });
        Ok(true)
    }
}

async fn bridge_channel(channel: Channel<Msg>, mut tcp: TcpStream, _handle: Handle) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = channel.into_stream();
    let _ = tokio::io::copy_bidirectional(&mut stream, &mut tcp).await;
    let _ = stream.shutdown().await;
}

#[derive(Clone)]
struct TestServer;

impl Server for TestServer {
    type Handler = TestHandler;

    fn new_client(&mut self, _peer_addr: Option<SocketAddr>) -> Self::Handler {
        TestHandler
    }
}

/// A running in-process SSH server bound to a known port, controllable
/// from tests via [`TestSshServer::stop`] to simulate an agent dying.
pub struct TestSshServer {
    pub addr: SocketAddr,
    pub host_key_public_text: String,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl TestSshServer {
    pub async fn start() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self::start_on(0).await
    }

    /// Starts on a fixed port (0 = ephemeral), used to simulate a restart
    /// of the same agent address.
    pub async fn start_on(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("bind test ssh server");
        let addr = listener.local_addr().unwrap();

        let host_key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
            .expect("generate test host key");
        let host_key_public_text = host_key
            .public_key()
            .to_openssh()
            .unwrap_or_default();

        let config = Arc::new(russh::server::Config {
            keys: vec![host_key],
            ..Default::default()
        });

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let join = tokio::spawn(async move {
            let mut server = TestServer;
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { continue };
                        let handler = server.new_client(Some(peer));
                        let config = config.clone();
                        tokio::spawn(async move {
                            let _ = russh::server::run_stream(config, stream, handler).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            host_key_public_text,
            cancel,
            join,
        }
    }

    /// Stops accepting connections and drops existing sessions, simulating
    /// an agent container dying.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}
