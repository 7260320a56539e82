use crate::crypto::{Cipher, TunnelError};
use log;
use std::io::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    task::JoinSet,
};

/// Tcp tunnel client
///
/// Accepts local application connections and tunnels each one, encrypted, through the
/// relay's client port as a single request/response exchange.
///
/// # example
/// ```no_run
/// use natrelay::{crypto::Cipher, tcp::Client};
///
/// # async fn run() -> std::io::Result<()> {
/// let cipher = Cipher::new(b"passphrasewhichneedstobe32bytes!", 1024).unwrap();
/// let c = Client::new("127.0.0.1:2222", "relay:3333", cipher).await?;
/// c.run().await
/// # }
/// ```
pub struct Client {
    listener: TcpListener,
    relay_addr: String,
    cipher: Arc<Cipher>,
}

impl Client {
    pub async fn new<A: ToSocketAddrs>(listen_addr: A, relay_addr: &str, cipher: Cipher) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        log::debug!("listening for applications on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            relay_addr: relay_addr.to_owned(),
            cipher: Arc::new(cipher),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// accept until the listener fails, connection tasks are aborted on return
    pub async fn run(self) -> Result<()> {
        let mut conns = JoinSet::new();

        loop {
            let (stream, addr) = self.listener.accept().await?;
            while conns.try_join_next().is_some() {}

            let relay_addr = self.relay_addr.clone();
            let cipher = self.cipher.clone();
            conns.spawn(async move {
                if let Err(e) = Self::handle(stream, &relay_addr, &cipher).await {
                    log::warn!("error tunneling {}: {}", addr, e);
                }
            });
        }
    }

    async fn handle(mut local: TcpStream, relay_addr: &str, cipher: &Cipher) -> std::result::Result<(), TunnelError> {
        log::debug!("relaying to {}", relay_addr);
        let mut relay = TcpStream::connect(relay_addr).await?;

        cipher.encrypt_round_trip(&mut relay, &mut local).await
    }
}
