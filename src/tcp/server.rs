use crate::crypto::{Cipher, TunnelError};
use log;
use std::io::Result;
use std::time::Duration;
use tokio::{net::TcpStream, time::sleep};

/// Tcp tunnel server
///
/// Runs next to a service that can only make outbound connections. Keeps one connection
/// open to the relay's server port; each one carries a single decrypted request to the
/// service and the encrypted response back.
pub struct Server {
    relay_addr: String,
    service_addr: String,
    cipher: Cipher,
    retry: Duration,
}

impl Server {
    pub fn new(relay_addr: &str, service_addr: &str, cipher: Cipher) -> Self {
        Self {
            relay_addr: relay_addr.to_owned(),
            service_addr: service_addr.to_owned(),
            cipher,
            retry: Duration::from_secs(1),
        }
    }

    /// delay before the next attempt after a failed exchange
    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    /// Serve requests forever, one at a time.
    pub async fn run(self) -> Result<()> {
        loop {
            if let Err(e) = self.fetch_and_relay().await {
                log::warn!("error fetching and relaying: {}, retrying in {:?}", e, self.retry);
                sleep(self.retry).await;
            }
        }
    }

    /// Handle exactly one request from the relay.
    pub async fn fetch_and_relay(&self) -> std::result::Result<(), TunnelError> {
        let mut service = TcpStream::connect(&self.service_addr).await?;
        log::debug!("connected to service at {}", self.service_addr);

        let mut relay = TcpStream::connect(&self.relay_addr).await?;
        log::debug!("connected to relay at {}, ready to relay", self.relay_addr);

        self.cipher.decrypt_round_trip(&mut service, &mut relay).await
    }
}
