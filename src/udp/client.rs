use log;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{Error, ErrorKind, ErrorKind::Other, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    net::{lookup_host, UdpSocket},
    sync::{
        mpsc::{channel, error::TrySendError, Receiver, Sender},
        Mutex,
    },
    task::JoinHandle,
    time::{sleep, timeout},
};

use super::proto::{Action, Request, Response};

/// how long to wait for the rendezvous server to answer one request
pub const ROUND_TRIP_TIMEOUT: Duration = Duration::from_secs(5);
/// keepalive period, must stay below the server's heartbeat timeout
pub const PING_INTERVAL: Duration = Duration::from_secs(5);

// peer datagrams beyond this are dropped until the caller catches up
const PEER_QUEUE: usize = 64;
const RESPONSE_QUEUE: usize = 8;

type Datagram = (Vec<u8>, SocketAddr);

/// Udp rendezvous client
///
/// A server behind NAT registers its name and keeps pinging; a peer punches the name to
/// learn the server's public address.
///
/// One background task owns every receive on the socket. Packets from the rendezvous
/// server answer the pending request, anything else is peer traffic and is returned by
/// [`Client::recv_peer`], also while [`Client::keepalive`] runs.
///
/// # example
/// ```no_run
/// use natrelay::udp::Client;
/// use std::sync::Arc;
///
/// # async fn run() -> std::io::Result<()> {
/// let c1 = Arc::new(Client::new("rendezvous:5555", "c1", None).await?);
/// tokio::spawn({
///     let c1 = c1.clone();
///     async move { c1.keepalive().await }
/// });
///
/// let (data, peer) = c1.recv_peer().await?;
/// c1.as_socket().send_to(&data, peer).await?;
/// # Ok(())
/// # }
/// ```
///
/// ```no_run
/// use natrelay::udp::Client;
///
/// # async fn run() -> std::io::Result<()> {
/// let c2 = Client::new("rendezvous:5555", "c2", None).await?;
/// let peer = c2.punch("c1").await?;
/// c2.as_socket().send_to(b"hello", peer).await?;
/// let (_echo, _) = c2.recv_peer().await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    name: String,
    ping_interval: Duration,
    round_trip_timeout: Duration,
    responses: Mutex<Receiver<Response>>,
    peers: Mutex<Receiver<Datagram>>,
    reader: JoinHandle<()>,
}

impl Client {
    /// set rendezvous server, own name, local bind address.
    /// if no local address set, choose according server address type(ipv4 or ipv6).
    pub async fn new(server_addr: &str, name: &str, local_addr: Option<SocketAddr>) -> Result<Self> {
        let server_addr = lookup_host(server_addr)
            .await?
            .next()
            .ok_or_else(|| Error::new(Other, "server name resolve fail"))?;

        let local_addr = match local_addr {
            Some(addr) => addr,
            None => match server_addr {
                SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
                SocketAddr::V6(_) => ([0u16; 8], 0).into(),
            },
        };

        let socket = Arc::new(Self::bind(local_addr)?);
        let (responses_tx, responses) = channel(RESPONSE_QUEUE);
        let (peers_tx, peers) = channel(PEER_QUEUE);
        let reader = tokio::spawn(dispatch(socket.clone(), server_addr, responses_tx, peers_tx));

        Ok(Self {
            socket,
            server_addr,
            name: name.into(),
            ping_interval: PING_INTERVAL,
            round_trip_timeout: ROUND_TRIP_TIMEOUT,
            responses: Mutex::new(responses),
            peers: Mutex::new(peers),
            reader,
        })
    }

    pub fn with_ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self
    }

    pub fn with_round_trip_timeout(mut self, round_trip_timeout: Duration) -> Self {
        self.round_trip_timeout = round_trip_timeout;
        self
    }

    // reusable, so the same port can talk to the peer directly after a punch
    fn bind(local_addr: SocketAddr) -> Result<UdpSocket> {
        let socket = Socket::new(
            Domain::for_address(local_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&local_addr.into())?;

        UdpSocket::from_std(socket.into())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// For sending to peers. Receiving belongs to the client, use [`Client::recv_peer`].
    pub fn as_socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Next datagram that did not come from the rendezvous server.
    pub async fn recv_peer(&self) -> Result<Datagram> {
        self.peers
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::new(Other, "socket reader stopped"))
    }

    /// ask the server for the address registered under `target`
    pub async fn punch(&self, target: &str) -> Result<SocketAddr> {
        match self.request(Request::new(Action::Punch, target)).await? {
            Response::Success(addr) => addr
                .parse()
                .map_err(|_| Error::new(Other, format!("invalid peer address {}", addr))),
            Response::Fail(reason) => Err(Error::new(
                Other,
                format!("failed to punch to {}: {}", target, reason),
            )),
            resp => Err(unexpected(resp)),
        }
    }

    pub async fn register(&self) -> Result<()> {
        match self.request(Request::new(Action::Register, &self.name)).await? {
            Response::Success(_) => {
                log::debug!("registered as {}", self.name);
                Ok(())
            }
            Response::Fail(reason) => Err(Error::new(
                Other,
                format!("failed to register {}: {}", self.name, reason),
            )),
            resp => Err(unexpected(resp)),
        }
    }

    pub async fn unregister(&self) -> Result<()> {
        match self.request(Request::new(Action::Unregister, &self.name)).await? {
            Response::Success(_) => Ok(()),
            resp => Err(unexpected(resp)),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        match self.request(Request::new(Action::Ping, &self.name)).await? {
            Response::Pong(_) => Ok(()),
            Response::Fail(reason) => Err(Error::new(
                Other,
                format!("failed to ping {}: {}", self.name, reason),
            )),
            resp => Err(unexpected(resp)),
        }
    }

    /// Register, then ping forever. Returns on the first round that fails.
    pub async fn keepalive(&self) -> Result<()> {
        self.register().await?;

        loop {
            sleep(self.ping_interval).await;
            self.ping().await?;
        }
    }

    /// [`Client::keepalive`], starting over from registration after `retry` whenever it fails.
    pub async fn run(&self, retry: Duration) -> Result<()> {
        loop {
            log::info!("registering {} with {}", self.name, self.server_addr);
            if let Err(e) = self.keepalive().await {
                log::warn!("lost registration: {}, retrying in {:?}", e, retry);
                sleep(retry).await;
            }
        }
    }

    // one request in flight at a time, the responses lock is held for the whole exchange
    async fn request(&self, req: Request) -> Result<Response> {
        let mut responses = self.responses.lock().await;

        // answers to requests that already timed out
        while let Ok(resp) = responses.try_recv() {
            log::debug!("dropping stale response {}", resp);
        }

        self.socket
            .send_to(req.to_string().as_bytes(), self.server_addr)
            .await?;

        let answer = async {
            loop {
                match responses.recv().await {
                    Some(resp) if resp.answers(&req) => return Ok(resp),
                    Some(resp) => log::debug!("ignoring {} while waiting on {}", resp, req),
                    None => return Err(Error::new(Other, "socket reader stopped")),
                }
            }
        };

        timeout(self.round_trip_timeout, answer)
            .await
            .map_err(|_| Error::new(ErrorKind::TimedOut, format!("no reply to {}", req)))?
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn dispatch(
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    responses: Sender<Response>,
    peers: Sender<Datagram>,
) {
    let mut buf = [0; 1500];

    loop {
        let (n, addr) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            // icmp port unreachable from an earlier send, not fatal for the socket
            Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                log::debug!("error receiving: {}", e);
                continue;
            }
            Err(e) => {
                log::error!("error receiving: {}", e);
                return;
            }
        };

        if addr != server_addr {
            match peers.try_send((buf[..n].to_vec(), addr)) {
                Ok(()) => log::trace!("{} bytes from peer {}", n, addr),
                Err(TrySendError::Full(_)) => log::debug!("peer queue full, dropping packet from {}", addr),
                Err(TrySendError::Closed(_)) => return,
            }
            continue;
        }

        match Response::parse(&buf[..n]) {
            Ok(resp) => {
                if let Err(TrySendError::Full(resp)) = responses.try_send(resp) {
                    log::debug!("dropping response {}, nobody is waiting", resp);
                }
            }
            Err(e) => log::debug!("invalid response from server: {}", e),
        }
    }
}

fn unexpected(resp: Response) -> Error {
    Error::new(Other, format!("unexpected response {}", resp))
}
