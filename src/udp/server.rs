use log;
use std::collections::HashMap;
use std::io::Result;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::{
    net::{ToSocketAddrs, UdpSocket},
    select,
    sync::mpsc::{channel, error::TrySendError, Receiver, Sender},
    task::JoinSet,
    time::timeout,
};

use super::proto::{
    Action, Request, Response, ADDRESS_MISMATCH, ALREADY_REGISTERED, BAD_REQUEST,
    NOT_MONITORING, NOT_REGISTERED,
};

/// a registration not pinged within this window is evicted
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

struct Registration {
    id: u64,
    addr: SocketAddr,
    ticks: Sender<SocketAddr>,
}

#[derive(Clone, Default)]
struct Registry(Arc<RwLock<HashMap<String, Registration>>>);

impl Registry {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Registration>> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Registration>> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// remove `name` only if it still belongs to registration `id`
    fn evict(&self, name: &str, id: u64) -> bool {
        let mut registry = self.write();
        match registry.get(name) {
            Some(r) if r.id == id => {
                registry.remove(name);
                true
            }
            _ => false,
        }
    }
}

/// Udp rendezvous server
///
/// keep a name -> address registry of servers, answer punch requests with the registered
/// address, and evict registrations that stop pinging.
pub struct Server {
    socket: Arc<UdpSocket>,
    registry: Registry,
    monitors: JoinSet<()>,
    heartbeat_timeout: Duration,
    count: u64,
}

impl Server {
    pub async fn new<A: ToSocketAddrs>(listen_addr: A) -> Result<Self> {
        let socket = UdpSocket::bind(listen_addr).await?;

        Ok(Self {
            socket: Arc::new(socket),
            registry: Default::default(),
            monitors: JoinSet::new(),
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            count: 0,
        })
    }

    pub fn with_heartbeat_timeout(mut self, heartbeat_timeout: Duration) -> Self {
        self.heartbeat_timeout = heartbeat_timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn next_id(&mut self) -> u64 {
        self.count += 1;
        self.count
    }

    /// Serve until the socket fails. Monitor tasks are aborted when this future returns or
    /// is dropped.
    pub async fn run(mut self) -> Result<()> {
        let mut buf = [0; 1500];

        loop {
            let (size, addr) = select! {
                r = self.socket.recv_from(&mut buf) => r.map_err(|e| {
                    log::error!("error receiving: {}", e);
                    e
                })?,
                Some(r) = self.monitors.join_next() => {
                    if let Err(e) = r {
                        log::warn!("monitor task failed: {}", e);
                    }
                    continue;
                }
            };

            self.handle_request(&buf[..size], addr).await;
        }
    }

    async fn handle_request(&mut self, buf: &[u8], addr: SocketAddr) {
        let resp = match Request::parse(buf) {
            Ok(req) => {
                log::trace!("{} from {}", req, addr);
                self.handle(req, addr)
            }
            Err(e) => {
                log::debug!("bad request from {}: {}", addr, e);
                Some(Response::Fail(BAD_REQUEST.into()))
            }
        };

        if let Some(resp) = resp {
            send_response(&self.socket, resp, addr).await;
        }
    }

    fn handle(&mut self, req: Request, addr: SocketAddr) -> Option<Response> {
        match req.action {
            Action::Register => Some(self.handle_register(req.name, addr)),
            Action::Unregister => Some(self.handle_unregister(req.name)),
            Action::Punch => Some(self.handle_punch(req.name, addr)),
            Action::Ping => self.handle_ping(req.name, addr),
        }
    }

    fn handle_register(&mut self, name: String, addr: SocketAddr) -> Response {
        let id = self.next_id();
        let (tx, rx) = channel(8);

        {
            let mut registry = self.registry.write();
            if registry.contains_key(&name) {
                log::debug!("{} already registered", name);
                return Response::Fail(ALREADY_REGISTERED.into());
            }

            registry.insert(
                name.clone(),
                Registration {
                    id,
                    addr,
                    ticks: tx,
                },
            );
        }

        log::debug!("{} registered as {}", addr, name);

        self.monitors.spawn(monitor(
            self.socket.clone(),
            self.registry.clone(),
            name.clone(),
            id,
            rx,
            self.heartbeat_timeout,
        ));

        Response::Success(name)
    }

    fn handle_unregister(&mut self, name: String) -> Response {
        // dropping the registration closes its tick channel, which stops the monitor
        if self.registry.write().remove(&name).is_some() {
            log::debug!("{} unregistered", name);
        }

        Response::Success(name)
    }

    fn handle_punch(&self, name: String, addr: SocketAddr) -> Response {
        match self.registry.read().get(&name) {
            Some(r) => {
                log::debug!("punch from {} to {}", addr, name);
                Response::Success(r.addr.to_string())
            }
            None => {
                log::debug!("punch from {}: {} not registered", addr, name);
                Response::Fail(NOT_REGISTERED.into())
            }
        }
    }

    /// `None` means the tick reached the monitor, which answers with PONG itself.
    fn handle_ping(&self, name: String, addr: SocketAddr) -> Option<Response> {
        let registry = self.registry.read();
        let r = match registry.get(&name) {
            Some(r) => r,
            None => return Some(Response::Fail(NOT_REGISTERED.into())),
        };

        if r.ticks.is_closed() {
            return Some(Response::Fail(NOT_MONITORING.into()));
        }

        if r.addr != addr {
            log::debug!("ping for {} from {}, registered at {}", name, addr, r.addr);
            return Some(Response::Fail(ADDRESS_MISMATCH.into()));
        }

        match r.ticks.try_send(addr) {
            Ok(()) => None,
            Err(TrySendError::Full(_)) => {
                log::debug!("dropping ping for {}, monitor is behind", name);
                None
            }
            Err(TrySendError::Closed(_)) => Some(Response::Fail(NOT_MONITORING.into())),
        }
    }
}

async fn monitor(
    socket: Arc<UdpSocket>,
    registry: Registry,
    name: String,
    id: u64,
    mut ticks: Receiver<SocketAddr>,
    heartbeat_timeout: Duration,
) {
    loop {
        match timeout(heartbeat_timeout, ticks.recv()).await {
            Ok(Some(addr)) => {
                log::trace!("ping {}", name);
                send_response(&socket, Response::Pong(name.clone()), addr).await;
            }
            Ok(None) => {
                log::trace!("stopped monitoring {}", name);
                return;
            }
            Err(_) => {
                if registry.evict(&name, id) {
                    log::debug!("{} unregistered after timeout", name);
                }
                return;
            }
        }
    }
}

async fn send_response(socket: &UdpSocket, resp: Response, addr: SocketAddr) {
    if let Err(e) = socket.send_to(resp.to_string().as_bytes(), addr).await {
        log::warn!("failed to send {} to {}: {}", resp, addr, e);
    }
}
