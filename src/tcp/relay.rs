use log;
use std::io::{Error, ErrorKind, ErrorKind::Other, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    select,
    sync::{
        mpsc::{channel, Receiver, Sender},
        oneshot,
    },
    task::JoinSet,
    time::timeout,
};

#[derive(Debug, Clone)]
pub struct RelayOpts {
    pub client_port: u16,
    pub server_port: u16,
    /// largest chunk read from either leg
    pub buffer_size: usize,
    /// how long a client leg waits for its response, `None` waits forever
    pub match_timeout: Option<Duration>,
    /// log payload previews
    pub debug: bool,
}

impl Default for RelayOpts {
    fn default() -> Self {
        Self {
            client_port: 3333,
            server_port: 4444,
            buffer_size: 4096,
            match_timeout: Some(Duration::from_secs(30)),
            debug: false,
        }
    }
}

struct Message {
    payload: Vec<u8>,
    reply: oneshot::Sender<Result<Vec<u8>>>,
}

/// Tcp request relay
///
/// Clients connect to one port, servers behind NAT dial the other. Each client request is
/// handed to the next server connection in strict arrival order, and the server's answer
/// is written back to the client. One request per connection.
pub struct Relay {
    client_listener: TcpListener,
    server_listener: TcpListener,
    opts: RelayOpts,
}

impl Relay {
    /// bind both ports on all interfaces
    pub async fn new(opts: RelayOpts) -> Result<Self> {
        Self::bind(
            ("0.0.0.0", opts.client_port),
            ("0.0.0.0", opts.server_port),
            opts,
        )
        .await
    }

    pub async fn bind<A: ToSocketAddrs, B: ToSocketAddrs>(
        client_addr: A,
        server_addr: B,
        opts: RelayOpts,
    ) -> Result<Self> {
        let client_listener = TcpListener::bind(client_addr).await?;
        let server_listener = TcpListener::bind(server_addr).await?;

        Self::from_listeners(client_listener, server_listener, opts)
    }

    /// relay on listeners bound elsewhere
    pub fn from_listeners(
        client_listener: TcpListener,
        server_listener: TcpListener,
        opts: RelayOpts,
    ) -> Result<Self> {
        log::debug!("listening for clients on {}", client_listener.local_addr()?);
        log::debug!("listening for servers on {}", server_listener.local_addr()?);

        Ok(Self {
            client_listener,
            server_listener,
            opts,
        })
    }

    pub fn client_addr(&self) -> Result<SocketAddr> {
        self.client_listener.local_addr()
    }

    pub fn server_addr(&self) -> Result<SocketAddr> {
        self.server_listener.local_addr()
    }

    /// Run both accept loops until one of them fails.
    ///
    /// All connection tasks belong to the relay; they are aborted when this future returns
    /// or is dropped.
    pub async fn run(self) -> Result<()> {
        // capacity 1: never more than one request waiting for a server leg
        let (tx, rx) = channel(1);

        let mut loops = JoinSet::new();
        loops.spawn(accept_clients(self.client_listener, tx, self.opts.clone()));
        loops.spawn(accept_servers(self.server_listener, rx, self.opts));

        match loops.join_next().await {
            Some(Ok(r)) => r,
            Some(Err(e)) => Err(Error::new(Other, e)),
            None => Ok(()),
        }
    }
}

async fn accept_clients(listener: TcpListener, queue: Sender<Message>, opts: RelayOpts) -> Result<()> {
    let mut conns = JoinSet::new();

    loop {
        let (stream, addr) = listener.accept().await.map_err(|e| {
            log::error!("error accepting from client: {}", e);
            e
        })?;
        while conns.try_join_next().is_some() {}

        log::debug!("client {} connected", addr);

        let queue = queue.clone();
        let opts = opts.clone();
        conns.spawn(async move {
            if let Err(e) = handle_client(stream, queue, &opts).await {
                log::warn!("client {}: {}", addr, e);
            }
        });
    }
}

async fn handle_client(mut stream: TcpStream, queue: Sender<Message>, opts: &RelayOpts) -> Result<()> {
    let payload = read_chunk(&mut stream, opts.buffer_size).await?;
    log_payload("client request", &payload, opts.debug);

    let (reply, response) = oneshot::channel();
    let matched = async move {
        queue
            .send(Message { payload, reply })
            .await
            .map_err(|_| Error::new(Other, "relay is shutting down"))?;

        response
            .await
            .map_err(|_| Error::new(Other, "server leg dropped the request"))?
    };

    let limit = opts.match_timeout;
    let wait = async move {
        match limit {
            Some(limit) => timeout(limit, matched).await.unwrap_or_else(|_| {
                Err(Error::new(ErrorKind::TimedOut, "no response from a server leg"))
            }),
            None => matched.await,
        }
    };

    // on error the client sees the connection close without a payload.
    // a client leaving drops the reply slot, so no server leg is spent on it
    let response = select! {
        r = wait => r?,
        r = client_gone(&mut stream) => {
            r?;
            return Err(Error::new(
                ErrorKind::ConnectionAborted,
                "client left before its response",
            ));
        }
    };

    log_payload("response", &response, opts.debug);
    stream.write_all(&response).await?;
    stream.shutdown().await
}

// resolves once the client closes its side; bytes past the request are discarded
async fn client_gone(stream: &mut TcpStream) -> Result<()> {
    let mut buf = [0; 64];
    while stream.read(&mut buf).await? > 0 {}
    Ok(())
}

async fn accept_servers(listener: TcpListener, mut queue: Receiver<Message>, opts: RelayOpts) -> Result<()> {
    let mut conns = JoinSet::new();

    loop {
        let (stream, addr) = listener.accept().await.map_err(|e| {
            log::error!("error accepting from server: {}", e);
            e
        })?;
        while conns.try_join_next().is_some() {}

        log::debug!("server leg {} connected, waiting for a request", addr);

        // dequeue in accept order so the nth server leg serves the nth request
        let message = loop {
            let message = queue
                .recv()
                .await
                .ok_or_else(|| Error::new(Other, "request queue closed"))?;

            if !message.reply.is_closed() {
                break message;
            }
            log::debug!("skipping request abandoned by its client");
        };

        let opts = opts.clone();
        conns.spawn(async move {
            let Message { payload, reply } = message;

            let result = forward(stream, &payload, &opts).await;
            if let Err(ref e) = result {
                log::warn!("error handling server leg {}: {}", addr, e);
            }

            let _ = reply.send(result);
        });
    }
}

async fn forward(mut stream: TcpStream, payload: &[u8], opts: &RelayOpts) -> Result<Vec<u8>> {
    stream.write_all(payload).await?;

    let response = read_chunk(&mut stream, opts.buffer_size).await?;
    log_payload("server response", &response, opts.debug);

    Ok(response)
}

async fn read_chunk(stream: &mut TcpStream, limit: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; limit];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Err(Error::new(ErrorKind::UnexpectedEof, "connection closed"));
    }

    buf.truncate(n);
    Ok(buf)
}

fn log_payload(what: &str, payload: &[u8], debug: bool) {
    if debug {
        log::debug!(
            "{} with {} bytes:\n{}",
            what,
            payload.len(),
            String::from_utf8_lossy(payload)
        );
    } else {
        log::trace!("{} with {} bytes", what, payload.len());
    }
}
