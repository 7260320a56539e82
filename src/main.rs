use natrelay::{
    crypto::Cipher,
    tcp::{self, Relay, RelayOpts},
    udp,
};
use std::future::Future;
use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::time::Duration;
use structopt::StructOpt;
use tokio::{select, signal, time::timeout};

#[derive(StructOpt, Debug)]
#[structopt(name = "natrelay")]
struct Opt {
    /// print debug messages
    #[structopt(long, global = true)]
    debug: bool,

    #[structopt(subcommand)]
    cmd: Cmd,
}

#[derive(StructOpt, Debug)]
enum Cmd {
    /// pair client requests with server connections
    Relay(RelayOpt),
    /// rendezvous server
    Broker(BrokerOpt),
    /// tunnel local connections through a relay
    Client(ClientOpt),
    /// serve relayed requests from a local service
    Server(ServerOpt),
    /// register a name with a rendezvous server and keep it alive
    Register(RegisterOpt),
    /// look up a registered name
    Punch(PunchOpt),
}

#[derive(StructOpt, Debug)]
struct RelayOpt {
    #[structopt(long = "client-port", default_value = "3333")]
    client_port: u16,

    #[structopt(long = "server-port", default_value = "4444")]
    server_port: u16,

    #[structopt(long = "buffer-size", default_value = "4096")]
    buffer_size: usize,

    /// seconds a client waits for a response, 0 waits forever
    #[structopt(long = "match-timeout", default_value = "30")]
    match_timeout: u64,
}

#[derive(StructOpt, Debug)]
struct BrokerOpt {
    #[structopt(long = "listen-addr", default_value = "0.0.0.0:5555")]
    listen_addr: SocketAddr,

    /// seconds without a ping before a registration is evicted
    #[structopt(long = "heartbeat-timeout", default_value = "10")]
    heartbeat_timeout: u64,
}

#[derive(StructOpt, Debug)]
struct ClientOpt {
    #[structopt(long = "port", default_value = "2222")]
    port: u16,

    #[structopt(long = "relay-addr")]
    relay_addr: String,

    /// 32 byte pre-shared key
    #[structopt(long = "key")]
    key: String,

    #[structopt(long = "buffer-size", default_value = "1024")]
    buffer_size: usize,
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
    #[structopt(long = "relay-addr")]
    relay_addr: String,

    #[structopt(long = "service-addr")]
    service_addr: String,

    /// 32 byte pre-shared key
    #[structopt(long = "key")]
    key: String,

    #[structopt(long = "buffer-size", default_value = "1024")]
    buffer_size: usize,

    /// seconds between retries
    #[structopt(long = "retry", default_value = "1")]
    retry: u64,
}

#[derive(StructOpt, Debug)]
struct RegisterOpt {
    #[structopt(long = "broker-addr")]
    broker_addr: String,

    #[structopt(long = "name")]
    name: String,

    /// seconds between registration attempts
    #[structopt(long = "retry", default_value = "5")]
    retry: u64,
}

#[derive(StructOpt, Debug)]
struct PunchOpt {
    #[structopt(long = "broker-addr")]
    broker_addr: String,

    #[structopt(long = "name")]
    name: String,

    /// send this to the peer and print what comes back
    #[structopt(long = "message")]
    message: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::from_args();

    let level = if opt.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let debug = opt.debug;
    match opt.cmd {
        Cmd::Relay(opt) => until_interrupted(run_relay(opt, debug)).await,
        Cmd::Broker(opt) => until_interrupted(run_broker(opt)).await,
        Cmd::Client(opt) => until_interrupted(run_client(opt)).await,
        Cmd::Server(opt) => until_interrupted(run_server(opt)).await,
        Cmd::Register(opt) => until_interrupted(run_register(opt)).await,
        Cmd::Punch(opt) => run_punch(opt).await,
    }
}

async fn until_interrupted<F: Future<Output = Result<()>>>(f: F) -> Result<()> {
    select! {
        r = f => r,
        r = signal::ctrl_c() => {
            r?;
            log::info!("interrupted");
            Ok(())
        }
    }
}

fn cipher(key: &str, buffer_size: usize) -> Result<Cipher> {
    Cipher::new(key.as_bytes(), buffer_size).map_err(|e| Error::new(ErrorKind::InvalidInput, e))
}

async fn run_relay(opt: RelayOpt, debug: bool) -> Result<()> {
    let relay = Relay::new(RelayOpts {
        client_port: opt.client_port,
        server_port: opt.server_port,
        buffer_size: opt.buffer_size,
        match_timeout: match opt.match_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        },
        debug,
    })
    .await?;

    log::info!(
        "relaying clients on {} to servers on {}",
        relay.client_addr()?,
        relay.server_addr()?
    );
    relay.run().await
}

async fn run_broker(opt: BrokerOpt) -> Result<()> {
    let s = udp::Server::new(opt.listen_addr)
        .await?
        .with_heartbeat_timeout(Duration::from_secs(opt.heartbeat_timeout));

    log::info!("rendezvous on {}", s.local_addr()?);
    s.run().await
}

async fn run_client(opt: ClientOpt) -> Result<()> {
    let c = tcp::Client::new(
        ("0.0.0.0", opt.port),
        &opt.relay_addr,
        cipher(&opt.key, opt.buffer_size)?,
    )
    .await?;

    log::info!("tunneling {} through {}", c.local_addr()?, opt.relay_addr);
    c.run().await
}

async fn run_server(opt: ServerOpt) -> Result<()> {
    let s = tcp::Server::new(
        &opt.relay_addr,
        &opt.service_addr,
        cipher(&opt.key, opt.buffer_size)?,
    )
    .with_retry(Duration::from_secs(opt.retry));

    log::info!("serving {} through {}", opt.service_addr, opt.relay_addr);
    s.run().await
}

async fn run_register(opt: RegisterOpt) -> Result<()> {
    let c = udp::Client::new(&opt.broker_addr, &opt.name, None).await?;
    log::info!("listening on {}", c.local_addr()?);

    select! {
        r = c.run(Duration::from_secs(opt.retry)) => r,
        r = echo(&c) => r,
    }
}

// answer every peer datagram with itself
async fn echo(c: &udp::Client) -> Result<()> {
    loop {
        let (data, peer) = c.recv_peer().await?;
        log::debug!("echoing {} bytes to {}", data.len(), peer);
        c.as_socket().send_to(&data, peer).await?;
    }
}

async fn run_punch(opt: PunchOpt) -> Result<()> {
    let c = udp::Client::new(&opt.broker_addr, "", None).await?;
    let peer = c.punch(&opt.name).await?;
    println!("{} {}", opt.name, peer);

    if let Some(message) = opt.message {
        c.as_socket().send_to(message.as_bytes(), peer).await?;
        let (reply, from) = timeout(udp::ROUND_TRIP_TIMEOUT, c.recv_peer())
            .await
            .map_err(|_| Error::new(ErrorKind::TimedOut, format!("no reply from {}", peer)))??;
        println!("{} {}", from, String::from_utf8_lossy(&reply));
    }
    Ok(())
}
