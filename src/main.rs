use netpipe::codec::Compression;
use netpipe::config::{Config, BUFFER_SIZE, MESSAGE_BUFFER_SIZE};
use netpipe::multiplex::{Multiplexer, RecvHandler};
use netpipe::relay::{Client, RelayServer};
use netpipe::stats::Stats;
use netpipe::transport::Transport;
use std::io::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::task;

#[derive(StructOpt, Debug)]
#[structopt(name = "netpipe")]
enum Opt {
    /// Run a rendezvous relay server
    Server(ServerOpt),
    /// Join a relay session and pipe stdin/stdout through it
    Connect(ConnectOpt),
    /// Accept direct connections and pipe stdin/stdout to all of them
    Listen(ListenOpt),
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
    #[structopt(long = "listen-addr", default_value = "0.0.0.0:42421")]
    listen_addr: SocketAddr,

    /// Also serve the relay over HTTP on this address
    #[structopt(long = "http-addr")]
    http_addr: Option<SocketAddr>,

    /// Idle session timeout, in seconds
    #[structopt(long = "idle-timeout", default_value = "1800")]
    idle_timeout: u64,

    #[structopt(long = "max-connections", default_value = "1000")]
    max_connections: usize,

    #[structopt(long = "debug")]
    debug: bool,
}

#[derive(StructOpt, Debug)]
struct ConnectOpt {
    #[structopt(long = "server-addr")]
    server_addr: String,

    #[structopt(long = "session")]
    session: String,

    /// none, gzip, zlib or zstd
    #[structopt(long = "compression", default_value = "none")]
    compression: Compression,

    #[structopt(long = "compress-level", default_value = "6")]
    compress_level: u32,

    #[structopt(long = "debug")]
    debug: bool,
}

#[derive(StructOpt, Debug)]
struct ListenOpt {
    #[structopt(long = "bind", default_value = "0.0.0.0:4242")]
    bind: SocketAddr,

    /// none, gzip, zlib or zstd
    #[structopt(long = "compression", default_value = "none")]
    compression: Compression,

    #[structopt(long = "compress-level", default_value = "6")]
    compress_level: u32,

    #[structopt(long = "debug")]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt: Opt = StructOpt::from_args();

    match opt {
        Opt::Server(opt) => run_server(opt).await,
        Opt::Connect(opt) => run_connect(opt).await,
        Opt::Listen(opt) => run_listen(opt).await,
    }
}

fn init_logging(debug: bool) {
    let mut builder = env_logger::Builder::from_default_env();
    if debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();
}

async fn run_server(opt: ServerOpt) -> Result<()> {
    init_logging(opt.debug);

    let config = Config {
        idle_timeout: Duration::from_secs(opt.idle_timeout),
        max_connections: opt.max_connections,
        debug: opt.debug,
        ..Default::default()
    };

    let server = RelayServer::new(opt.listen_addr, opt.http_addr, config).await?;
    server.run().await
}

async fn run_connect(opt: ConnectOpt) -> Result<()> {
    init_logging(opt.debug);

    let stream = Client::new(&opt.server_addr, &opt.session).connect().await?;
    log::info!("joined session {} via {}", opt.session, opt.server_addr);

    let config = Config {
        compression: opt.compression,
        compression_level: opt.compress_level,
        debug: opt.debug,
        ..Default::default()
    };
    let mux = new_multiplexer(&config);
    mux.add_connection("relay", Transport::Tcp(stream));
    mux.start_listening(write_stdout);

    pump_stdin(mux, Some("relay")).await
}

async fn run_listen(opt: ListenOpt) -> Result<()> {
    init_logging(opt.debug);

    let listener = TcpListener::bind(opt.bind).await?;
    log::info!("accepting connections on {}", listener.local_addr()?);

    let config = Config {
        compression: opt.compression,
        compression_level: opt.compress_level,
        debug: opt.debug,
        ..Default::default()
    };
    let mux = new_multiplexer(&config);

    {
        let mux = mux.clone();
        task::spawn(async move {
            let handler: RecvHandler = Arc::new(write_stdout);
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::warn!("accept failed: {}", e);
                        continue;
                    }
                };
                let id = addr.to_string();
                mux.add_connection(&id, Transport::Tcp(stream));
                mux.listen_connection(&id, handler.clone());
            }
        });
    }

    pump_stdin(mux, None).await
}

fn new_multiplexer(config: &Config) -> Arc<Multiplexer> {
    let stats = Arc::new(Stats::new(MESSAGE_BUFFER_SIZE));
    let mut mux = Multiplexer::new(stats);
    mux.set_compression(config.compression, config.compression_level);
    Arc::new(mux)
}

fn write_stdout(_id: &str, data: &[u8]) {
    use std::io::Write;

    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(data);
    let _ = stdout.flush();
}

async fn pump_stdin(mux: Arc<Multiplexer>, target: Option<&str>) -> Result<()> {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        let n = stdin.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        match target {
            Some(id) => mux.send_to(id, &buf[..n]).await?,
            None => mux.send_to_all(&buf[..n]).await,
        }
    }

    mux.close().await;
    Ok(())
}
