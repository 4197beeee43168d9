use std::net::SocketAddr;
use std::time::Duration;

use anyhow::anyhow;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

pub async fn listen(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {:?}", listener.local_addr()?);
    Ok(listener)
}

pub async fn accept(listener: &TcpListener, linger: Option<Duration>) -> anyhow::Result<(TcpStream, SocketAddr)> {
    let (stream, addr) = listener.accept().await?;
    configure(&stream, linger)?;
    debug!("accepted connection from {:?}", addr);
    Ok((stream, addr))
}

fn configure(stream: &TcpStream, linger: Option<Duration>) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    if linger.is_some() {
        stream.set_linger(linger)?;
    }
    Ok(())
}

/// Dials `addr`, retrying every [CONNECT_RETRY_INTERVAL] while the peer is not reachable:
///
/// * `max_wait == None` retries forever
/// * `max_wait == Some(Duration::ZERO)` makes a single attempt
/// * otherwise retries until `max_wait` has elapsed
pub async fn connect(addr: SocketAddr, max_wait: Option<Duration>, linger: Option<Duration>) -> anyhow::Result<TcpStream> {
    let start = Instant::now();
    let mut attempt = 0u64;
    loop {
        attempt += 1;
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                configure(&stream, linger)?;
                info!("connected to {:?} after {} attempt(s)", addr, attempt);
                return Ok(stream);
            }
            Err(e) => {
                let give_up = match max_wait {
                    None => false,
                    Some(max_wait) => start.elapsed() + CONNECT_RETRY_INTERVAL > max_wait,
                };
                if give_up {
                    return Err(anyhow!("could not connect to {:?} after {} attempt(s): {}", addr, attempt, e));
                }
                if attempt == 1 {
                    warn!("connecting to {:?} failed, retrying: {}", addr, e);
                }
                else {
                    debug!("connecting to {:?} failed (attempt {}): {}", addr, attempt, e);
                }
                sleep(CONNECT_RETRY_INTERVAL).await;
            }
        }
    }
}
