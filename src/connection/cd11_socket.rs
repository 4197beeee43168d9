use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::frames::codec::{parse_frame, PartialFrame};
use crate::frames::frame_type::FrameType;
use crate::frames::stream_decoder::{read_frame, DecodeOutcome, StreamDecoder};
use crate::frames::Frame;

/// A frame read from the stream - or whatever could be made of bytes that did not form one
#[derive(Debug)]
pub enum ReadResult {
    Frame(Frame),
    Malformed(PartialFrame),
}

struct FrameReader {
    read_half: OwnedReadHalf,
    buf: BytesMut,
    decoder: StreamDecoder,
}

/// A TCP connection carrying CD-1.1 frames.
///
/// Reads and writes are serialized separately, so one task can block in [Cd11Socket::read_frame]
///  while others send frames. Frames are always written as a whole.
pub struct Cd11Socket {
    peer_addr: SocketAddr,
    reader: tokio::sync::Mutex<FrameReader>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    last_contact: Mutex<Instant>,
    last_acknack_sent: Mutex<Option<Instant>>,
    last_data_sent: Mutex<Option<Instant>>,
}

impl Cd11Socket {
    pub fn new(stream: TcpStream, max_frame_size: usize) -> anyhow::Result<Cd11Socket> {
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Cd11Socket {
            peer_addr,
            reader: tokio::sync::Mutex::new(FrameReader {
                read_half,
                buf: BytesMut::new(),
                decoder: StreamDecoder::new(max_frame_size),
            }),
            writer: tokio::sync::Mutex::new(write_half),
            last_contact: Mutex::new(Instant::now()),
            last_acknack_sent: Mutex::new(None),
            last_data_sent: Mutex::new(None),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Reads the next frame. Returns `None` if `cancel` fires or the peer closes the connection
    ///  between frames.
    pub async fn read_frame(&self, cancel: &CancellationToken) -> anyhow::Result<Option<ReadResult>> {
        let mut reader = self.reader.lock().await;
        let FrameReader { read_half, buf, decoder } = &mut *reader;

        let outcome = match read_frame(read_half, buf, decoder, cancel).await? {
            None => return Ok(None),
            Some(outcome) => outcome,
        };
        self.touch();

        let result = match outcome {
            DecodeOutcome::Frame(raw) => match parse_frame(raw) {
                Ok(frame) => ReadResult::Frame(frame),
                Err(partial) => ReadResult::Malformed(partial),
            },
            DecodeOutcome::Malformed { consumed, reason } => ReadResult::Malformed(PartialFrame {
                header: None,
                body: None,
                trailer: None,
                error: anyhow!(reason),
                raw: consumed,
            }),
            DecodeOutcome::NeedMoreData => return Err(anyhow!("decoder asked for more data after the stream was read")),
        };

        if let ReadResult::Frame(frame) = &result {
            trace!("received {} frame #{} from {:?}", frame.frame_type(), frame.sequence_number(), self.peer_addr);
        }
        Ok(Some(result))
    }

    pub async fn write_frame(&self, frame: &Frame) -> anyhow::Result<()> {
        {
            let mut writer = self.writer.lock().await;
            writer.write_all(&frame.to_bytes()).await?;
            writer.flush().await?;
        }
        trace!("sent {} frame #{} to {:?}", frame.frame_type(), frame.sequence_number(), self.peer_addr);

        match frame.frame_type() {
            FrameType::Acknack => *lock(&self.last_acknack_sent) = Some(Instant::now()),
            FrameType::Data => *lock(&self.last_data_sent) = Some(Instant::now()),
            _ => {}
        }
        Ok(())
    }

    /// sends a frame, giving up after `limit` - for teardown, when the peer may be unresponsive
    pub async fn write_frame_with_timeout(&self, frame: &Frame, limit: Duration) -> anyhow::Result<()> {
        timeout(limit, self.write_frame(frame)).await
            .map_err(|_| anyhow!("sending {} frame timed out after {:?}", frame.frame_type(), limit))?
    }

    /// closes the sending direction, the receiving direction ends when the peer closes
    pub async fn shutdown(&self, limit: Duration) {
        match timeout(limit, async { self.writer.lock().await.shutdown().await }).await {
            Ok(Ok(())) => debug!("closed connection to {:?}", self.peer_addr),
            Ok(Err(e)) => debug!("error closing connection to {:?}: {}", self.peer_addr, e),
            Err(_) => debug!("closing connection to {:?} timed out", self.peer_addr),
        }
    }

    #[cfg(test)]
    pub async fn write_raw(&self, bytes: &[u8]) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    fn touch(&self) {
        *lock(&self.last_contact) = Instant::now();
    }

    pub fn time_since_last_contact(&self) -> Duration {
        lock(&self.last_contact).elapsed()
    }

    pub fn seconds_since_last_contact(&self) -> u64 {
        self.time_since_last_contact().as_secs()
    }

    pub fn time_since_last_acknack_sent(&self) -> Option<Duration> {
        lock(&self.last_acknack_sent).map(|t| t.elapsed())
    }

    pub fn time_since_last_data_sent(&self) -> Option<Duration> {
        lock(&self.last_data_sent).map(|t| t.elapsed())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
