use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use common::config::{FeedConfig, FeedKind};
use common::feed::Subscribe;
use common::{Error, FeedMessage, FeedSource, InstrumentGroup, Result};

const CONNECT_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(8);

/// JSON-lines feed over any buffered reader (a replay file or a socket).
///
/// Lines are read as raw bytes, so a line that is not valid UTF-8 is a
/// malformed message like any other bad JSON. Blank lines are skipped. When
/// `require_exit` is set, running out of input before an `exit` message is
/// reported as a transport failure.
pub struct LineFeed<R> {
    reader: R,
    buf: Vec<u8>,
    require_exit: bool,
    finished: bool,
}

impl<R: AsyncBufRead + Unpin + Send> LineFeed<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            require_exit: false,
            finished: false,
        }
    }

    pub fn require_exit(mut self) -> Self {
        self.require_exit = true;
        self
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> FeedSource for LineFeed<R> {
    async fn next(&mut self) -> Option<Result<FeedMessage>> {
        if self.finished {
            return None;
        }
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf).await {
                Ok(0) => {
                    self.finished = true;
                    if self.require_exit {
                        return Some(Err(Error::Feed(
                            "feed closed before the exit message".into(),
                        )));
                    }
                    return None;
                }
                Ok(_) => {
                    if self.buf.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    let parsed =
                        serde_json::from_slice::<FeedMessage>(&self.buf).map_err(Error::from);
                    if matches!(parsed, Ok(FeedMessage::Exit)) {
                        self.finished = true;
                    }
                    return Some(parsed);
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(Error::Io(e)));
                }
            }
        }
    }
}

/// Line feed from a price server, holding the write half open for the
/// lifetime of the subscription.
pub struct TcpFeed {
    inner: LineFeed<BufReader<OwnedReadHalf>>,
    _writer: OwnedWriteHalf,
}

impl TcpFeed {
    /// Connect, retrying with exponential backoff, then subscribe to the
    /// group's instruments.
    pub async fn connect(address: &str, group: &InstrumentGroup) -> Result<Self> {
        let stream = connect_with_backoff(address).await?;
        let (read, mut write) = stream.into_split();

        let mut request = serde_json::to_string(&Subscribe {
            instruments: &group.instruments,
        })?;
        request.push('\n');
        write.write_all(request.as_bytes()).await?;
        write.flush().await?;
        info!(address, instruments = group.len(), "Subscribed to price server");

        Ok(Self {
            inner: LineFeed::new(BufReader::new(read)).require_exit(),
            _writer: write,
        })
    }
}

#[async_trait]
impl FeedSource for TcpFeed {
    async fn next(&mut self) -> Option<Result<FeedMessage>> {
        self.inner.next().await
    }
}

async fn connect_with_backoff(address: &str) -> Result<TcpStream> {
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 1;
    loop {
        match TcpStream::connect(address).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!(address, attempt, error = %e, backoff = ?backoff, "Price server connect failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                attempt += 1;
            }
            Err(e) => {
                return Err(Error::Feed(format!(
                    "could not connect to {address} after {attempt} attempts: {e}"
                )))
            }
        }
    }
}

/// Feed backed by an in-process channel. Ends when every sender is dropped.
pub struct ChannelFeed {
    rx: mpsc::Receiver<FeedMessage>,
}

impl ChannelFeed {
    pub fn new(rx: mpsc::Receiver<FeedMessage>) -> Self {
        Self { rx }
    }

    pub fn channel(capacity: usize) -> (mpsc::Sender<FeedMessage>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl FeedSource for ChannelFeed {
    async fn next(&mut self) -> Option<Result<FeedMessage>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Build the feed described by `[feed]` for one group.
pub async fn open_feed(config: &FeedConfig, group: &InstrumentGroup) -> Result<Box<dyn FeedSource>> {
    match config.kind {
        FeedKind::File => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| Error::Config("feed.path is required for file feeds".into()))?;
            let file = File::open(path).await.map_err(|e| {
                Error::Feed(format!("cannot open feed file '{}': {e}", path.display()))
            })?;
            info!(path = %path.display(), "Replaying bars from file");
            Ok(Box::new(LineFeed::new(BufReader::new(file))))
        }
        FeedKind::Tcp => {
            let address = config
                .address
                .as_deref()
                .ok_or_else(|| Error::Config("feed.address is required for tcp feeds".into()))?;
            Ok(Box::new(TcpFeed::connect(address, group).await?))
        }
    }
}
