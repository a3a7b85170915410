//! Access-log event source.
//!
//! Lines look like
//!
//! ```text
//! 2024/05/01 12:00:00 from tcp:10.0.0.5:51000 accepted tcp:198.51.100.7:6881 [vless-in >> TORRENT] email: 42.alice
//! ```
//!
//! A line is a violation when one of its bracketed routing groups ends
//! with the configured tag. The offending address follows `from ` and the
//! user follows `email: `.

use anyhow::Result;
use std::io::SeekFrom;
use std::net::IpAddr;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const FROM_MARKER: &str = "from ";
const EMAIL_MARKER: &str = "email: ";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Canonical textual form of the source address
    pub address: String,
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct LineParser {
    tag: String,
}

impl LineParser {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.trim().to_string(),
        }
    }

    /// Whether any `[...]` group in the line ends with the tag as a whole word.
    pub fn has_tag(&self, line: &str) -> bool {
        if self.tag.is_empty() {
            return false;
        }
        line.match_indices(']').any(|(close, _)| {
            let Some(open) = line[..close].rfind('[') else {
                return false;
            };
            let group = line[open + 1..close].trim_end();
            match group.strip_suffix(self.tag.as_str()) {
                Some(rest) => rest.is_empty() || rest.ends_with(|c: char| c.is_whitespace() || c == '>'),
                None => false,
            }
        })
    }

    pub fn parse(&self, line: &str) -> Option<Violation> {
        if !self.has_tag(line) {
            return None;
        }
        let address = parse_source_address(line)?;
        let username = parse_username(line)?;
        Some(Violation {
            address: address.to_string(),
            username: username.to_string(),
        })
    }
}

/// Address after `from `, optionally prefixed by `tcp:`/`udp:` and followed
/// by `:port`. IPv6 sources are bracketed.
fn parse_source_address(line: &str) -> Option<IpAddr> {
    let start = line.find(FROM_MARKER)? + FROM_MARKER.len();
    let rest = &line[start..];
    let rest = rest
        .strip_prefix("tcp:")
        .or_else(|| rest.strip_prefix("udp:"))
        .unwrap_or(rest);

    let candidate = if let Some(v6) = rest.strip_prefix('[') {
        &v6[..v6.find(']')?]
    } else {
        let end = rest
            .find(|c: char| c == ':' || c.is_whitespace())
            .unwrap_or(rest.len());
        &rest[..end]
    };

    candidate.parse().ok()
}

fn parse_username(line: &str) -> Option<&str> {
    let start = line.find(EMAIL_MARKER)? + EMAIL_MARKER.len();
    let username = line[start..].split_whitespace().next()?;
    Some(username)
}

/// Follows a growing log file by polling.
///
/// Starts at the end of a file that exists at startup, reads a file that
/// appears later from its beginning, and reopens after rotation (new inode)
/// or truncation (size below the read offset).
pub struct LogWatcher {
    path: PathBuf,
    parser: LineParser,
    poll_interval: Duration,
}

struct TailState {
    inode: u64,
    offset: u64,
    pending: Vec<u8>,
}

impl LogWatcher {
    pub fn new(path: impl Into<PathBuf>, parser: LineParser) -> Self {
        Self {
            path: path.into(),
            parser,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Emit violations until the receiver is dropped.
    pub async fn run(self, tx: mpsc::Sender<Violation>) -> Result<()> {
        let mut state = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => {
                info!("Watching {} from offset {}", self.path.display(), meta.len());
                Some(TailState {
                    inode: meta.ino(),
                    offset: meta.len(),
                    pending: Vec::new(),
                })
            }
            Err(_) => {
                warn!("{} does not exist yet, waiting for it", self.path.display());
                None
            }
        };

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let meta = match tokio::fs::metadata(&self.path).await {
                Ok(meta) => meta,
                Err(_) => continue,
            };

            let reopen = match &state {
                Some(tail) => tail.inode != meta.ino() || meta.len() < tail.offset,
                None => true,
            };
            if reopen {
                if state.is_some() {
                    info!("{} was rotated or truncated, reopening", self.path.display());
                }
                state = Some(TailState {
                    inode: meta.ino(),
                    offset: 0,
                    pending: Vec::new(),
                });
            }
            let Some(tail) = state.as_mut() else {
                continue;
            };

            if meta.len() == tail.offset {
                continue;
            }

            let chunk = match self.read_from(tail.offset).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!("Failed to read {}: {}", self.path.display(), e);
                    continue;
                }
            };
            tail.offset += chunk.len() as u64;
            tail.pending.extend_from_slice(&chunk);

            for line in drain_lines(&mut tail.pending) {
                let Some(violation) = self.parser.parse(&line) else {
                    if self.parser.has_tag(&line) {
                        debug!("Tagged line without address or user: {}", line);
                    }
                    continue;
                };
                if tx.send(violation).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    async fn read_from(&self, offset: u64) -> std::io::Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

/// Split off every complete line, leaving a partial last line buffered.
fn drain_lines(pending: &mut Vec<u8>) -> Vec<String> {
    let Some(last_newline) = pending.iter().rposition(|&b| b == b'\n') else {
        return Vec::new();
    };
    let complete: Vec<u8> = pending.drain(..=last_newline).collect();
    complete
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| String::from_utf8_lossy(line).trim_end_matches('\r').to_string())
        .collect()
}
