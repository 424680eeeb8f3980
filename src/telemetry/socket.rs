//! Unix-socket telemetry transport.
//!
//! Each topic is served at `<dir>/<topic>.sock`. The publisher writes one
//! JSON `procLog` message per line; a reader thread decodes them into the
//! subscription's mailbox.

use std::io::{self, BufRead, BufReader, Read};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use super::{Mailbox, MailboxSubscription, SubscribeOptions, Subscription, Transport};
use crate::error::{CpuwatchError, Result};
use crate::snapshot::ProcessSnapshot;

/// Longest accepted message line. Longer lines are skipped.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SocketTransport {
    dir: PathBuf,
    max_message_bytes: usize,
}

impl SocketTransport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_message_bytes: MAX_MESSAGE_BYTES,
        }
    }

    pub fn with_max_message_bytes(mut self, limit: usize) -> Self {
        self.max_message_bytes = limit.max(1);
        self
    }

    pub fn socket_path(&self, topic: &str) -> PathBuf {
        self.dir.join(format!("{}.sock", topic))
    }
}

impl Transport for SocketTransport {
    fn open(&self, topic: &str, options: SubscribeOptions) -> Result<Box<dyn Subscription>> {
        let path = self.socket_path(topic);
        let stream = connect(topic, &path)?;
        let shutdown_handle = stream.try_clone()?;

        let mailbox = Arc::new(Mailbox::new(options.conflate));
        let producer_box = Arc::clone(&mailbox);
        let topic_name = topic.to_string();
        let limit = self.max_message_bytes;
        let producer = thread::Builder::new()
            .name(format!("sub-{}", topic))
            .spawn(move || read_messages(stream, &producer_box, &topic_name, limit))?;

        debug!(topic, path = %path.display(), conflate = options.conflate, "subscribed");
        let subscription = MailboxSubscription::new(mailbox, options.timeout, producer)
            .on_shutdown(move || {
                let _ = shutdown_handle.shutdown(Shutdown::Both);
            });
        Ok(Box::new(subscription))
    }
}

fn connect(topic: &str, path: &Path) -> Result<UnixStream> {
    UnixStream::connect(path).map_err(|e| CpuwatchError::TransportUnavailable {
        topic: topic.to_string(),
        reason: format!("{}: {}", path.display(), e),
    })
}

fn read_messages(stream: UnixStream, mailbox: &Mailbox, topic: &str, limit: usize) {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    while !mailbox.is_closed() {
        line.clear();
        match read_bounded_line(&mut reader, &mut line, limit) {
            Ok(LineRead::Eof) => break,
            Ok(LineRead::Oversized) => {
                warn!(topic, limit, "dropping oversized message");
            }
            Ok(LineRead::Line) => decode_line(&line, mailbox, topic),
            Err(e) => {
                debug!(topic, error = %e, "subscription read ended");
                break;
            }
        }
    }
    if !mailbox.is_closed() {
        warn!(topic, "publisher disconnected");
    }
    mailbox.close();
}

fn decode_line(line: &[u8], mailbox: &Mailbox, topic: &str) {
    let Ok(text) = std::str::from_utf8(line) else {
        warn!(topic, "dropping non-UTF-8 message");
        return;
    };
    if text.trim().is_empty() {
        return;
    }
    match ProcessSnapshot::from_json_line(text) {
        Ok(snapshot) => mailbox.push(snapshot),
        Err(e) => warn!(topic, error = %e, "dropping undecodable message"),
    }
}

#[derive(Debug, PartialEq)]
enum LineRead {
    Line,
    Oversized,
    Eof,
}

/// Reads one newline-terminated line of at most `limit` bytes (excluding
/// the newline) into `buf`. An oversized line is consumed and discarded.
fn read_bounded_line<R: BufRead>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> io::Result<LineRead> {
    let cap = limit as u64 + 1;
    let read = reader.by_ref().take(cap).read_until(b'\n', buf)?;
    if read == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.last() == Some(&b'\n') || read <= limit {
        return Ok(LineRead::Line);
    }

    buf.clear();
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            break;
        }
        match available.iter().position(|b| *b == b'\n') {
            Some(index) => {
                reader.consume(index + 1);
                break;
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
    Ok(LineRead::Oversized)
}
