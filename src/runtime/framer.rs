//! Length-prefixed message framing over a byte stream.
//!
//! Each stream connection owns one `StreamFramer`. The inbound half
//! reassembles frames from reads of arbitrary size: a single read may hold
//! the tail of one message and the heads of several more, or only a few
//! bytes of a header. The outbound half is a FIFO of frames of which only
//! the head may be partially written; `drain` resumes it wherever the
//! previous write stopped.
//!
//! The framer is generic over `Read`/`Write` so that the event loop can
//! drive it with a socket and tests can drive it with scripted streams.

use crate::runtime::header::{Frame, MessageHeader, HEADER_LEN};
use bytes::BytesMut;
use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};
use thiserror::Error;
use tracing::{trace, warn};

/// Size of the scratch buffer used for one socket read.
pub const READ_CHUNK: usize = 64 * 1024;

/// Errors that end a connection's inbound side.
#[derive(Debug, Error)]
pub enum FrameError {
    /// End of stream or connection reset by the peer.
    #[error("connection closed by peer")]
    PeerClosed,
    /// A header announced a length outside `16..=max`.
    #[error("invalid message length {length} (max {max})")]
    InvalidLength { length: i32, max: usize },
    /// Any other read failure; the connection is torn down.
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

/// How a failed read should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFault {
    /// Would block: wait for the next readiness event.
    TransientRetry,
    /// Interrupted system call: retry right away.
    Interrupted,
    /// Spurious `EFAULT` seen under heavy load: retry right away.
    RetryableFault,
    /// Reset by peer: close the connection.
    PeerClosed,
    /// Anything else.
    Other,
}

pub fn classify_read_error(err: &io::Error) -> ReadFault {
    if err.raw_os_error() == Some(libc::EFAULT) {
        return ReadFault::RetryableFault;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ReadFault::TransientRetry,
        io::ErrorKind::Interrupted => ReadFault::Interrupted,
        io::ErrorKind::ConnectionReset => ReadFault::PeerClosed,
        _ => ReadFault::Other,
    }
}

/// How many reads one call to `read_from` may issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Read until the socket would block (edge-triggered readiness).
    UntilWouldBlock,
    /// Issue a single read (level-triggered readiness).
    Once,
}

/// Outcome of a successful `read_from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The socket has no more data; wait for readiness.
    WouldBlock,
    /// One read was issued in `ReadMode::Once`; more data may remain.
    Partial,
}

pub struct StreamFramer {
    max_frame_len: usize,
    /// Bytes received so far toward the current message, header included.
    received: usize,
    header_buf: [u8; HEADER_LEN],
    header: Option<MessageHeader>,
    body: BytesMut,
    read_buf: Box<[u8]>,
    outgoing: VecDeque<Frame>,
    /// Bytes of the head of `outgoing` already written.
    bytes_sent: usize,
}

impl StreamFramer {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            received: 0,
            header_buf: [0u8; HEADER_LEN],
            header: None,
            body: BytesMut::new(),
            read_buf: vec![0u8; READ_CHUNK].into_boxed_slice(),
            outgoing: VecDeque::new(),
            bytes_sent: 0,
        }
    }

    /// Number of frames waiting to be transmitted.
    pub fn pending(&self) -> usize {
        self.outgoing.len()
    }

    /// Consume newly read bytes, calling `deliver` once per completed frame.
    ///
    /// All of `data` is consumed on success; the return value is its length.
    pub fn feed<F>(&mut self, mut data: &[u8], mut deliver: F) -> Result<usize, FrameError>
    where
        F: FnMut(Frame),
    {
        let consumed = data.len();
        while !data.is_empty() {
            let header = match self.header {
                Some(header) => header,
                None => {
                    let n = (HEADER_LEN - self.received).min(data.len());
                    self.header_buf[self.received..self.received + n].copy_from_slice(&data[..n]);
                    self.received += n;
                    data = &data[n..];
                    if self.received < HEADER_LEN {
                        break;
                    }
                    self.start_body()?
                }
            };

            let needed = header.length as usize - self.received;
            let n = needed.min(data.len());
            self.body.extend_from_slice(&data[..n]);
            self.received += n;
            data = &data[n..];
            if n < needed {
                trace!(
                    have = self.received,
                    length = header.length,
                    "Incomplete message"
                );
                break;
            }
            self.complete(header, &mut deliver);
        }
        Ok(consumed)
    }

    /// Decode and validate the just-completed header.
    fn start_body(&mut self) -> Result<MessageHeader, FrameError> {
        let header = MessageHeader::decode(&self.header_buf).unwrap_or_default();
        if header.length < HEADER_LEN as i32 || header.length as usize > self.max_frame_len {
            return Err(FrameError::InvalidLength {
                length: header.length,
                max: self.max_frame_len,
            });
        }
        self.body.reserve(header.body_len());
        self.header = Some(header);
        Ok(header)
    }

    fn complete<F: FnMut(Frame)>(&mut self, header: MessageHeader, deliver: &mut F) {
        trace!(
            message_id = header.message_id,
            length = header.length,
            "Message received"
        );
        let body = self.body.split().freeze();
        self.header = None;
        self.received = 0;
        deliver(Frame { header, body });
    }

    /// Read from `src` and feed the bytes, delivering completed frames.
    pub fn read_from<R, F>(
        &mut self,
        src: &mut R,
        mode: ReadMode,
        mut deliver: F,
    ) -> Result<ReadStatus, FrameError>
    where
        R: Read,
        F: FnMut(Frame),
    {
        let mut buf = std::mem::take(&mut self.read_buf);
        let result = loop {
            match src.read(&mut buf) {
                Ok(0) => break Err(FrameError::PeerClosed),
                Ok(n) => {
                    if let Err(e) = self.feed(&buf[..n], &mut deliver) {
                        break Err(e);
                    }
                    if mode == ReadMode::Once {
                        break Ok(ReadStatus::Partial);
                    }
                }
                Err(e) => match classify_read_error(&e) {
                    ReadFault::TransientRetry => break Ok(ReadStatus::WouldBlock),
                    ReadFault::Interrupted => continue,
                    ReadFault::RetryableFault => {
                        warn!("Stream read retrying after EFAULT");
                        continue;
                    }
                    ReadFault::PeerClosed => break Err(FrameError::PeerClosed),
                    ReadFault::Other => break Err(FrameError::Io(e)),
                },
            }
        };
        self.read_buf = buf;
        result
    }

    /// Queue a frame for transmission.
    ///
    /// If nothing was queued before, transmission starts immediately.
    /// Returns whether the frame was completely written.
    pub fn enqueue<W: Write>(&mut self, dst: &mut W, frame: Frame) -> io::Result<bool> {
        self.outgoing.push_back(frame);
        if self.outgoing.len() > 1 {
            return Ok(false);
        }
        self.drain(dst)
    }

    /// Write as much queued data as `dst` accepts.
    ///
    /// Returns `true` once the FIFO is empty and `false` if the stream backed
    /// up. A peer that has gone away (broken pipe, reset, zero-length write)
    /// does not fail the call: the head frame is counted as sent so the FIFO
    /// keeps moving, and the read side reports the closed connection.
    pub fn drain<W: Write>(&mut self, dst: &mut W) -> io::Result<bool> {
        loop {
            let Some(head) = self.outgoing.front() else {
                return Ok(true);
            };
            let total = head.len();
            let result = if self.bytes_sent < HEADER_LEN {
                let encoded = head.header.encode();
                let slices = [
                    IoSlice::new(&encoded[self.bytes_sent..]),
                    IoSlice::new(&head.body),
                ];
                dst.write_vectored(&slices)
            } else {
                dst.write(&head.body[self.bytes_sent - HEADER_LEN..])
            };

            match result {
                Ok(0) => {
                    warn!(
                        message_id = head.header.message_id,
                        "Stream write returned 0, dropping message"
                    );
                    self.bytes_sent = total;
                }
                Ok(n) => self.bytes_sent += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    // Preserved behaviour: the peer is gone, count the message as
                    // sent rather than failing mid-stream.
                    warn!(
                        message_id = head.header.message_id,
                        error = %e,
                        "Peer gone during send, dropping message"
                    );
                    self.bytes_sent = total;
                }
                Err(e) => return Err(e),
            }

            if self.bytes_sent < total {
                continue;
            }
            trace!(
                message_id = head.header.message_id,
                remaining = self.outgoing.len() - 1,
                "Finished sending message"
            );
            self.bytes_sent = 0;
            self.outgoing.pop_front();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::Bytes;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const MAX: usize = 16 * 1024 * 1024;

    pub(crate) fn frame(length: i32, message_id: u32) -> Frame {
        let body: Vec<u8> = (0..(length as usize - HEADER_LEN))
            .map(|i| (i as u32).wrapping_mul(31).wrapping_add(message_id) as u8)
            .collect();
        Frame {
            header: MessageHeader {
                length,
                issue_time: 1000 + message_id,
                server_id: 2,
                message_id,
            },
            body: Bytes::from(body),
        }
    }

    /// Writer that accepts at most `limit` bytes per call and reports
    /// would-block on every other call.
    pub(crate) struct ChokedWriter {
        pub(crate) wire: Vec<u8>,
        limit: usize,
        block_next: bool,
    }

    impl ChokedWriter {
        pub(crate) fn new(limit: usize) -> Self {
            Self {
                wire: Vec::new(),
                limit,
                block_next: false,
            }
        }
    }

    impl Write for ChokedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.block_next {
                self.block_next = false;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.block_next = true;
            let n = buf.len().min(self.limit);
            self.wire.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Reader that replays scripted results.
    struct ScriptedReader {
        script: VecDeque<io::Result<Vec<u8>>>,
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.script.pop_front() {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    fn feed_all(framer: &mut StreamFramer, chunks: &[&[u8]]) -> Vec<Frame> {
        let mut out = Vec::new();
        for chunk in chunks {
            framer.feed(chunk, |f| out.push(f)).unwrap();
        }
        out
    }

    #[test]
    fn test_feed_three_chunks_one_message() {
        let original = frame(500, 9);
        let wire = original.to_vec();
        let mut framer = StreamFramer::new(MAX);
        let mut delivered = Vec::new();

        framer.feed(&wire[..4], |f| delivered.push(f)).unwrap();
        framer.feed(&wire[4..304], |f| delivered.push(f)).unwrap();
        assert!(delivered.is_empty());
        assert_eq!(framer.received, 304);
        framer.feed(&wire[304..], |f| delivered.push(f)).unwrap();

        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].header.length, 500);
        assert_eq!(delivered[0], original);
        assert_eq!(framer.received, 0);
    }

    #[test]
    fn test_feed_one_byte_at_a_time() {
        let original = frame(77, 1);
        let wire = original.to_vec();
        let mut framer = StreamFramer::new(MAX);
        let chunks: Vec<&[u8]> = wire.chunks(1).collect();
        let delivered = feed_all(&mut framer, &chunks);
        assert_eq!(delivered, vec![original]);
    }

    #[test]
    fn test_feed_random_splits() {
        let mut rng = StdRng::seed_from_u64(42);
        for round in 0..50 {
            let original = frame(rng.gen_range(16..5000), round);
            let wire = original.to_vec();
            let mut cuts: Vec<usize> = (0..rng.gen_range(0..10))
                .map(|_| rng.gen_range(0..=wire.len()))
                .collect();
            cuts.sort_unstable();
            let mut chunks = Vec::new();
            let mut start = 0;
            for cut in cuts {
                chunks.push(&wire[start..cut]);
                start = cut;
            }
            chunks.push(&wire[start..]);

            let mut framer = StreamFramer::new(MAX);
            assert_eq!(feed_all(&mut framer, &chunks), vec![original]);
        }
    }

    #[test]
    fn test_feed_tail_and_several_heads() {
        let frames = [frame(40, 1), frame(16, 2), frame(100, 3), frame(30, 4)];
        let mut wire = Vec::new();
        for f in &frames {
            wire.extend_from_slice(&f.to_vec());
        }
        // First read ends inside message 1; second covers its tail, all of
        // messages 2 and 3 and the first bytes of message 4's header.
        let split_a = 25;
        let split_b = 40 + 16 + 100 + 3;
        let mut framer = StreamFramer::new(MAX);
        let delivered = feed_all(
            &mut framer,
            &[&wire[..split_a], &wire[split_a..split_b], &wire[split_b..]],
        );
        assert_eq!(delivered, frames.to_vec());
    }

    #[test]
    fn test_feed_header_only_message() {
        let mut framer = StreamFramer::new(MAX);
        let original = frame(16, 5);
        let delivered = feed_all(&mut framer, &[&original.to_vec()]);
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].body.is_empty());
    }

    #[test]
    fn test_feed_rejects_bad_lengths() {
        let mut framer = StreamFramer::new(1024);
        let header = MessageHeader {
            length: 8,
            ..Default::default()
        };
        assert!(matches!(
            framer.feed(&header.encode(), |_| {}),
            Err(FrameError::InvalidLength { length: 8, .. })
        ));

        let mut framer = StreamFramer::new(1024);
        let header = MessageHeader {
            length: 2048,
            ..Default::default()
        };
        assert!(matches!(
            framer.feed(&header.encode(), |_| {}),
            Err(FrameError::InvalidLength { length: 2048, .. })
        ));
    }

    #[test]
    fn test_enqueue_drains_immediately_when_idle() {
        let mut framer = StreamFramer::new(MAX);
        let mut wire: Vec<u8> = Vec::new();
        assert!(framer.enqueue(&mut wire, frame(64, 1)).unwrap());
        assert_eq!(framer.pending(), 0);
        assert_eq!(wire, frame(64, 1).to_vec());
    }

    #[test]
    fn test_partial_drain_preserves_order() {
        let frames = [frame(300, 1), frame(16, 2), frame(1000, 3)];
        let mut framer = StreamFramer::new(MAX);
        let mut writer = ChokedWriter::new(7);

        let mut sent = Vec::new();
        for f in &frames {
            sent.push(framer.enqueue(&mut writer, f.clone()).unwrap());
        }
        assert_eq!(sent, vec![false, false, false]);
        assert_eq!(framer.pending(), 3);

        let mut calls = 0;
        while !framer.drain(&mut writer).unwrap() {
            calls += 1;
            assert!(calls < 10_000, "drain made no progress");
        }
        assert_eq!(framer.pending(), 0);

        let expected: Vec<u8> = frames.iter().flat_map(|f| f.to_vec()).collect();
        assert_eq!(writer.wire, expected);

        // The receiving side sees all three, in order, exactly once.
        let mut receiver = StreamFramer::new(MAX);
        let delivered = feed_all(&mut receiver, &[&writer.wire]);
        assert_eq!(delivered, frames.to_vec());
    }

    #[test]
    fn test_interleaved_enqueue_and_drain() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut framer = StreamFramer::new(MAX);
        let mut writer = ChokedWriter::new(13);
        let mut expected = Vec::new();
        for id in 0..40 {
            let f = frame(rng.gen_range(16..400), id);
            expected.extend_from_slice(&f.to_vec());
            framer.enqueue(&mut writer, f).unwrap();
            if rng.gen_bool(0.5) {
                framer.drain(&mut writer).unwrap();
            }
        }
        while !framer.drain(&mut writer).unwrap() {}
        assert_eq!(writer.wire, expected);
    }

    #[test]
    fn test_broken_pipe_advances_fifo() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut framer = StreamFramer::new(MAX);
        assert!(framer.enqueue(&mut Broken, frame(100, 1)).unwrap());
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_unexpected_write_error_is_returned() {
        struct Denied;
        impl Write for Denied {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::PermissionDenied.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut framer = StreamFramer::new(MAX);
        assert!(framer.enqueue(&mut Denied, frame(100, 1)).is_err());
        assert_eq!(framer.pending(), 1);
    }

    #[test]
    fn test_read_from_retries_efault_and_stops_on_would_block() {
        let wire = frame(200, 3).to_vec();
        let mut reader = ScriptedReader {
            script: VecDeque::from(vec![
                Ok(wire[..50].to_vec()),
                Err(io::Error::from_raw_os_error(libc::EFAULT)),
                Err(io::ErrorKind::Interrupted.into()),
                Ok(wire[50..].to_vec()),
            ]),
        };
        let mut framer = StreamFramer::new(MAX);
        let mut delivered = Vec::new();
        let status = framer
            .read_from(&mut reader, ReadMode::UntilWouldBlock, |f| delivered.push(f))
            .unwrap();
        assert_eq!(status, ReadStatus::WouldBlock);
        assert_eq!(delivered, vec![frame(200, 3)]);
    }

    #[test]
    fn test_read_once_issues_single_read() {
        let wire = frame(40, 1).to_vec();
        let mut reader = ScriptedReader {
            script: VecDeque::from(vec![Ok(wire[..10].to_vec()), Ok(wire[10..].to_vec())]),
        };
        let mut framer = StreamFramer::new(MAX);
        let mut count = 0;
        let status = framer
            .read_from(&mut reader, ReadMode::Once, |_| count += 1)
            .unwrap();
        assert_eq!(status, ReadStatus::Partial);
        assert_eq!(count, 0);
        framer
            .read_from(&mut reader, ReadMode::Once, |_| count += 1)
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_read_from_reports_peer_close() {
        let mut eof = ScriptedReader {
            script: VecDeque::from(vec![Ok(Vec::new())]),
        };
        let mut framer = StreamFramer::new(MAX);
        assert!(matches!(
            framer.read_from(&mut eof, ReadMode::UntilWouldBlock, |_| {}),
            Err(FrameError::PeerClosed)
        ));

        let mut reset = ScriptedReader {
            script: VecDeque::from(vec![Err(io::ErrorKind::ConnectionReset.into())]),
        };
        assert!(matches!(
            framer.read_from(&mut reset, ReadMode::UntilWouldBlock, |_| {}),
            Err(FrameError::PeerClosed)
        ));
    }

    #[test]
    fn test_classify_read_error() {
        assert_eq!(
            classify_read_error(&io::ErrorKind::WouldBlock.into()),
            ReadFault::TransientRetry
        );
        assert_eq!(
            classify_read_error(&io::Error::from_raw_os_error(libc::EFAULT)),
            ReadFault::RetryableFault
        );
        assert_eq!(
            classify_read_error(&io::ErrorKind::ConnectionReset.into()),
            ReadFault::PeerClosed
        );
        assert_eq!(
            classify_read_error(&io::ErrorKind::PermissionDenied.into()),
            ReadFault::Other
        );
    }
}
