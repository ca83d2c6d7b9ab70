//! libpcap capture files.
//!
//! Files use the classic format: a 24-byte global header followed by one
//! 16-byte record header per frame. Fields are written little-endian;
//! the reader accepts both byte orders.

use std::fs::File;
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::event::HandlerEvent;
use crate::frame::Frame;
use crate::handler::{HandlerCore, TrafficHandler};
use crate::worker::Worker;

pub const MAGIC: u32 = 0xa1b2c3d4;
pub const VERSION_MAJOR: u16 = 2;
pub const VERSION_MINOR: u16 = 4;
pub const DEFAULT_SNAPLEN: u32 = 65535;
/// Link type of Ethernet captures.
pub const LINKTYPE_ETHERNET: u32 = 1;

const GLOBAL_HEADER_LENGTH: usize = 24;
const RECORD_HEADER_LENGTH: usize = 16;
const VIEWER_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// The global header of a capture file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcapHeader {
    pub version_major: u16,
    pub version_minor: u16,
    pub snaplen: u32,
    pub link_type: u32,
}

impl Default for PcapHeader {
    fn default() -> Self {
        Self {
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            snaplen: DEFAULT_SNAPLEN,
            link_type: LINKTYPE_ETHERNET,
        }
    }
}

/// One captured frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcapRecord {
    pub timestamp: SystemTime,
    /// Length of the frame on the wire, which may exceed `data.len()`
    pub original_length: u32,
    pub data: Vec<u8>,
}

/// Writes a capture file to any byte sink.
#[derive(Debug)]
pub struct PcapWriter<W: Write> {
    writer: W,
    snaplen: u32,
}

impl<W: Write> PcapWriter<W> {
    /// Writes the global header with the default snap length and Ethernet link type.
    pub fn new(writer: W) -> io::Result<Self> {
        Self::with_header(writer, PcapHeader::default())
    }

    pub fn with_header(mut writer: W, header: PcapHeader) -> io::Result<Self> {
        let mut bytes = Vec::with_capacity(GLOBAL_HEADER_LENGTH);
        bytes.extend_from_slice(&MAGIC.to_le_bytes());
        bytes.extend_from_slice(&header.version_major.to_le_bytes());
        bytes.extend_from_slice(&header.version_minor.to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes()); // thiszone
        bytes.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
        bytes.extend_from_slice(&header.snaplen.to_le_bytes());
        bytes.extend_from_slice(&header.link_type.to_le_bytes());
        writer.write_all(&bytes)?;
        Ok(Self {
            writer,
            snaplen: header.snaplen,
        })
    }

    /// Appends one frame, truncated to the snap length.
    pub fn write_record(&mut self, timestamp: SystemTime, data: &[u8]) -> io::Result<()> {
        let since_epoch = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
        let captured = data.len().min(self.snaplen as usize);
        let mut header = [0u8; RECORD_HEADER_LENGTH];
        header[0..4].copy_from_slice(&(since_epoch.as_secs() as u32).to_le_bytes());
        header[4..8].copy_from_slice(&since_epoch.subsec_micros().to_le_bytes());
        header[8..12].copy_from_slice(&(captured as u32).to_le_bytes());
        header[12..16].copy_from_slice(&(data.len() as u32).to_le_bytes());
        self.writer.write_all(&header)?;
        self.writer.write_all(&data[..captured])
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Reads a capture file record by record.
#[derive(Debug)]
pub struct PcapReader<R: Read> {
    reader: R,
    header: PcapHeader,
    big_endian: bool,
}

impl<R: Read> PcapReader<R> {
    /// Reads and checks the global header.
    ///
    /// # Returns
    /// - `Ok(PcapReader)` - Positioned at the first record
    /// - `Err(io::Error)` - `InvalidData` for an unknown magic number, or the read error
    pub fn new(mut reader: R) -> io::Result<Self> {
        let mut bytes = [0u8; GLOBAL_HEADER_LENGTH];
        reader.read_exact(&mut bytes)?;
        let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
        let big_endian = if magic == MAGIC.to_le_bytes() {
            false
        } else if magic == MAGIC.to_be_bytes() {
            true
        } else {
            return Err(io::Error::new(ErrorKind::InvalidData, "not a pcap file"));
        };
        let u16_at = |at: usize| {
            let field = [bytes[at], bytes[at + 1]];
            if big_endian { u16::from_be_bytes(field) } else { u16::from_le_bytes(field) }
        };
        let header = PcapHeader {
            version_major: u16_at(4),
            version_minor: u16_at(6),
            snaplen: read_u32(&bytes[16..20], big_endian),
            link_type: read_u32(&bytes[20..24], big_endian),
        };
        Ok(Self {
            reader,
            header,
            big_endian,
        })
    }

    pub fn header(&self) -> &PcapHeader {
        &self.header
    }

    /// Reads the next record.
    ///
    /// # Returns
    /// - `Ok(Some(record))` - The next record
    /// - `Ok(None)` - At the end of the file
    /// - `Err(io::Error)` - If a record is truncated or reading fails
    pub fn next_record(&mut self) -> io::Result<Option<PcapRecord>> {
        let mut header = [0u8; RECORD_HEADER_LENGTH];
        let mut filled = 0;
        while filled < header.len() {
            match self.reader.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated record header")),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        let seconds = read_u32(&header[0..4], self.big_endian);
        let micros = read_u32(&header[4..8], self.big_endian);
        let captured = read_u32(&header[8..12], self.big_endian);
        let original_length = read_u32(&header[12..16], self.big_endian);
        if captured > self.header.snaplen.max(DEFAULT_SNAPLEN) {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("record of {} bytes exceeds the snap length", captured),
            ));
        }
        let mut data = vec![0u8; captured as usize];
        self.reader.read_exact(&mut data)?;
        Ok(Some(PcapRecord {
            timestamp: UNIX_EPOCH + Duration::from_secs(u64::from(seconds)) + Duration::from_micros(u64::from(micros)),
            original_length,
            data,
        }))
    }
}

impl<R: Read> Iterator for PcapReader<R> {
    type Item = io::Result<PcapRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

fn read_u32(bytes: &[u8], big_endian: bool) -> u32 {
    let field = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if big_endian {
        u32::from_be_bytes(field)
    } else {
        u32::from_le_bytes(field)
    }
}

type BoxedWriter = PcapWriter<Box<dyn Write + Send>>;

struct Viewer {
    child: Arc<Mutex<Child>>,
    writer: BoxedWriter,
    watcher: Worker,
    exited: Arc<AtomicBool>,
}

/// Handler recording every frame it sees in libpcap format.
///
/// Frames can go to a file, to any writer, and to an external viewer
/// process (e.g. `wireshark -k -i -`) reading the capture from its stdin.
/// When the viewer exits, [`HandlerEvent::ProcessExited`] is published.
/// Frames are passed on to the output unchanged.
pub struct LibCapDumper {
    core: HandlerCore,
    log: Mutex<Option<BoxedWriter>>,
    viewer: Mutex<Option<Viewer>>,
}

impl Default for LibCapDumper {
    fn default() -> Self {
        Self::new()
    }
}

impl LibCapDumper {
    pub fn new() -> Self {
        Self::with_name("libcap-dumper")
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            core: HandlerCore::new(name),
            log: Mutex::new(None),
            viewer: Mutex::new(None),
        }
    }

    /// Starts writing a capture file at `path`, replacing any current log.
    pub fn start_logging(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)?;
        self.start_logging_to(Box::new(BufWriter::new(file)))?;
        info!(handler = %self.core.name(), path = %path.display(), "Capture logging started");
        Ok(())
    }

    /// Starts writing a capture to `writer`, replacing any current log.
    pub fn start_logging_to(&self, writer: Box<dyn Write + Send>) -> Result<()> {
        let writer = PcapWriter::new(writer)?;
        let previous = self.log.lock().replace(writer);
        if let Some(mut previous) = previous {
            previous.flush()?;
        }
        Ok(())
    }

    /// Flushes and closes the current log.
    pub fn stop_logging(&self) -> Result<()> {
        let log = self.log.lock().take();
        if let Some(mut log) = log {
            log.flush()?;
            debug!(handler = %self.core.name(), "Capture logging stopped");
        }
        Ok(())
    }

    pub fn is_logging(&self) -> bool {
        self.log.lock().is_some()
    }

    /// Spawns `command` and streams the capture to its stdin.
    ///
    /// A running viewer is stopped first.
    pub fn start_viewer(&self, command: &str, args: &[&str]) -> Result<()> {
        self.stop_viewer();
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(ErrorKind::BrokenPipe, "viewer has no stdin"))?;
        let writer = PcapWriter::new(Box::new(stdin) as Box<dyn Write + Send>)?;

        let child = Arc::new(Mutex::new(child));
        let exited = Arc::new(AtomicBool::new(false));
        let watcher = {
            let child = child.clone();
            let exited = exited.clone();
            let events = self.core.events().clone();
            let handler = self.core.name().to_string();
            Worker::spawn(format!("{}-viewer", handler), move |signal| {
                while !signal.wait_timeout(VIEWER_POLL_INTERVAL) {
                    let status = child.lock().try_wait();
                    match status {
                        Ok(Some(status)) => {
                            if !exited.swap(true, Ordering::SeqCst) {
                                info!(handler = %handler, status = ?status.code(), "Viewer exited");
                                events.publish(HandlerEvent::ProcessExited {
                                    handler: handler.clone(),
                                    status: status.code(),
                                });
                            }
                            break;
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(handler = %handler, error = %err, "Cannot poll viewer");
                            break;
                        }
                    }
                }
            })?
        };
        info!(handler = %self.core.name(), command = %command, "Viewer started");
        *self.viewer.lock() = Some(Viewer {
            child,
            writer,
            watcher,
            exited,
        });
        Ok(())
    }

    /// Closes the viewer's stdin, kills it, and reports its exit.
    pub fn stop_viewer(&self) {
        let viewer = self.viewer.lock().take();
        let Some(Viewer {
            child,
            writer,
            mut watcher,
            exited,
        }) = viewer
        else {
            return;
        };
        watcher.stop_and_join();
        drop(writer);

        let mut child = child.lock();
        let status = match child.try_wait() {
            Ok(Some(status)) => Some(status),
            _ => {
                if let Err(err) = child.kill() {
                    debug!(handler = %self.core.name(), error = %err, "Viewer already gone");
                }
                child.wait().ok()
            }
        };
        if !exited.swap(true, Ordering::SeqCst) {
            self.core.events().publish(HandlerEvent::ProcessExited {
                handler: self.core.name().to_string(),
                status: status.and_then(|status| status.code()),
            });
        }
    }

    pub fn has_viewer(&self) -> bool {
        self.viewer.lock().is_some()
    }

    fn record(&self, timestamp: SystemTime, bytes: &[u8]) -> Result<()> {
        if let Some(log) = self.log.lock().as_mut() {
            log.write_record(timestamp, bytes)?;
        }
        let failed = {
            let mut viewer = self.viewer.lock();
            match viewer.as_mut() {
                Some(viewer) => viewer.writer.write_record(timestamp, bytes).and_then(|()| viewer.writer.flush()).err(),
                None => None,
            }
        };
        if let Some(err) = failed {
            warn!(handler = %self.core.name(), error = %err, "Viewer stopped reading");
            self.stop_viewer();
        }
        Ok(())
    }
}

impl TrafficHandler for LibCapDumper {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn handle_traffic(&self, frame: Frame) -> Result<()> {
        let timestamp = match &frame {
            Frame::TrafficDescription(description) => description.timestamp,
            _ => SystemTime::now(),
        };
        self.record(timestamp, &frame.to_bytes())?;
        self.core.notify_next(frame);
        Ok(())
    }

    fn on_stop(&self) {
        if let Err(err) = self.stop_logging() {
            warn!(handler = %self.core.name(), error = %err, "Flushing capture log failed");
        }
        self.stop_viewer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::TrafficDescriptionFrame;
    use std::io::Cursor;

    /// A `Write` whose contents outlive the boxed writer.
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_writer_and_reader_agree() {
        let mut writer = PcapWriter::new(Vec::new()).unwrap();
        let stamp = UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_000);
        writer.write_record(stamp, &[1, 2, 3, 4]).unwrap();
        writer.write_record(stamp, &[5]).unwrap();
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), 24 + 16 + 4 + 16 + 1);

        let mut reader = PcapReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(*reader.header(), PcapHeader::default());
        let first = reader.next_record().unwrap().unwrap();
        assert_eq!(first.timestamp, stamp);
        assert_eq!(first.data, vec![1, 2, 3, 4]);
        assert_eq!(reader.by_ref().count(), 1);
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_snaplen_truncates_but_keeps_length() {
        let header = PcapHeader {
            snaplen: 4,
            ..PcapHeader::default()
        };
        let mut writer = PcapWriter::with_header(Vec::new(), header).unwrap();
        writer.write_record(SystemTime::now(), &[9; 10]).unwrap();
        let record = PcapReader::new(Cursor::new(writer.into_inner()))
            .unwrap()
            .next_record()
            .unwrap()
            .unwrap();
        assert_eq!(record.data.len(), 4);
        assert_eq!(record.original_length, 10);
    }

    #[test]
    fn test_reader_rejects_garbage_and_truncation() {
        assert!(PcapReader::new(Cursor::new(vec![0u8; 24])).is_err());

        let mut writer = PcapWriter::new(Vec::new()).unwrap();
        writer.write_record(SystemTime::now(), &[1, 2, 3]).unwrap();
        let mut bytes = writer.into_inner();
        bytes.truncate(bytes.len() - 1);
        let mut reader = PcapReader::new(Cursor::new(bytes)).unwrap();
        assert!(reader.next_record().is_err());
    }

    #[test]
    fn test_dumper_uses_description_timestamp_and_passes_on() {
        let buffer = SharedBuffer::default();
        let dumper = LibCapDumper::new();
        dumper.start_logging_to(Box::new(buffer.clone())).unwrap();
        dumper.start().unwrap();

        let mut description = TrafficDescriptionFrame::new("eth0", Frame::raw(&[0xab; 20]));
        description.timestamp = UNIX_EPOCH + Duration::from_secs(42);
        dumper.push_traffic(Frame::TrafficDescription(description));
        dumper.stop().unwrap();
        assert!(!dumper.is_logging());

        let bytes = buffer.0.lock().clone();
        let records: Vec<PcapRecord> = PcapReader::new(Cursor::new(bytes))
            .unwrap()
            .collect::<io::Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp, UNIX_EPOCH + Duration::from_secs(42));
        assert_eq!(records[0].data, vec![0xab; 20]);
    }

    #[cfg(unix)]
    #[test]
    fn test_viewer_exit_is_reported() {
        let dumper = LibCapDumper::new();
        let mut events = dumper.core().events().subscribe();
        dumper.start_viewer("sh", &["-c", "exit 3"]).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let event = loop {
            match events.try_recv() {
                Ok(event) => break event,
                Err(_) => {
                    assert!(std::time::Instant::now() < deadline, "no exit reported");
                    std::thread::sleep(Duration::from_millis(20));
                }
            }
        };
        assert_eq!(
            event,
            HandlerEvent::ProcessExited {
                handler: "libcap-dumper".into(),
                status: Some(3)
            }
        );
        dumper.stop_viewer();
        assert!(events.try_recv().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_viewer_receives_stream_until_stopped() {
        let dumper = LibCapDumper::new();
        dumper.start_viewer("cat", &[]).unwrap();
        dumper.start().unwrap();
        dumper.push_traffic(Frame::raw(&[1, 2, 3]));
        assert!(dumper.has_viewer());
        dumper.stop().unwrap();
        assert!(!dumper.has_viewer());
    }
}
