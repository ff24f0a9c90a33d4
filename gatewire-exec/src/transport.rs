//! Byte-duplex transports under a gateway.
//!
//! Three concrete flavours share one type: subprocess pipes (popen, and ssh
//! which is just a pipe whose child is the ssh client), TCP sockets, and the
//! worker's own stdio. The transport moves opaque bytes; it never interprets
//! payloads. Reads are exact-or-EOF, writes are complete-or-error, and the
//! writer mutex doubles as the per-gateway write serialisation lock.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use gatewire_proto::{Frame, FrameError};
use thiserror::Error;

/// The byte stream under a gateway failed.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the stream; treat as "peer is gone".
    #[error("transport closed by peer")]
    Eof,
    /// This side already closed the half needed for the operation.
    #[error("transport {0} side already closed")]
    HalfClosed(&'static str),
    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

enum TransportReader {
    Pipe(ChildStdout),
    Tcp(TcpStream),
    File(File),
}

impl Read for TransportReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            TransportReader::Pipe(r) => r.read(buf),
            TransportReader::Tcp(r) => r.read(buf),
            TransportReader::File(r) => r.read(buf),
        }
    }
}

enum TransportWriter {
    Pipe(ChildStdin),
    Tcp(TcpStream),
    File(File),
}

impl Write for TransportWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TransportWriter::Pipe(w) => w.write(buf),
            TransportWriter::Tcp(w) => w.write(buf),
            TransportWriter::File(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TransportWriter::Pipe(w) => w.flush(),
            TransportWriter::Tcp(w) => w.flush(),
            TransportWriter::File(w) => w.flush(),
        }
    }
}

/// A bidirectional byte stream plus the lifecycle handle of the process
/// behind it, if any.
pub struct Transport {
    reader: Mutex<Option<TransportReader>>,
    writer: Mutex<Option<TransportWriter>>,
    child: Option<Mutex<Child>>,
    killed: AtomicBool,
    desc: String,
}

impl Transport {
    /// Spawn `argv` as a child process and talk over its stdin/stdout.
    pub fn spawn(argv: &[String]) -> io::Result<Transport> {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;
        debug!("spawning {:?}", argv);
        let mut child = Command::new(program)
            .args(rest)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;
        let stdin = child.stdin.take().expect("child stdin was piped");
        let stdout = child.stdout.take().expect("child stdout was piped");
        Ok(Transport {
            reader: Mutex::new(Some(TransportReader::Pipe(stdout))),
            writer: Mutex::new(Some(TransportWriter::Pipe(stdin))),
            child: Some(Mutex::new(child)),
            killed: AtomicBool::new(false),
            desc: format!("popen {}", program),
        })
    }

    /// Connect a TCP transport.
    pub fn connect(addr: &str) -> io::Result<Transport> {
        let mut addrs = addr.to_socket_addrs()?;
        let first = addrs
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing"))?;
        let stream = TcpStream::connect(first)?;
        Transport::from_stream(stream)
    }

    /// Wrap an already-connected TCP stream (e.g. an accepted connection).
    pub fn from_stream(stream: TcpStream) -> io::Result<Transport> {
        if let Err(err) = stream.set_nodelay(true) {
            warn!("cannot set TCP_NODELAY: {}", err);
        }
        set_lowdelay(&stream);
        let desc = match stream.peer_addr() {
            Ok(peer) => format!("tcp {}", peer),
            Err(_) => "tcp".to_owned(),
        };
        let reader = stream.try_clone()?;
        Ok(Transport {
            reader: Mutex::new(Some(TransportReader::Tcp(reader))),
            writer: Mutex::new(Some(TransportWriter::Tcp(stream))),
            child: None,
            killed: AtomicBool::new(false),
            desc,
        })
    }

    /// Take over this process' stdin/stdout for framing and re-point the
    /// real descriptors at `/dev/null`, so that stray prints from executed
    /// code cannot corrupt the frame stream.
    pub fn stdio() -> io::Result<Transport> {
        let (reader, writer) = steal_stdio()?;
        Ok(Transport {
            reader: Mutex::new(Some(TransportReader::File(reader))),
            writer: Mutex::new(Some(TransportWriter::File(writer))),
            child: None,
            killed: AtomicBool::new(false),
            desc: "stdio".to_owned(),
        })
    }

    /// Read exactly `buf.len()` bytes.
    pub fn read_exact(&self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut guard = self.reader.lock().expect("Cannot lock transport reader");
        match guard.as_mut() {
            None => Err(TransportError::HalfClosed("read")),
            Some(reader) => reader.read_exact(buf).map_err(|err| {
                if err.kind() == io::ErrorKind::UnexpectedEof {
                    TransportError::Eof
                } else {
                    TransportError::Io(err)
                }
            }),
        }
    }

    /// Read one frame. The read half is held for the whole frame, so frames
    /// from concurrent readers can never interleave.
    pub fn read_frame(&self) -> Result<Frame, FrameError> {
        let mut guard = self.reader.lock().expect("Cannot lock transport reader");
        match guard.as_mut() {
            None => Err(FrameError::Eof),
            Some(reader) => Frame::read_from(reader),
        }
    }

    /// Write all bytes, as one locked (and therefore non-interleaved) write.
    pub fn write_all(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().expect("Cannot lock transport writer");
        match guard.as_mut() {
            None => Err(TransportError::HalfClosed("write")),
            Some(writer) => {
                writer.write_all(bytes)?;
                writer.flush()?;
                Ok(())
            }
        }
    }

    /// Stop reading. Idempotent.
    pub fn close_read(&self) {
        let mut guard = self.reader.lock().expect("Cannot lock transport reader");
        if let Some(TransportReader::Tcp(stream)) = guard.as_ref() {
            let _ = stream.shutdown(Shutdown::Read);
        }
        guard.take();
    }

    /// Half-close the write side so the peer observes EOF. Idempotent.
    ///
    /// TCP streams are shut down but kept, so a later [`Transport::kill`]
    /// can still tear the whole connection down.
    pub fn close_write(&self) {
        let mut guard = self.writer.lock().expect("Cannot lock transport writer");
        match guard.as_ref() {
            Some(TransportWriter::Tcp(stream)) => {
                let _ = stream.shutdown(Shutdown::Write);
            }
            Some(_) => {
                guard.take();
            }
            None => {}
        }
    }

    /// Reap the child process, if this transport owns one.
    pub fn wait(&self) -> io::Result<Option<ExitStatus>> {
        match &self.child {
            None => Ok(None),
            Some(child) => child
                .lock()
                .expect("Cannot lock transport child")
                .wait()
                .map(Some),
        }
    }

    /// Force-terminate the endpoint: kill the child process, or tear down
    /// the socket so the receiver unblocks. Returns whether this call was
    /// the one that did it; later calls are no-ops.
    pub fn kill(&self) -> bool {
        if self.killed.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!("killing transport {}", self.desc);
        match &self.child {
            Some(child) => {
                let _ = child.lock().expect("Cannot lock transport child").kill();
            }
            None => {
                // no process to signal; break the socket under the receiver
                let guard = self.writer.lock().expect("Cannot lock transport writer");
                if let Some(TransportWriter::Tcp(stream)) = guard.as_ref() {
                    let _ = stream.shutdown(Shutdown::Both);
                }
            }
        }
        true
    }

    /// Human-readable transport description, for log lines.
    pub fn describe(&self) -> &str {
        &self.desc
    }
}

/// Ask for low-delay type-of-service; routers may honour it. Failure is a
/// warning, never an error.
fn set_lowdelay(stream: &TcpStream) {
    const IPTOS_LOWDELAY: libc::c_int = 0x10;
    let ret = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_TOS,
            &IPTOS_LOWDELAY as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        warn!(
            "cannot set IP_TOS lowdelay: {}",
            io::Error::last_os_error()
        );
    }
}

/// Duplicate fds 0 and 1 for framing and re-point the originals at
/// `/dev/null`.
fn steal_stdio() -> io::Result<(File, File)> {
    unsafe {
        let in_fd = libc::dup(0);
        if in_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let out_fd = libc::dup(1);
        if out_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let devnull = libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR);
        if devnull < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::dup2(devnull, 0) < 0 || libc::dup2(devnull, 1) < 0 {
            return Err(io::Error::last_os_error());
        }
        libc::close(devnull);
        Ok((File::from_raw_fd(in_fd), File::from_raw_fd(out_fd)))
    }
}
