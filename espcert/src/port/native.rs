//! Native serial port bridged into an async byte stream.
//!
//! `serialport` is blocking, so both directions run on dedicated threads.
//! The reader thread forwards chunks over a channel, so the receive loop
//! never blocks a runtime worker while the line is idle. The writer thread
//! drains queued frames; a flush completes once the thread has written
//! everything queued before it.

use {
    crate::{
        error::{Error, Result},
        port::SerialConfig,
    },
    log::{debug, trace},
    serialport::{ClearBuffer, SerialPort},
    std::{
        future::Future,
        io::{self, Read, Write},
        pin::Pin,
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        task::{Context, Poll},
        thread,
        time::Duration,
    },
    tokio::{
        io::{AsyncRead, AsyncWrite, ReadBuf},
        sync::{mpsc, oneshot},
    },
};

/// Chunks buffered between the reader thread and the session.
const CHANNEL_DEPTH: usize = 64;

/// Native serial port usable as a `tokio` stream.
pub struct NativePort {
    port: Box<dyn SerialPort>,
    name: String,
    baud_rate: u32,
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    pending: Vec<u8>,
    pending_pos: usize,
    writer: SerialWriter,
    stop: Arc<AtomicBool>,
}

impl std::fmt::Debug for NativePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativePort")
            .field("name", &self.name)
            .field("baud_rate", &self.baud_rate)
            .finish_non_exhaustive()
    }
}

impl NativePort {
    /// Open a serial port and start its reader thread.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .open()?;
        let reader = port.try_clone()?;
        let writer = SerialWriter::spawn(port.try_clone()?, &config.port_name)?;

        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        thread::Builder::new()
            .name(format!("espcert-rx {}", config.port_name))
            .spawn(move || read_loop(reader, &tx, &thread_stop))
            .map_err(|e| Error::Connection(format!("cannot start reader thread: {e}")))?;

        debug!(
            "Opened {} at {} baud",
            config.port_name, config.baud_rate
        );

        Ok(Self {
            port,
            name: config.port_name.clone(),
            baud_rate: config.baud_rate,
            rx,
            pending: Vec::new(),
            pending_pos: 0,
            writer,
            stop,
        })
    }

    /// Open a serial port with default settings.
    pub fn open_simple(port_name: &str, baud_rate: u32) -> Result<Self> {
        Self::open(&SerialConfig::new(port_name, baud_rate))
    }

    /// Port name/path.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Set DTR (Data Terminal Ready) pin state.
    pub fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("Setting DTR to {level}");
        self.port.write_data_terminal_ready(level)?;
        Ok(())
    }

    /// Set RTS (Request To Send) pin state.
    pub fn set_rts(&mut self, level: bool) -> Result<()> {
        trace!("Setting RTS to {level}");
        self.port.write_request_to_send(level)?;
        Ok(())
    }

    /// Reset the chip into the serial bootloader.
    ///
    /// Uses the usual auto-reset wiring: DTR drives GPIO0 and RTS drives EN,
    /// both inverted.
    pub fn reset_into_bootloader(&mut self) -> Result<()> {
        debug!("Resetting {} into the bootloader", self.name);
        // EN low, GPIO0 high
        self.set_dtr(false)?;
        self.set_rts(true)?;
        thread::sleep(Duration::from_millis(100));

        // EN high, GPIO0 low
        self.set_dtr(true)?;
        self.set_rts(false)?;
        thread::sleep(Duration::from_millis(50));

        // Release GPIO0
        self.set_dtr(false)?;
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

impl Drop for NativePort {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn read_loop(
    mut port: Box<dyn SerialPort>,
    tx: &mpsc::Sender<io::Result<Vec<u8>>>,
    stop: &AtomicBool,
) {
    let mut buf = [0u8; 4096];
    while !stop.load(Ordering::Relaxed) {
        match port.read(&mut buf) {
            Ok(0) => {},
            Ok(n) => {
                if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                    break;
                }
            },
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {
            },
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                break;
            },
        }
    }
    trace!("Serial reader thread exiting");
}

enum WriteOp {
    Data(Vec<u8>),
    Flush(oneshot::Sender<io::Result<()>>),
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "serial writer thread stopped")
}

/// Async writer that hands bytes to a blocking writer thread.
///
/// `poll_write` only queues. The first write error is sticky and reported by
/// every later flush.
pub(crate) struct SerialWriter {
    tx: mpsc::UnboundedSender<WriteOp>,
    flushing: Option<oneshot::Receiver<io::Result<()>>>,
}

impl SerialWriter {
    pub(crate) fn spawn<W>(port: W, name: &str) -> Result<Self>
    where
        W: Write + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        thread::Builder::new()
            .name(format!("espcert-tx {name}"))
            .spawn(move || write_loop(port, rx))
            .map_err(|e| Error::Connection(format!("cannot start writer thread: {e}")))?;
        Ok(Self { tx, flushing: None })
    }
}

fn write_loop<W: Write>(mut port: W, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
    let mut failed: Option<io::Error> = None;

    while let Some(op) = rx.blocking_recv() {
        match op {
            WriteOp::Data(data) => {
                if failed.is_none() {
                    if let Err(e) = port.write_all(&data) {
                        failed = Some(e);
                    }
                }
            },
            WriteOp::Flush(done) => {
                let result = match &failed {
                    Some(e) => Err(io::Error::new(e.kind(), e.to_string())),
                    None => port.flush(),
                };
                let _ = done.send(result);
            },
        }
    }
    trace!("Serial writer thread exiting");
}

impl AsyncWrite for SerialWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.tx.send(WriteOp::Data(data.to_vec())) {
            Ok(()) => Poll::Ready(Ok(data.len())),
            Err(_) => Poll::Ready(Err(broken_pipe())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.flushing.is_none() {
            let (done, wait) = oneshot::channel();
            if this.tx.send(WriteOp::Flush(done)).is_err() {
                return Poll::Ready(Err(broken_pipe()));
            }
            this.flushing = Some(wait);
        }

        let result = match this.flushing.as_mut() {
            Some(wait) => match Pin::new(wait).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => result,
            },
            None => return Poll::Ready(Ok(())),
        };
        this.flushing = None;
        Poll::Ready(result.unwrap_or_else(|_| Err(broken_pipe())))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

impl AsyncRead for NativePort {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.pending_pos >= this.pending.len() {
            match this.rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                // Reader thread gone: end of stream
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(Some(Ok(chunk))) => {
                    this.pending = chunk;
                    this.pending_pos = 0;
                },
            }
        }

        let available = &this.pending[this.pending_pos..];
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        this.pending_pos += n;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for NativePort {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.stop.store(true, Ordering::Relaxed);
        Pin::new(&mut this.writer).poll_shutdown(cx)
    }
}
