use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use midir::{Ignore, MidiInput, MidiInputConnection};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::midi::{ControlEvent, FrameParser};

const READ_CHUNK: usize = 256;

enum OpenSource {
    Raw { path: PathBuf, reader: JoinHandle<()> },
    Port { name: String, connection: MidiInputConnection<()> },
}

/// The one control device currently feeding the session. Opening a new
/// source always closes the previous one first, so events are never
/// delivered twice.
pub struct ControlInput {
    events: mpsc::UnboundedSender<ControlEvent>,
    source: Option<OpenSource>,
}

impl ControlInput {
    pub fn new(events: mpsc::UnboundedSender<ControlEvent>) -> Self {
        Self { events, source: None }
    }

    /// Reads a raw MIDI character device such as `/dev/midi1`. Device nodes
    /// and FIFOs are polled on a non-blocking descriptor, so `close()`
    /// releases them at once even while the controller is silent.
    #[cfg(unix)]
    pub async fn open_raw(&mut self, path: &Path) -> anyhow::Result<()> {
        self.close();
        let source = raw::open(path)
            .with_context(|| format!("failed to open MIDI device {}", path.display()))?;
        info!("Opened raw MIDI device: {}", path.display());

        let label = path.display().to_string();
        let events = self.events.clone();
        let reader = match source {
            raw::RawSource::Device(device) => tokio::spawn(pump(device, label, events)),
            raw::RawSource::File(file) => {
                tokio::spawn(pump(tokio::fs::File::from_std(file), label, events))
            }
        };
        self.source = Some(OpenSource::Raw { path: path.to_path_buf(), reader });
        Ok(())
    }

    #[cfg(not(unix))]
    pub async fn open_raw(&mut self, path: &Path) -> anyhow::Result<()> {
        self.close();
        anyhow::bail!("raw MIDI device {} needs a Unix host", path.display())
    }

    /// Connects to a MIDI input port by index.
    pub fn open_port(&mut self, index: usize) -> anyhow::Result<()> {
        self.close();
        let mut midi_input =
            MidiInput::new("kantan-host input").context("failed to create MIDI input")?;
        midi_input.ignore(Ignore::None);

        let ports = midi_input.ports();
        let port = ports
            .get(index)
            .ok_or_else(|| {
                anyhow!("MIDI input port {index} does not exist ({} available)", ports.len())
            })?;
        let name = midi_input.port_name(port).unwrap_or_else(|_| "Unknown".to_string());

        let events = self.events.clone();
        let mut parser = FrameParser::new();
        let connection = midi_input
            .connect(
                port,
                "kantan-host controls",
                move |_, message, _| {
                    for event in parser.feed(message) {
                        let _ = events.send(event);
                    }
                },
                (),
            )
            .map_err(|err| anyhow!("failed to connect to MIDI input {name}: {err}"))?;

        info!("Using MIDI input: {}", name);
        self.source = Some(OpenSource::Port { name, connection });
        Ok(())
    }

    pub fn close(&mut self) {
        match self.source.take() {
            Some(OpenSource::Raw { path, reader }) => {
                reader.abort();
                info!("MIDI device {} closed", path.display());
            }
            Some(OpenSource::Port { name, connection }) => {
                connection.close();
                info!("MIDI input {} closed", name);
            }
            None => {}
        }
    }

    /// Name or path of the open source.
    pub fn current(&self) -> Option<String> {
        match &self.source {
            Some(OpenSource::Raw { path, .. }) => Some(path.display().to_string()),
            Some(OpenSource::Port { name, .. }) => Some(name.clone()),
            None => None,
        }
    }
}

impl Drop for ControlInput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reads `source` until it ends, forwarding parsed Control Change events.
async fn pump<R>(mut source: R, label: String, events: mpsc::UnboundedSender<ControlEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut parser = FrameParser::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match source.read(&mut chunk).await {
            Ok(0) => {
                debug!("{label}: end of stream ({} bytes pending)", parser.pending());
                break;
            }
            Ok(n) => {
                for event in parser.feed(&chunk[..n]) {
                    if events.send(event).is_err() {
                        debug!("{label}: session gone, stopping reader");
                        return;
                    }
                }
            }
            Err(err) => {
                error!("Error reading from MIDI device {label}: {err}");
                break;
            }
        }
    }
}

#[cfg(unix)]
mod raw {
    use std::fs::{File, OpenOptions};
    use std::io::{self, Read};
    use std::os::unix::fs::OpenOptionsExt;
    use std::path::Path;
    use std::pin::Pin;
    use std::task::{ready, Context, Poll};

    use tokio::io::unix::AsyncFd;
    use tokio::io::{AsyncRead, Interest, ReadBuf};

    pub enum RawSource {
        /// Character device or FIFO, readiness driven by the reactor.
        Device(RawDevice),
        /// Regular file, e.g. a captured byte dump. Reads end at EOF.
        File(File),
    }

    pub fn open(path: &Path) -> io::Result<RawSource> {
        let file = OpenOptions::new().read(true).custom_flags(libc::O_NONBLOCK).open(path)?;
        if file.metadata()?.is_file() {
            return Ok(RawSource::File(file));
        }
        let inner = AsyncFd::with_interest(file, Interest::READABLE)?;
        Ok(RawSource::Device(RawDevice { inner }))
    }

    /// Non-blocking device descriptor. Dropping it closes the descriptor.
    pub struct RawDevice {
        inner: AsyncFd<File>,
    }

    impl AsyncRead for RawDevice {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            loop {
                let mut guard = ready!(self.inner.poll_read_ready(cx))?;
                let unfilled = buf.initialize_unfilled();
                match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                    Ok(Ok(len)) => {
                        buf.advance(len);
                        return Poll::Ready(Ok(()));
                    }
                    Ok(Err(err)) => return Poll::Ready(Err(err)),
                    Err(_would_block) => continue,
                }
            }
        }
    }
}

/// Names of the available MIDI input ports, in index order.
pub fn list_input_ports() -> anyhow::Result<Vec<String>> {
    let midi_input =
        MidiInput::new("kantan-host scanner").context("failed to create MIDI input")?;
    Ok(midi_input
        .ports()
        .iter()
        .map(|port| midi_input.port_name(port).unwrap_or_else(|_| "Unknown".to_string()))
        .collect())
}
