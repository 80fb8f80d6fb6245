//! Serial-port connector for a USB-attached companion radio.
//!
//! `serialport` is blocking, so each connection gets a reader thread and a
//! writer thread bridged onto the async [`LinkIo`] channels. Both threads end
//! on their own once the link drops its side of the channels.
use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::error::TransportError;
use crate::meshcore::link::{Connector, LinkIo};

const READ_TIMEOUT: Duration = Duration::from_millis(100);

pub struct SerialConnector {
    port: String,
    baud_rate: u32,
}

impl SerialConnector {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
        }
    }
}

impl Connector for SerialConnector {
    async fn connect(&mut self) -> Result<LinkIo, TransportError> {
        debug!(target: "link", "opening serial port {} at {} baud", self.port, self.baud_rate);
        let mut builder = serialport::new(&self.port, self.baud_rate).timeout(READ_TIMEOUT);
        #[cfg(unix)]
        {
            builder = builder
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None);
        }
        let mut port = builder
            .open()
            .map_err(|e| TransportError::Link(format!("failed to open serial port {}: {}", self.port, e)))?;

        // Raise DTR/RTS so boards that gate the UART on them wake up
        let _ = port.write_data_terminal_ready(true);
        let _ = port.write_request_to_send(true);
        sleep(Duration::from_millis(150)).await;

        // Drop boot chatter buffered before we attached
        let mut purge_buf = [0u8; 512];
        if let Ok(available) = port.bytes_to_read() {
            if available > 0 {
                let _ = port.read(&mut purge_buf);
            }
        }

        let mut writer = port
            .try_clone()
            .map_err(|e| TransportError::Link(format!("failed to clone serial port {}: {}", self.port, e)))?;
        let mut reader = port;

        let (in_tx, incoming) = mpsc::unbounded_channel::<std::io::Result<Vec<u8>>>();
        let (outgoing, mut out_rx) = mpsc::unbounded_channel::<Bytes>();

        let name = self.port.clone();
        thread::Builder::new()
            .name("serial-rx".into())
            .spawn(move || {
                let mut buf = [0u8; 512];
                loop {
                    if in_tx.is_closed() {
                        break;
                    }
                    match reader.read(&mut buf) {
                        Ok(0) => continue,
                        Ok(n) => {
                            if in_tx.send(Ok(buf[..n].to_vec())).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!(target: "link", "serial read on {} failed: {}", name, e);
                            let _ = in_tx.send(Err(e));
                            break;
                        }
                    }
                }
                trace!(target: "link", "serial reader for {} stopped", name);
            })
            .map_err(TransportError::Io)?;

        let name = self.port.clone();
        thread::Builder::new()
            .name("serial-tx".into())
            .spawn(move || {
                while let Some(frame) = out_rx.blocking_recv() {
                    if let Err(e) = writer.write_all(&frame).and_then(|_| writer.flush()) {
                        warn!(target: "link", "serial write on {} failed: {}", name, e);
                        break;
                    }
                }
                trace!(target: "link", "serial writer for {} stopped", name);
            })
            .map_err(TransportError::Io)?;

        Ok(LinkIo { incoming, outgoing })
    }
}
