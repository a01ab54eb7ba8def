//! Gateway (spec section 4.4): bridges a serial GNSS receiver to the Caster over TCP.
//! One activity reads NMEA lines off the serial port and forwards GGA fixes upstream at
//! a bounded cadence; the other reads the caster's chunked RTCM3 body and writes decoded
//! frames to the serial port. Grounded in `examples/original_source/client_ntrip.py`'s
//! `periodic_gga_sender`/`serial_reader`/`rtcm_gateway`/`run_gateway`, restructured as two
//! cooperating futures the way the teacher crate's `src/bin/server.rs` combines serial
//! and network I/O with `futures::select!`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::chunked::{Chunk, ChunkedReader};
use crate::config::Config;
use crate::error::RelayError;
use crate::rtcm::Framer;

const DEFAULT_BAUD_RATE: u32 = 115_200;
const GGA_INTERVAL: Duration = Duration::from_secs(60);
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

fn open_serial(path: &str, baud: u32) -> Result<SerialStream, RelayError> {
    tokio_serial::new(path, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .timeout(Duration::from_secs(1))
        .open_native_async()
        .map_err(|e| RelayError::SerialIo(std::io::Error::new(std::io::ErrorKind::Other, e)))
}

/// Best-effort capture of every NMEA sentence the serial port produces, written to
/// `logs/LOG<ddmmyy-HHMMSS>.txt`, per spec section 6. A write failure is logged and
/// otherwise ignored: losing the capture log must never interrupt the relay itself.
pub struct NmeaLog {
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl NmeaLog {
    pub async fn start() -> Result<Self, RelayError> {
        let timestamp = chrono::Local::now().format("%d%m%y-%H%M%S");
        let path = format!("logs/LOG{timestamp}.txt");
        if let Some(parent) = std::path::Path::new(&path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(RelayError::SerialIo)?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(RelayError::SerialIo)?;
        info!("nmea capture log: {path}");
        Ok(NmeaLog {
            file: tokio::sync::Mutex::new(file),
        })
    }

    async fn append(&self, line: &str) {
        let mut file = self.file.lock().await;
        if let Err(e) = file.write_all(line.as_bytes()).await {
            warn!("nmea log write failed: {e}");
            return;
        }
        let _ = file.write_all(b"\n").await;
    }
}

pub struct Gateway {
    config: Config,
    baud: u32,
}

impl Gateway {
    pub fn new(config: Config) -> Self {
        Gateway {
            config,
            baud: DEFAULT_BAUD_RATE,
        }
    }

    /// Overrides the serial baud rate (default 115200), e.g. from a CLI flag.
    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    /// Owns the serial port for the life of the process; only the TCP connection to
    /// the Caster is retried on failure, with a fixed backoff.
    pub async fn run(&self) -> Result<(), RelayError> {
        let serial = open_serial(&self.config.serial_port, self.baud)?;
        let (mut serial_reader, mut serial_writer) = tokio::io::split(serial);
        let log = Arc::new(NmeaLog::start().await?);

        loop {
            match self.run_once(&mut serial_reader, &mut serial_writer, &log).await {
                Ok(()) => {}
                Err(e) => warn!("gateway session error: {e}, reconnecting in {RECONNECT_BACKOFF:?}"),
            }
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }

    async fn run_once<R, W>(
        &self,
        serial_reader: &mut R,
        serial_writer: &mut W,
        log: &Arc<NmeaLog>,
    ) -> Result<(), RelayError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let socket = tokio::time::timeout(
            TCP_CONNECT_TIMEOUT,
            TcpStream::connect((self.config.orch_host.as_str(), self.config.orch_port)),
        )
        .await
        .map_err(|_| {
            RelayError::SocketIo(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "orchestrator connect timed out",
            ))
        })?
        .map_err(RelayError::SocketIo)?;
        info!("gateway connected to orchestrator");

        let (net_reader, mut net_writer) = socket.into_split();

        // Each branch owns a distinct half of each resource (serial-reader exclusively
        // feeds the network writer, network-reader exclusively feeds the serial
        // writer), so they can run concurrently without contention. Whichever
        // completes first (normally with an error) drops the other, which stands in
        // for the shared stop-signal spec section 4.4 asks for.
        tokio::select! {
            res = serial_to_network(serial_reader, &mut net_writer, log) => res,
            res = network_to_serial(net_reader, serial_writer) => res,
        }
    }
}

/// Serial-to-network activity: forward NMEA lines to the caster, sending GGA fixes at
/// most once per `GGA_INTERVAL`, with the very first GGA seen after a (re)connect sent
/// immediately — `last_sent` resets to `None` on every call, which happens exactly once
/// per reconnect.
async fn serial_to_network<R, W>(serial_reader: &mut R, net_writer: &mut W, log: &NmeaLog) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(serial_reader);
    let mut last_sent: Option<Instant> = None;

    loop {
        // Raw bytes, decoded lossily: a corrupted byte on the physical serial link
        // (noise, a dropped bit) must not kill this future via `?`, the way
        // `client_ntrip.py`'s `raw.decode('ascii', errors='ignore')` tolerates it.
        let mut raw = Vec::new();
        let n = reader
            .read_until(b'\n', &mut raw)
            .await
            .map_err(RelayError::SerialIo)?;
        if n == 0 {
            return Err(RelayError::SerialIo(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "serial port closed",
            )));
        }
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        log.append(line).await;

        if line.starts_with("$GNGGA") || line.starts_with("$GPGGA") {
            // field 4 (longitude) is the emptiness check client_ntrip.py's serial_reader
            // uses (`line.split(',')[4]`); an empty fix reports no position at all.
            let has_position = line.split(',').nth(4).map(|f| !f.is_empty()).unwrap_or(false);
            let due = last_sent.map(|t| t.elapsed() >= GGA_INTERVAL).unwrap_or(true);
            if has_position && due {
                net_writer
                    .write_all(format!("{line}\r\n").as_bytes())
                    .await
                    .map_err(RelayError::SocketIo)?;
                last_sent = Some(Instant::now());
            }
        }
    }
}

/// Network-to-serial activity: decode the caster's chunked RTCM3 body and write each
/// extracted frame straight to the serial port, flushing after every write.
async fn network_to_serial<R, W>(net_reader: R, serial_writer: &mut W) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut chunked = ChunkedReader::new(net_reader);
    chunked.consume_header().await?;
    let mut framer = Framer::new();

    loop {
        match chunked.next_chunk().await? {
            Chunk::End => {
                return Err(RelayError::SocketIo(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "caster closed the rtcm stream",
                )))
            }
            Chunk::Data(data) => {
                framer.feed(&data);
                for frame in framer.drain_frames() {
                    serial_writer
                        .write_all(frame.as_bytes())
                        .await
                        .map_err(RelayError::SerialIo)?;
                    serial_writer.flush().await.map_err(RelayError::SerialIo)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::DuplexStream;

    #[tokio::test]
    async fn serial_to_network_sends_first_gga_immediately_then_respects_interval() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut net_sink = Vec::new();

        client
            .write_all(b"$GNGGA,1,2311.00000,S,04600.00000,W,1,8,1.0,0,M,0,M,,*00\r\n")
            .await
            .unwrap();
        client
            .write_all(b"$GNGGA,2,2311.00000,S,04600.00000,W,1,8,1.0,0,M,0,M,,*00\r\n")
            .await
            .unwrap();
        drop(client);

        let log = NmeaLog {
            file: tokio::sync::Mutex::new(tokio::fs::File::from_std(tempfile_for_test())),
        };

        let mut server: DuplexStream = server;
        let mut sink_writer = Cursor::new(&mut net_sink);
        let _ = serial_to_network(&mut server, &mut sink_writer, &log).await;

        let written = String::from_utf8_lossy(&net_sink);
        // Only the first GGA should have been forwarded; the second arrives well
        // inside the 60s interval and is suppressed.
        assert_eq!(written.matches("$GNGGA").count(), 1);
    }

    fn tempfile_for_test() -> std::fs::File {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "rbmc-relay-test-{}-{unique}.log",
            std::process::id()
        ));
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap()
    }

    #[tokio::test]
    async fn network_to_serial_writes_decoded_frame_and_stops_at_final_chunk() {
        let rtcm_frame: [u8; 10] = [0xD3, 0x00, 0x04, 0x4C, 0xE0, 0x00, 0x00, 0xED, 0xED, 0xD6];

        let mut body = Vec::new();
        body.extend_from_slice(b"HTTP/1.1 200 OK\r\nContent-Type: gnss/data\r\n\r\n");
        body.extend_from_slice(format!("{:x}\r\n", rtcm_frame.len()).as_bytes());
        body.extend_from_slice(&rtcm_frame);
        body.extend_from_slice(b"\r\n0\r\n\r\n");

        let mut serial_out = Vec::new();
        let mut serial_writer = Cursor::new(&mut serial_out);
        let result = network_to_serial(Cursor::new(body), &mut serial_writer).await;

        // The terminal chunk ends the upstream body, which the Gateway treats as a
        // fault to reconnect from, not a clean shutdown.
        assert!(result.is_err());
        assert_eq!(serial_out, rtcm_frame);
    }
}
