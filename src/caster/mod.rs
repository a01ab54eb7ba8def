//! Caster session state machine (spec section 4.1): terminates one rover TCP
//! connection at a time, drives it from initial handshake through base selection,
//! subscription, continuous streaming, and hot-switch on motion. Grounded in
//! `examples/original_source/caster_ntrip.py`'s `Caster` class, restructured as an
//! explicit, total state machine the way spec section 9 asks ("the current source
//! uses string literals for states; an implementation should make illegal states
//! unrepresentable").

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::Config;
use crate::directory::{DirectoryClient, StationSelection};
use crate::error::RelayError;
use crate::geo::Position;
use crate::nmea::parse_gga;
use crate::subscription::UpstreamSubscription;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Seam over station ranking: lets tests drive `Caster` against a fake Directory
/// instead of a real HTTP sourcetable fetch. `DirectoryClient` is the only production
/// implementation.
trait Directory: Send + Sync {
    fn rank(&self, position: Position) -> BoxFuture<'_, Result<StationSelection, RelayError>>;
}

impl Directory for DirectoryClient {
    fn rank(&self, position: Position) -> BoxFuture<'_, Result<StationSelection, RelayError>> {
        Box::pin(DirectoryClient::rank(self, position))
    }
}

/// Seam over one upstream subscription's lifecycle: lets tests count start/stop calls
/// against a fake worker instead of opening a real TCP connection.
trait Subscription: Send + Sync {
    fn drain(&self) -> BoxFuture<'_, Vec<u8>>;
    fn stop(self: Box<Self>) -> BoxFuture<'static, ()>;
}

impl Subscription for UpstreamSubscription {
    fn drain(&self) -> BoxFuture<'_, Vec<u8>> {
        Box::pin(UpstreamSubscription::drain(self))
    }

    fn stop(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(UpstreamSubscription::stop(*self))
    }
}

/// Seam over subscription creation, so a test can substitute a fake `Subscription`.
trait SubscriptionFactory: Send + Sync {
    fn start(
        &self,
        host: String,
        port: u16,
        mount: String,
        user: String,
        pass: String,
    ) -> Box<dyn Subscription>;
}

struct RealSubscriptionFactory;

impl SubscriptionFactory for RealSubscriptionFactory {
    fn start(
        &self,
        host: String,
        port: u16,
        mount: String,
        user: String,
        pass: String,
    ) -> Box<dyn Subscription> {
        Box::new(UpstreamSubscription::start(host, port, mount, user, pass))
    }
}

/// The five states named in spec section 3. Purely observational here (logged at
/// each transition); the control flow below is the total transition function over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initialize,
    GetCoordinates,
    DefineBase,
    ConnectUpstream,
    Stream,
}

const ROVER_READ_DEADLINE: Duration = Duration::from_millis(100);
const DRAIN_IDLE_SLEEP: Duration = Duration::from_millis(10);
const ICY_HEADER: &[u8] = b"ICY 200 OK\r\nContent-Type: gnss/data\r\n\r\n";

/// Accumulates bytes read off a socket and yields complete `\r\n`-terminated lines,
/// carrying any trailing partial line across calls. Shared by `GET_COORDINATES` and
/// the `STREAM` loop's rover-read step, mirroring the byte-accumulator both phases
/// use in `caster_ntrip.py`.
#[derive(Default)]
struct LineAccumulator {
    buf: Vec<u8>,
}

impl LineAccumulator {
    fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.buf.windows(2).position(|w| w == b"\r\n")?;
        let line: Vec<u8> = self.buf.drain(..pos + 2).collect();
        Some(String::from_utf8_lossy(&line[..line.len() - 2]).into_owned())
    }
}

pub struct Caster {
    config: Config,
    directory: Arc<dyn Directory>,
    subscriptions: Arc<dyn SubscriptionFactory>,
}

enum StreamExit {
    BaseSwitch(StationSelection),
}

impl Caster {
    pub fn new(config: Config) -> Self {
        let directory = Arc::new(DirectoryClient::new(config.ibge_endpoint_url.clone()));
        Caster {
            config,
            directory,
            subscriptions: Arc::new(RealSubscriptionFactory),
        }
    }

    /// Test-only constructor: substitutes a fake Directory and subscription factory so
    /// the state machine can be driven without real HTTP or TCP upstream dependencies.
    #[cfg(test)]
    fn with_seams(
        config: Config,
        directory: Arc<dyn Directory>,
        subscriptions: Arc<dyn SubscriptionFactory>,
    ) -> Self {
        Caster {
            config,
            directory,
            subscriptions,
        }
    }

    /// INITIALIZE: bind and listen with address reuse, then accept rover connections
    /// one at a time (spec section 4.1's single-rover design).
    pub async fn serve_forever(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.local_ntrip_port))
            .await
            .map_err(RelayError::SocketIo)?;
        info!("caster listening on port {}", self.config.local_ntrip_port);

        loop {
            let (socket, addr) = match listener.accept().await {
                Ok(x) => x,
                Err(e) => {
                    error!("accept error: {e}");
                    continue;
                }
            };
            info!("rover connected from {addr}");
            if let Err(e) = self.handle_rover(socket).await {
                warn!("rover session ended: {e}");
            }
            info!("state -> Initialize (awaiting next rover)");
        }
    }

    async fn handle_rover(&self, mut socket: TcpStream) -> Result<(), RelayError> {
        socket.set_nodelay(true).map_err(RelayError::SocketIo)?;
        let mut acc = LineAccumulator::default();

        info!("state -> GetCoordinates");
        let position = self.read_initial_position(&mut socket, &mut acc).await?;

        info!("state -> DefineBase");
        let mut selection = self.directory.rank(position).await?;
        info!(
            "initial base: {} ({:.1} km), helper: {}",
            selection.primary.id, selection.primary.distance_km, selection.helper.id
        );

        // Sent exactly once per rover TCP connection: a base switch re-enters STREAM
        // without leaving the same underlying session, so repeating this header would
        // inject HTTP-response bytes into the middle of the RTCM stream (spec S6).
        socket.write_all(ICY_HEADER).await.map_err(RelayError::SocketIo)?;

        loop {
            info!("state -> ConnectUpstream ({})", selection.primary.id);
            let subscription = self.subscriptions.start(
                self.config.rbmc_host.clone(),
                self.config.rbmc_port,
                selection.primary.id.clone(),
                self.config.rbmc_user.clone(),
                self.config.rbmc_pass.clone(),
            );

            info!("state -> Stream");
            let outcome = self.stream(&mut socket, &subscription, &selection, &mut acc).await;
            subscription.stop().await;

            match outcome {
                Ok(StreamExit::BaseSwitch(new_selection)) => {
                    info!(
                        "base switch: {} -> {}",
                        selection.primary.id, new_selection.primary.id
                    );
                    selection = new_selection;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// GET_COORDINATES: read until a line parses as a GGA with a valid position.
    /// No timeout — the rover is authoritative for session start.
    async fn read_initial_position(
        &self,
        socket: &mut TcpStream,
        acc: &mut LineAccumulator,
    ) -> Result<crate::geo::Position, RelayError> {
        let mut read_buf = [0u8; 1024];
        loop {
            while let Some(line) = acc.take_line() {
                if let Some(position) = parse_gga(&line) {
                    return Ok(position);
                }
            }
            let n = socket.read(&mut read_buf).await.map_err(RelayError::SocketIo)?;
            if n == 0 {
                return Err(RelayError::SocketIo(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "rover closed connection before sending coordinates",
                )));
            }
            acc.feed(&read_buf[..n]);
        }
    }

    /// STREAM: repeatedly drain the subscription into the rover and watch for a GGA
    /// that moves the rover onto a different pair of stations. The NTRIP response
    /// header was already sent once by `handle_rover` before the first entry into this
    /// loop; re-entering STREAM after a base switch must not resend it (spec S6).
    async fn stream(
        &self,
        socket: &mut TcpStream,
        subscription: &dyn Subscription,
        committed: &StationSelection,
        acc: &mut LineAccumulator,
    ) -> Result<StreamExit, RelayError> {
        let mut read_buf = [0u8; 1024];
        loop {
            match tokio::time::timeout(ROVER_READ_DEADLINE, socket.read(&mut read_buf)).await {
                Ok(Ok(0)) => {
                    return Err(RelayError::SocketIo(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "rover closed connection",
                    )));
                }
                Ok(Ok(n)) => {
                    acc.feed(&read_buf[..n]);
                    while let Some(line) = acc.take_line() {
                        if let Some(position) = parse_gga(&line) {
                            let candidate = self.directory.rank(position).await?;
                            if candidate.differs_from(committed) {
                                return Ok(StreamExit::BaseSwitch(candidate));
                            }
                        }
                    }
                }
                Ok(Err(e)) => return Err(RelayError::SocketIo(e)),
                Err(_timeout) => {} // no data within the deadline: ignored, per spec.
            }

            let drained = subscription.drain().await;
            if !drained.is_empty() {
                socket.write_all(&drained).await.map_err(RelayError::SocketIo)?;
            } else {
                tokio::time::sleep(DRAIN_IDLE_SLEEP).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ReferenceStation;

    fn station(id: &str, distance_km: f64) -> ReferenceStation {
        ReferenceStation {
            id: id.to_string(),
            lat_deg: 0.0,
            lon_deg: 0.0,
            distance_km,
        }
    }

    #[test]
    fn line_accumulator_splits_on_crlf_and_keeps_partial_tail() {
        let mut acc = LineAccumulator::default();
        acc.feed(b"$GNGGA,one\r\n$GNGGA,tw");
        assert_eq!(acc.take_line().unwrap(), "$GNGGA,one");
        assert!(acc.take_line().is_none());
        acc.feed(b"o\r\n");
        assert_eq!(acc.take_line().unwrap(), "$GNGGA,two");
    }

    #[test]
    fn line_accumulator_handles_split_across_many_feeds() {
        let mut acc = LineAccumulator::default();
        for byte in b"$GNGGA,x\r\n" {
            acc.feed(&[*byte]);
        }
        assert_eq!(acc.take_line().unwrap(), "$GNGGA,x");
    }

    /// Always returns `(A, B)` for its first call and `(C, A)` for every call after,
    /// regardless of the position passed in — enough to drive one base switch.
    struct FakeDirectory {
        calls: std::sync::atomic::AtomicUsize,
    }

    impl Directory for FakeDirectory {
        fn rank(&self, _position: Position) -> BoxFuture<'_, Result<StationSelection, RelayError>> {
            let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Box::pin(async move {
                Ok(if call == 0 {
                    StationSelection {
                        primary: station("A", 1.0),
                        helper: station("B", 2.0),
                    }
                } else {
                    StationSelection {
                        primary: station("C", 0.5),
                        helper: station("A", 1.0),
                    }
                })
            })
        }
    }

    /// Records a `start:{mount}`/`stop:{mount}` line for every call, so a test can
    /// assert exactly which subscriptions were opened and torn down.
    struct FakeSubscriptionFactory {
        log: Arc<std::sync::Mutex<Vec<String>>>,
    }

    struct FakeSubscription {
        mount: String,
        log: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl Subscription for FakeSubscription {
        fn drain(&self) -> BoxFuture<'_, Vec<u8>> {
            Box::pin(async { Vec::new() })
        }

        fn stop(self: Box<Self>) -> BoxFuture<'static, ()> {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("stop:{}", self.mount));
            })
        }
    }

    impl SubscriptionFactory for FakeSubscriptionFactory {
        fn start(
            &self,
            _host: String,
            _port: u16,
            mount: String,
            _user: String,
            _pass: String,
        ) -> Box<dyn Subscription> {
            self.log.lock().unwrap().push(format!("start:{mount}"));
            Box::new(FakeSubscription {
                mount,
                log: self.log.clone(),
            })
        }
    }

    fn test_config() -> Config {
        Config {
            rbmc_host: "upstream.example.com".to_string(),
            rbmc_port: 2101,
            rbmc_user: "user".to_string(),
            rbmc_pass: "pass".to_string(),
            ibge_endpoint_url: "http://directory.example.com/sourcetable".to_string(),
            local_ntrip_port: 0,
            serial_port: "/dev/null".to_string(),
            orch_host: "orchestrator.example.com".to_string(),
            orch_port: 0,
        }
    }

    #[test]
    fn s5_base_switch_triggers_only_when_either_slot_differs() {
        let committed = StationSelection {
            primary: station("A", 1.0),
            helper: station("B", 2.0),
        };

        // Rover moved near C: primary changes A -> C, helper becomes A.
        let moved = StationSelection {
            primary: station("C", 0.5),
            helper: station("A", 1.0),
        };
        assert!(moved.differs_from(&committed));

        // Same pair, re-ranked identically: no switch.
        let unchanged = StationSelection {
            primary: station("A", 1.1),
            helper: station("B", 2.1),
        };
        assert!(!unchanged.differs_from(&committed));
    }

    /// Drives `Caster::handle_rover` end to end over a real loopback TCP pair, with a
    /// fake Directory and subscription factory standing in for the HTTP/upstream
    /// collaborators, and checks the spec S5 contract: the subscription to the
    /// original base is stopped exactly once, a subscription to the new base is
    /// started exactly once, and the rover connection survives the switch (it is
    /// only closed once the test itself drops its end).
    #[tokio::test]
    async fn s5_base_switch_stops_old_subscription_and_starts_new_without_closing_rover() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let gga_near_a =
            "$GNGGA,131804.00,2290.63642,S,05125.61568,W,5,12,2.18,368.8,M,-5.5,M,,0000*5D\r\n";
        let gga_near_c =
            "$GNGGA,131805.00,2400.00000,S,05200.00000,W,5,12,2.18,368.8,M,-5.5,M,,0000*5D\r\n";

        let mut rover = TcpStream::connect(addr).await.unwrap();
        rover.write_all(gga_near_a.as_bytes()).await.unwrap();

        let (socket, _) = listener.accept().await.unwrap();

        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let directory = Arc::new(FakeDirectory {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let subscriptions = Arc::new(FakeSubscriptionFactory { log: log.clone() });
        let caster = Caster::with_seams(test_config(), directory, subscriptions);

        let session = tokio::spawn(async move { caster.handle_rover(socket).await });

        // Give the session time to reach STREAM with base A committed, then send the
        // GGA that moves the rover near C.
        tokio::time::sleep(Duration::from_millis(150)).await;
        rover.write_all(gga_near_c.as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        // The rover connection must still be open: the session task hasn't finished.
        assert!(!session.is_finished());

        // Ending the test's side of the connection is what finally ends the session.
        drop(rover);
        let result = tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .expect("session should end once the rover connection closes")
            .unwrap();
        assert!(result.is_err());

        let log = log.lock().unwrap();
        assert_eq!(log.iter().filter(|l| l.as_str() == "start:A").count(), 1);
        assert_eq!(log.iter().filter(|l| l.as_str() == "stop:A").count(), 1);
        assert_eq!(log.iter().filter(|l| l.as_str() == "start:C").count(), 1);
        assert!(
            log.iter().position(|l| l == "start:A").unwrap()
                < log.iter().position(|l| l == "stop:A").unwrap()
        );
        assert!(
            log.iter().position(|l| l == "stop:A").unwrap()
                < log.iter().position(|l| l == "start:C").unwrap()
        );
    }
}
