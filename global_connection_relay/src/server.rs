// TCP server and main event loop for the relay hub.
//
// Architecture: thread-per-reader with a central `mpsc` channel.
//
// - **Listener thread** (`TcpListener::accept()` loop): accepts new TCP
//   connections and sends `InternalEvent::NewConnection` to the main thread.
// - **Reader threads** (one per node): read frames in a loop, decode
//   `NodeMessage`, and send `InternalEvent::MessageFrom` to the main thread.
//   On error, EOF or `Goodbye`, send `InternalEvent::Disconnected`. A frame
//   that does not decode is skipped.
// - **Main thread**: owns the `Roster`, receives events from the channel and
//   dispatches them. `recv_timeout` bounds how long it waits so it notices
//   the stop flag promptly.
//
// The main thread is the only writer to node streams (via the roster).
// Reader threads only read.
//
// `RelayHandle::disconnect_node` closes one node's stream from the relay
// side. Tests use it to simulate a node losing its link.

use std::collections::BTreeMap;
use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use global_connection_protocol::framing;
use global_connection_protocol::{NodeMessage, RelayMessage, ServerId, read_frame, send_message};
use tracing::{debug, info, warn};

use crate::session::{ConnectionId, Roster};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Events sent from listener/reader threads (and the handle) to the main
/// thread.
enum InternalEvent {
    NewConnection {
        stream: TcpStream,
    },
    MessageFrom {
        connection: ConnectionId,
        message: NodeMessage,
    },
    Disconnected {
        connection: ConnectionId,
    },
    Kick {
        server: ServerId,
    },
}

/// Handle returned by `start_relay` to control the running relay. Dropping
/// it stops the relay.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    events: Sender<InternalEvent>,
    thread: Option<thread::JoinHandle<()>>,
    addr: SocketAddr,
}

impl RelayHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Close a node's connection from the relay side.
    pub fn disconnect_node(&self, server: &ServerId) {
        let _ = self.events.send(InternalEvent::Kick {
            server: server.clone(),
        });
    }

    /// Signal the relay to stop and wait for it to shut down. Every node
    /// connection is closed.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Configuration for starting a relay.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// 0 lets the OS pick a free port.
    pub port: u16,
    /// Account → password. Empty accepts any login.
    pub accounts: BTreeMap<String, String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 25701,
            accounts: BTreeMap::new(),
        }
    }
}

/// Start the relay on a background thread, bound to localhost.
pub fn start_relay(config: RelayConfig) -> io::Result<RelayHandle> {
    let listener = TcpListener::bind(("127.0.0.1", config.port))?;
    let addr = listener.local_addr()?;
    let keep_running = Arc::new(AtomicBool::new(true));
    let (tx, rx) = mpsc::channel();

    let loop_flag = Arc::clone(&keep_running);
    let loop_tx = tx.clone();
    let thread = thread::Builder::new()
        .name("relay-main".into())
        .spawn(move || run_relay(listener, config, &loop_flag, &loop_tx, &rx))?;

    info!(%addr, "relay listening");
    Ok(RelayHandle {
        keep_running,
        events: tx,
        thread: Some(thread),
        addr,
    })
}

/// Main relay loop. Runs until `keep_running` is set to false.
fn run_relay(
    listener: TcpListener,
    config: RelayConfig,
    keep_running: &Arc<AtomicBool>,
    tx: &Sender<InternalEvent>,
    rx: &Receiver<InternalEvent>,
) {
    let mut roster = Roster::new(config.accounts);

    // Non-blocking so the accept thread can check keep_running.
    if let Err(e) = listener.set_nonblocking(true) {
        warn!(error = %e, "could not make relay listener non-blocking");
    }

    let listener_flag = Arc::clone(keep_running);
    let listener_tx = tx.clone();
    thread::spawn(move || {
        while listener_flag.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    let _ = stream.set_nonblocking(false);
                    let _ = listener_tx.send(InternalEvent::NewConnection { stream });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(POLL_INTERVAL);
                }
                Err(_) => break,
            }
        }
    });

    while keep_running.load(Ordering::SeqCst) {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(event) => {
                handle_event(&mut roster, event, tx);
                while let Ok(event) = rx.try_recv() {
                    handle_event(&mut roster, event, tx);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    roster.close_all();
    info!("relay stopped");
}

fn handle_event(roster: &mut Roster, event: InternalEvent, tx: &Sender<InternalEvent>) {
    match event {
        InternalEvent::NewConnection { stream } => handle_new_connection(roster, stream, tx),
        InternalEvent::MessageFrom {
            connection,
            message,
        } => roster.handle(connection, message),
        InternalEvent::Disconnected { connection } => roster.logout(connection),
        InternalEvent::Kick { server } => {
            if roster.kick(&server) {
                info!(server = %server, "node disconnected by relay");
            }
        }
    }
}

/// Read the Hello handshake, log the node in, and spawn its reader thread.
fn handle_new_connection(roster: &mut Roster, stream: TcpStream, tx: &Sender<InternalEvent>) {
    let _ = stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT));
    let Ok(reader_stream) = stream.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(reader_stream);

    let hello = read_frame(&mut reader).and_then(|bytes| framing::decode::<NodeMessage>(&bytes));
    let hello = match hello {
        Ok(hello) => hello,
        Err(e) => {
            debug!(error = %e, "dropping connection without a valid Hello");
            return;
        }
    };
    let NodeMessage::Hello {
        protocol_version,
        account,
        password,
    } = hello
    else {
        debug!("dropping connection that did not start with Hello");
        return;
    };

    let Ok(write_stream) = stream.try_clone() else {
        return;
    };
    match roster.login(protocol_version, &account, &password, write_stream) {
        Ok(connection) => {
            let _ = stream.set_read_timeout(None);
            let reader_tx = tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("relay-reader-{account}"))
                .spawn(move || reader_loop(reader, connection, &reader_tx));
            if let Err(e) = spawned {
                warn!(error = %e, "could not spawn reader thread");
                roster.logout(connection);
            }
        }
        Err(reason) => {
            warn!(account = %account, reason = %reason, "login rejected");
            let mut stream = stream;
            let _ = send_message(&mut stream, &RelayMessage::Rejected { reason });
        }
    }
}

/// Reader loop for a single node. Runs in its own thread.
fn reader_loop(
    mut reader: BufReader<TcpStream>,
    connection: ConnectionId,
    tx: &Sender<InternalEvent>,
) {
    loop {
        let bytes = match read_frame(&mut reader) {
            Ok(bytes) => bytes,
            Err(_) => break,
        };
        match framing::decode::<NodeMessage>(&bytes) {
            Ok(NodeMessage::Goodbye) => break,
            Ok(message) => {
                if tx
                    .send(InternalEvent::MessageFrom {
                        connection,
                        message,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => debug!(connection = connection.0, error = %e, "skipping malformed frame"),
        }
    }
    let _ = tx.send(InternalEvent::Disconnected { connection });
}
