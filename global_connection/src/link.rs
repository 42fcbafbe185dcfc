// TCP link to the relay hub.
//
// `Link::open` performs the TCP connect and the Hello → Welcome/Rejected
// handshake on the calling thread (always the client's executor worker), then
// spawns a reader thread and returns a handle used for sending.
//
// The reader thread reads frames in a loop and hands each decoded
// `RelayMessage` to a callback, which in practice schedules a task on the
// executor. A frame that decodes badly is logged and skipped; the stream is
// still aligned on the next frame. A transport error (EOF, reset, oversized
// length prefix) ends the loop with a final `LinkEvent::Closed`.
//
// Sending goes through a `BufWriter<TcpStream>` behind a mutex, since data
// may be sent from any host thread. Writes flush immediately; messages are
// small except for property snapshots.

use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use global_connection_protocol::framing::{self, FrameError};
use global_connection_protocol::{
    NodeMessage, PROTOCOL_VERSION, RelayMessage, ServerId, ServerInfo, read_frame, send_message,
    write_frame,
};
use tracing::{debug, warn};

use crate::config::{Credentials, RelayAddress};
use crate::error::LinkError;

/// Bound on the TCP connect, the handshake reply and every write.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a successful login.
#[derive(Debug)]
pub(crate) struct Welcome {
    /// The id the relay registered us under.
    pub(crate) server: ServerId,
    /// Every other node, with its announced players.
    pub(crate) servers: Vec<ServerInfo>,
}

#[derive(Debug)]
pub(crate) enum LinkEvent {
    Message(RelayMessage),
    /// The reader stopped. Delivered once, last.
    Closed(String),
}

pub(crate) struct Link {
    writer: Mutex<BufWriter<TcpStream>>,
    stream: TcpStream,
    peer: SocketAddr,
}

impl Link {
    /// Connect, log in and start the reader thread.
    pub(crate) fn open<F>(
        address: &RelayAddress,
        credentials: &Credentials,
        mut on_event: F,
    ) -> Result<(Self, Welcome), LinkError>
    where
        F: FnMut(LinkEvent) + Send + 'static,
    {
        let stream = connect_any(address)?;
        let peer = stream.peer_addr().map_err(LinkError::Connect)?;
        stream
            .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(LinkError::Connect)?;
        stream
            .set_write_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(LinkError::Connect)?;
        // Frames are written whole and flushed; don't let Nagle hold them.
        let _ = stream.set_nodelay(true);

        let reader_stream = stream.try_clone().map_err(LinkError::Connect)?;
        let control = stream.try_clone().map_err(LinkError::Connect)?;
        let mut writer = BufWriter::new(stream);

        send_message(
            &mut writer,
            &NodeMessage::Hello {
                protocol_version: PROTOCOL_VERSION,
                account: credentials.account.clone(),
                password: credentials.password.clone(),
            },
        )?;

        let mut reader = BufReader::new(reader_stream);
        let reply: RelayMessage = framing::decode(&read_frame(&mut reader)?)?;
        let welcome = match reply {
            RelayMessage::Welcome { server, servers } => Welcome { server, servers },
            RelayMessage::Rejected { reason } => return Err(LinkError::Rejected { reason }),
            other => return Err(LinkError::UnexpectedResponse(format!("{other:?}"))),
        };

        // The long-lived reader waits indefinitely.
        reader
            .get_ref()
            .set_read_timeout(None)
            .map_err(LinkError::Connect)?;

        thread::Builder::new()
            .name(format!("relay-reader-{}", welcome.server))
            .spawn(move || {
                let reason = reader_loop(&mut reader, &mut on_event);
                on_event(LinkEvent::Closed(reason));
            })
            .map_err(LinkError::Spawn)?;

        Ok((
            Self {
                writer: Mutex::new(writer),
                stream: control,
                peer,
            },
            welcome,
        ))
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn send(&self, message: &NodeMessage) -> Result<(), FrameError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        send_message(&mut *writer, message)
    }

    /// Write a message already encoded with `framing::encode`.
    pub(crate) fn send_encoded(&self, payload: &[u8]) -> Result<(), FrameError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        write_frame(&mut *writer, payload)
    }

    /// Log out and close the socket. The reader thread sees the close and
    /// reports `Closed`.
    pub(crate) fn close(&self) {
        if let Err(e) = self.send(&NodeMessage::Goodbye) {
            debug!(peer = %self.peer, error = %e, "goodbye not sent");
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn connect_any(address: &RelayAddress) -> Result<TcpStream, LinkError> {
    let target = format!("{}:{}", address.host, address.port);
    let candidates = (address.host.as_str(), address.port)
        .to_socket_addrs()
        .map_err(|source| LinkError::Resolve {
            addr: target.clone(),
            source,
        })?;
    let mut last_error = None;
    for candidate in candidates {
        match TcpStream::connect_timeout(&candidate, HANDSHAKE_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(LinkError::Connect(last_error.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{target} resolved to no addresses"),
        )
    })))
}

/// Read until the stream fails. Returns why it stopped.
fn reader_loop<F>(reader: &mut BufReader<TcpStream>, on_event: &mut F) -> String
where
    F: FnMut(LinkEvent),
{
    loop {
        let bytes = match read_frame(reader) {
            Ok(bytes) => bytes,
            Err(e) => return e.to_string(),
        };
        match framing::decode::<RelayMessage>(&bytes) {
            Ok(message) => on_event(LinkEvent::Message(message)),
            Err(e) => warn!(len = bytes.len(), error = %e, "discarding malformed relay frame"),
        }
    }
}
