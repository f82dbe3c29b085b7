//! TCP protocol server
//!
//! One request per connection: accept, read a single JSON object, dispatch
//! through the session handle, write a single JSON response, close. Any
//! failure inside one request becomes an `ERROR` response (or at worst a
//! dropped connection) and never takes the acceptor down.

use crate::session::SessionHandle;
use sonar_common::error::{Error, Result};
use sonar_common::protocol::{Request, Response, MAX_REQUEST_BYTES};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// How long a client may take to deliver its request.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// The daemon's listening socket and dispatch loop.
pub struct ProtocolServer {
    listener: TcpListener,
    session: SessionHandle,
}

impl ProtocolServer {
    /// Bind the listening socket. Failure here is fatal to the process.
    pub async fn bind(addr: SocketAddr, session: SessionHandle) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(Error::Bind)?;
        Ok(Self { listener, session })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::from)
    }

    /// Accept and serve connections until the task is dropped.
    pub async fn run(self) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };
            debug!("Connected by {}", peer);
            let session = self.session.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, session).await {
                    warn!("Connection from {} failed: {}", peer, e);
                }
            });
        }
    }
}

/// Serve one request/response exchange.
async fn handle_connection(mut stream: TcpStream, session: SessionHandle) -> Result<()> {
    let response = match read_request(&mut stream).await {
        Ok(request) => {
            debug!("Got request: {:?}", request);
            dispatch(request, &session).await
        }
        Err(e) => Response::from(&e),
    };

    let raw = serde_json::to_vec(&response)?;
    stream.write_all(&raw).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Read until the buffer parses as a full JSON object, the peer closes, or
/// the size bound is hit. There is no length framing; a request must fit
/// within [`MAX_REQUEST_BYTES`].
async fn read_request(stream: &mut TcpStream) -> Result<Request> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        // A complete JSON value means the request is all here, even if the
        // peer keeps the connection open for the response.
        if !buf.is_empty() && serde_json::from_slice::<serde_json::Value>(&buf).is_ok() {
            return Request::parse(&buf);
        }
        if buf.len() > MAX_REQUEST_BYTES {
            return Err(Error::MalformedRequest("request too large".into()));
        }

        let read = timeout(READ_TIMEOUT, stream.read(&mut chunk))
            .await
            .map_err(|_| Error::MalformedRequest("timed out reading request".into()))??;
        if read == 0 {
            return Request::parse(&buf);
        }
        buf.extend_from_slice(&chunk[..read]);
    }
}

/// Route a request to the session and shape the reply envelope.
async fn dispatch(request: Request, session: &SessionHandle) -> Response {
    let result = match request {
        Request::Status => {
            return match session.status().await {
                Ok(status) => Response::status(status),
                Err(e) => Response::from(&e),
            };
        }
        Request::ShowQueue => {
            return match session.show_queue().await {
                Ok(queue) => Response::queue(queue),
                Err(e) => Response::from(&e),
            };
        }
        Request::Play { queue_index } => session.play(queue_index).await,
        Request::Pause => session.pause().await,
        Request::Stop => session.stop().await,
        Request::PreviousSong => session.previous_song().await,
        Request::NextSong => session.next_song().await,
        Request::Seek { timedelta } => session.seek(timedelta).await,
        Request::Repeat { value } => session.repeat(value).await,
        Request::Shuffle => session.shuffle().await,
        Request::SortQueue => session.sort_queue().await,
        Request::SetQueue { data } => session.set_queue(data).await,
        Request::PrependQueue { data } => session.prepend_queue(data).await,
        Request::AppendQueue { data } => session.append_queue(data).await,
        Request::RemoveFromQueue { data } => session.remove_from_queue(data).await,
    };

    match result {
        Ok(()) => Response::ok(),
        Err(e) => Response::from(&e),
    }
}
