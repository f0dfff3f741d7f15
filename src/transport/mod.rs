//! Transport boundary: one physical connection carrying sentence lines.
//!
//! [`connect`] establishes a socket per [`ConnectionOptions`] and returns
//! split read/write halves so the link supervisor can await inbound lines
//! while servicing send requests. Sentence framing is minimal here on
//! purpose: one line in equals one protocol sentence, and checksum
//! validation belongs to the external parsing collaborator.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};

use crate::core::{ConnectionOptions, TransportError, TransportKind};

/// Receive buffer size for UDP datagrams; generously above any sentence.
const UDP_RECV_BUFFER_SIZE: usize = 4096;

/// Read half of a connected transport.
#[derive(Debug)]
pub enum TransportReader {
    /// Buffered TCP read half; sentences are newline-delimited.
    Tcp(BufReader<OwnedReadHalf>),
    /// Connected UDP socket; one sentence per datagram.
    Udp {
        /// Shared socket (the writer holds the other reference).
        socket: Arc<UdpSocket>,
        /// Receive buffer, reused across datagrams.
        buf: Vec<u8>,
    },
}

/// Write half of a connected transport.
#[derive(Debug)]
pub enum TransportWriter {
    /// TCP write half.
    Tcp(OwnedWriteHalf),
    /// Shared UDP socket.
    Udp(Arc<UdpSocket>),
}

/// Connect according to the given options and split into halves.
pub async fn connect(
    options: &ConnectionOptions,
) -> Result<(TransportReader, TransportWriter), TransportError> {
    let target = (options.address.as_str(), options.port);
    match options.transport {
        TransportKind::Tcp => {
            let stream = TcpStream::connect(target)
                .await
                .map_err(TransportError::ConnectFailed)?;
            // Steering commands must not sit in Nagle buffers.
            stream
                .set_nodelay(true)
                .map_err(TransportError::ConnectFailed)?;
            let (read, write) = stream.into_split();
            Ok((
                TransportReader::Tcp(BufReader::new(read)),
                TransportWriter::Tcp(write),
            ))
        }
        TransportKind::Udp => {
            let socket = UdpSocket::bind("0.0.0.0:0")
                .await
                .map_err(TransportError::ConnectFailed)?;
            socket
                .connect(target)
                .await
                .map_err(TransportError::ConnectFailed)?;
            let socket = Arc::new(socket);
            Ok((
                TransportReader::Udp {
                    socket: Arc::clone(&socket),
                    buf: vec![0u8; UDP_RECV_BUFFER_SIZE],
                },
                TransportWriter::Udp(socket),
            ))
        }
    }
}

impl TransportReader {
    /// Read the next sentence line, with the terminator stripped.
    ///
    /// Returns `Err(TransportError::Closed)` when the peer closes a TCP
    /// stream; a UDP socket never observes a close.
    pub async fn next_line(&mut self) -> Result<String, TransportError> {
        match self {
            Self::Tcp(reader) => {
                let mut line = String::new();
                let n = reader
                    .read_line(&mut line)
                    .await
                    .map_err(TransportError::RecvFailed)?;
                if n == 0 {
                    return Err(TransportError::Closed);
                }
                trim_terminator(&mut line);
                Ok(line)
            }
            Self::Udp { socket, buf } => {
                let n = socket.recv(buf).await.map_err(TransportError::RecvFailed)?;
                let mut line = String::from_utf8_lossy(&buf[..n]).into_owned();
                trim_terminator(&mut line);
                Ok(line)
            }
        }
    }
}

impl TransportWriter {
    /// Write one sentence line, appending the CRLF terminator.
    pub async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        match self {
            Self::Tcp(writer) => {
                writer
                    .write_all(line.as_bytes())
                    .await
                    .map_err(TransportError::SendFailed)?;
                writer
                    .write_all(b"\r\n")
                    .await
                    .map_err(TransportError::SendFailed)?;
                writer.flush().await.map_err(TransportError::SendFailed)
            }
            Self::Udp(socket) => {
                socket
                    .send(line.as_bytes())
                    .await
                    .map_err(TransportError::SendFailed)?;
                Ok(())
            }
        }
    }

    /// Release the connection. Idempotent; shutdown errors on an already
    /// dead socket are ignored.
    pub async fn shutdown(&mut self) {
        if let Self::Tcp(writer) = self {
            let _ = writer.shutdown().await;
        }
    }
}

fn trim_terminator(line: &mut String) {
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
}
