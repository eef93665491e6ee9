//! Thin async transport on top of [`crate::envelope`]. Mirrors the
//! teacher's `read_message`/`send_message` helpers, but speaking framed
//! [`Envelope`]s instead of bare lines, and enforcing the size bounds of
//! spec §4.2 on every read.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use crate::envelope::{Envelope, EnvelopeType, MAX_LINE_LEN};
use crate::error::ProtocolError;

pub type Reader = BufReader<ReadHalf<TcpStream>>;
pub type Writer = WriteHalf<TcpStream>;

pub async fn send_envelope(writer: &mut Writer, ty: EnvelopeType, line: impl Into<String>) -> Result<(), ProtocolError> {
    let env = Envelope::new(ty, line);
    let wire = env.encode()?;
    writer
        .write_all(wire.as_bytes())
        .await
        .map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))
}

pub async fn recv_envelope(reader: &mut Reader) -> Result<Envelope, ProtocolError> {
    let mut buf = String::new();
    let mut limited = reader.take(MAX_LINE_LEN as u64 + 1);
    limited
        .read_line(&mut buf)
        .await
        .map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))?;
    if buf.is_empty() {
        return Err(ProtocolError::MalformedEnvelope("connection closed".into()));
    }
    Envelope::decode(&buf)
}

pub fn split(socket: TcpStream) -> (Reader, Writer) {
    let (r, w) = tokio::io::split(socket);
    (BufReader::new(r), w)
}
