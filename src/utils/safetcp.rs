//! Framed TCP primitives shared by both RPC surfaces: every message is an
//! rmp-serde payload behind an 8-byte big-endian length prefix. The read
//! side survives `tokio::select!` cancellation; the write side never parks
//! on a full socket.

use std::io::ErrorKind;
use std::marker::Unpin;
use std::net::{Ipv4Addr, SocketAddr};

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

use crate::utils::RangemasterError;

/// Bytes of length prefix ahead of each frame body.
const LEN_PREFIX: usize = 8;

/// Receives one framed message of type `T` from `conn_read`, accumulating
/// partial reads in `read_buf`. On success the consumed frame is dropped
/// from the buffer (any over-read tail is kept for the next call).
///
/// This function is meant to sit in a `tokio::select!` branch, so it must
/// tolerate being dropped at any await point. Helpers like `read_exact()`
/// cannot promise that, which is why the loop below reads whatever is
/// available into `read_buf` and re-derives its position from the buffer
/// alone: a cancelled call loses no bytes, and the next call picks up
/// exactly where the socket left off.
pub async fn safe_tcp_read<T, Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<T, RangemasterError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    // the length prefix may itself arrive in pieces
    if read_buf.capacity() < LEN_PREFIX {
        read_buf.reserve(LEN_PREFIX - read_buf.capacity());
    }
    while read_buf.len() < LEN_PREFIX {
        let nread = conn_read.read_buf(read_buf).await?;
        if nread == 0 {
            return Err(RangemasterError::msg("connection closed"));
        }
    }
    let body_len =
        u64::from_be_bytes(read_buf[..LEN_PREFIX].try_into().unwrap());

    // then accumulate until the whole body is in
    let frame_end = LEN_PREFIX + body_len as usize;
    if read_buf.capacity() < frame_end {
        read_buf.reserve(frame_end - read_buf.capacity());
    }
    while read_buf.len() < frame_end {
        let nread = conn_read.read_buf(read_buf).await?;
        if nread == 0 {
            return Err(RangemasterError::msg("connection closed"));
        }
    }
    let msg = rmp_serde::decode::from_slice(&read_buf[LEN_PREFIX..frame_end])?;

    // no awaits remain, so no cancellation can lose the tail shuffle below;
    // bytes past the frame belong to the next message
    if read_buf.len() > frame_end {
        let tail = Bytes::copy_from_slice(&read_buf[frame_end..]);
        read_buf.clear();
        read_buf.extend_from_slice(&tail);
    } else {
        read_buf.clear();
    }

    Ok(msg)
}

/// Sends one framed message of type `T` through `conn_write`, staging the
/// encoded frame in `write_buf`. Returns:
///   - `Ok(true)` when the whole frame hit the socket
///   - `Ok(false)` when the socket filled up mid-frame; the remainder stays
///     staged, and the caller must retry with `msg == None` (after the
///     socket reports writable again) until `Ok(true)`
///   - `Err(err)` on anything unexpected
///
/// Writing goes through non-blocking `try_write()` on purpose. If both
/// endpoints used a parking write (`write_all()` and friends) while both
/// their send buffers were full, each side would sit in its write waiting
/// for the other to read, and neither would ever get there. Backing off
/// with `Ok(false)` lets the caller drain reads in between.
pub fn safe_tcp_write<T, Conn>(
    write_buf: &mut BytesMut,
    write_buf_cursor: &mut usize,
    conn_write: &Conn,
    msg: Option<&T>,
) -> Result<bool, RangemasterError>
where
    T: Serialize,
    Conn: AsRef<TcpStream>,
{
    // a new message may only be staged once the previous one is out
    if msg.is_some() && !write_buf.is_empty() {
        return Err(RangemasterError::msg(
            "staging a new message while a retry is pending",
        ));
    } else if msg.is_none() && write_buf.is_empty() {
        return Err(RangemasterError::msg(
            "nothing staged to retry",
        ));
    } else if let Some(msg) = msg {
        debug_assert_eq!(*write_buf_cursor, 0);
        let body = rmp_serde::encode::to_vec(msg)?;
        write_buf.extend_from_slice(&(body.len() as u64).to_be_bytes());
        write_buf.extend_from_slice(body.as_slice());
    }
    // with msg == None, the staged frame and cursor carry over as-is

    while *write_buf_cursor < write_buf.len() {
        match conn_write
            .as_ref()
            .try_write(&write_buf[*write_buf_cursor..])
        {
            Ok(n) => {
                *write_buf_cursor += n;
            }
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }
    }

    write_buf.clear();
    *write_buf_cursor = 0;
    Ok(true)
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, RangemasterError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_linger(None)?;
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;

        let bind_addr = (Ipv4Addr::UNSPECIFIED, bind_addr.port()).into();
        socket.bind(bind_addr)?;

        match socket.listen(1024) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, RangemasterError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_linger(None)?;
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;

        match socket.connect(conn_addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
