//! Per-connection socket state and buffering.
//!
//! A `Connection` owns the socket and its read/write buffers; it references
//! the session only through `client_id`. Reads accumulate into a
//! grow-on-demand buffer that the codec consumes frame by frame. Writes go
//! through a buffered queue flushed on writable events; the buffer has a
//! soft cap past which non-critical frames are refused with `WouldBlock`
//! (the caller decides what is droppable).

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;

use mio::net::TcpStream;
use mio::Token;

use crate::error::ProtocolError;
use crate::packet::{self, Packet};

/// Connection lifecycle. Only `Connected` is reachable by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Socket accepted, CONNECT not yet received.
    AwaitConnect,
    /// CONNACK sent; in the packet loop.
    Connected,
    /// Marked for teardown at the end of the tick.
    Disconnecting,
    /// Socket closed and deregistered.
    Closed,
}

pub struct Connection {
    pub token: Token,
    pub socket: TcpStream,
    pub remote_addr: SocketAddr,
    pub state: ConnState,
    /// Set once CONNECT is accepted.
    pub client_id: Option<String>,
    pub keep_alive: u16,
    /// True when the client sent DISCONNECT (suppresses the will).
    pub graceful: bool,
    /// When the socket was accepted, for the CONNECT timeout.
    pub opened_at: Instant,
    /// Last packet received, for keep-alive enforcement.
    pub last_activity: Instant,
    /// True while registered for WRITABLE interest.
    pub wants_writable: bool,
    /// True once the peer closed its side. Buffered packets (e.g. a final
    /// DISCONNECT) are still processed before teardown.
    pub eof: bool,

    read_buf: Vec<u8>,
    read_pos: usize,
    write_buf: Vec<u8>,
    write_pos: usize,
    write_limit: usize,
}

impl Connection {
    pub fn new(
        token: Token,
        socket: TcpStream,
        remote_addr: SocketAddr,
        recv_buffer_size: usize,
        write_limit: usize,
        now: Instant,
    ) -> Self {
        Self {
            token,
            socket,
            remote_addr,
            state: ConnState::AwaitConnect,
            client_id: None,
            keep_alive: 0,
            graceful: false,
            opened_at: now,
            last_activity: now,
            wants_writable: false,
            eof: false,
            read_buf: vec![0u8; recv_buffer_size],
            read_pos: 0,
            write_buf: Vec::new(),
            write_pos: 0,
            write_limit,
        }
    }

    /// Read from the socket until it would block.
    /// Returns the bytes read; EOF sets the `eof` flag.
    pub fn read(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            if self.read_pos >= self.read_buf.len() {
                let new_size = self.read_buf.len() * 2;
                self.read_buf.resize(new_size, 0);
            }

            match self.socket.read(&mut self.read_buf[self.read_pos..]) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(total);
                }
                Ok(n) => {
                    self.read_pos += n;
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Try to decode the next packet from the read buffer.
    pub fn decode_packet(
        &mut self,
        max_packet_size: usize,
    ) -> Result<Option<Packet>, ProtocolError> {
        if self.read_pos == 0 {
            return Ok(None);
        }

        match packet::decode_packet(&self.read_buf[..self.read_pos], max_packet_size)? {
            Some((decoded, consumed)) => {
                self.read_buf.copy_within(consumed..self.read_pos, 0);
                self.read_pos -= consumed;
                Ok(Some(decoded))
            }
            None => Ok(None),
        }
    }

    /// Encode a packet into the write buffer. Returns the frame size, or
    /// `WouldBlock` when the buffer is over its soft cap (slow client).
    pub fn queue_packet(&mut self, packet: &Packet) -> io::Result<usize> {
        if self.pending_bytes() >= self.write_limit {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let before = self.write_buf.len();
        packet::encode_packet(packet, &mut self.write_buf);
        Ok(self.write_buf.len() - before)
    }

    /// Write buffered data to the socket. Returns true when the buffer
    /// drained completely.
    pub fn flush(&mut self) -> io::Result<bool> {
        while self.write_pos < self.write_buf.len() {
            match self.socket.write(&self.write_buf[self.write_pos..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.write_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.write_buf.clear();
        self.write_pos = 0;
        Ok(true)
    }

    pub fn has_pending_writes(&self) -> bool {
        self.write_pos < self.write_buf.len()
    }

    fn pending_bytes(&self) -> usize {
        self.write_buf.len() - self.write_pos
    }
}
