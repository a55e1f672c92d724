//! Read-only TFTP server (RFC 1350) for devices that pull images over TFTP.
//!
//! Serves the files in a catalog. Supports the `blksize` and `tsize` options (RFC 2347,
//! 2348, 2349); write requests are refused. Each transfer runs on its own
//! ephemeral port as the protocol requires.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::catalog::Catalog;
use crate::error::Result;

const OP_RRQ: u16 = 1;
const OP_WRQ: u16 = 2;
const OP_DATA: u16 = 3;
const OP_ACK: u16 = 4;
const OP_ERROR: u16 = 5;
const OP_OACK: u16 = 6;

const ERR_NOT_FOUND: u16 = 1;
const ERR_ACCESS: u16 = 2;
const ERR_ILLEGAL: u16 = 4;

const DEFAULT_BLKSIZE: usize = 512;
const MIN_BLKSIZE: usize = 8;
const MAX_BLKSIZE: usize = 65464;

const ACK_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_RETRIES: u32 = 5;

#[derive(Debug, PartialEq, Eq)]
enum Packet<'a> {
    Read {
        file: &'a str,
        mode: &'a str,
        options: Vec<(&'a str, &'a str)>,
    },
    Write,
    Ack(u16),
    Error(u16, &'a str),
}

fn parse(buf: &[u8]) -> Option<Packet<'_>> {
    if buf.len() < 4 {
        return None;
    }
    let opcode = u16::from_be_bytes([buf[0], buf[1]]);
    let body = &buf[2..];

    match opcode {
        OP_RRQ => {
            let mut fields = body
                .split(|b| *b == 0)
                .map(|field| std::str::from_utf8(field).ok());
            let file = fields.next()??;
            let mode = fields.next()??;
            let mut options = Vec::new();
            while let (Some(Some(name)), Some(Some(value))) = (fields.next(), fields.next()) {
                if name.is_empty() {
                    break;
                }
                options.push((name, value));
            }
            Some(Packet::Read {
                file,
                mode,
                options,
            })
        }
        OP_WRQ => Some(Packet::Write),
        OP_ACK => Some(Packet::Ack(u16::from_be_bytes([body[0], body[1]]))),
        OP_ERROR => {
            let code = u16::from_be_bytes([body[0], body[1]]);
            let message = std::str::from_utf8(&body[2..])
                .unwrap_or("")
                .trim_end_matches('\0');
            Some(Packet::Error(code, message))
        }
        _ => None,
    }
}

fn data_packet(block: u16, payload: &[u8]) -> Bytes {
    let mut packet = BytesMut::with_capacity(4 + payload.len());
    packet.put_u16(OP_DATA);
    packet.put_u16(block);
    packet.put_slice(payload);
    packet.freeze()
}

fn error_packet(code: u16, message: &str) -> Bytes {
    let mut packet = BytesMut::with_capacity(5 + message.len());
    packet.put_u16(OP_ERROR);
    packet.put_u16(code);
    packet.put_slice(message.as_bytes());
    packet.put_u8(0);
    packet.freeze()
}

fn oack_packet(options: &[(String, String)]) -> Bytes {
    let mut packet = BytesMut::new();
    packet.put_u16(OP_OACK);
    for (name, value) in options {
        packet.put_slice(name.as_bytes());
        packet.put_u8(0);
        packet.put_slice(value.as_bytes());
        packet.put_u8(0);
    }
    packet.freeze()
}

/// Options accepted for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Negotiated {
    blksize: usize,
    acknowledged: Vec<(String, String)>,
}

fn negotiate(options: &[(&str, &str)], size: usize) -> Negotiated {
    let mut negotiated = Negotiated {
        blksize: DEFAULT_BLKSIZE,
        acknowledged: Vec::new(),
    };

    for (name, value) in options {
        match name.to_ascii_lowercase().as_str() {
            "blksize" => {
                if let Ok(requested) = value.parse::<usize>() {
                    if requested >= MIN_BLKSIZE {
                        let blksize = requested.min(MAX_BLKSIZE);
                        negotiated.blksize = blksize;
                        negotiated
                            .acknowledged
                            .push(("blksize".into(), blksize.to_string()));
                    }
                }
            }
            "tsize" => {
                negotiated
                    .acknowledged
                    .push(("tsize".into(), size.to_string()));
            }
            _ => {}
        }
    }

    negotiated
}

/// Serve every file in `catalog` until `shutdown` fires.
pub(super) async fn serve(
    bind: SocketAddr,
    catalog: Catalog,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<(u16, JoinHandle<()>)> {
    let socket = UdpSocket::bind(bind).await?;
    let port = socket.local_addr()?.port();
    debug!("tftp: listening on {}", socket.local_addr()?);

    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; 1024];
        loop {
            let (len, peer) = tokio::select! {
                _ = &mut shutdown => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("tftp: receive failed: {}", e);
                        continue;
                    }
                },
            };

            match parse(&buf[..len]) {
                Some(Packet::Read {
                    file,
                    mode,
                    options,
                }) => {
                    let requested = file.trim_start_matches('/');
                    let Some((data, count)) = catalog.fetch(requested) else {
                        debug!("tftp: {} requested unknown file {:?}", peer, file);
                        let _ = socket
                            .send_to(&error_packet(ERR_NOT_FOUND, "File not found"), peer)
                            .await;
                        continue;
                    };

                    info!(
                        "tftp: {} requested {} ({}, download #{})",
                        peer, requested, mode, count
                    );
                    let negotiated = negotiate(&options, data.len());
                    let local = SocketAddr::new(bind.ip(), 0);
                    tokio::spawn(async move {
                        match send_file(local, peer, data, negotiated).await {
                            Ok(()) => info!("tftp: transfer to {} complete", peer),
                            Err(e) => warn!("tftp: transfer to {} failed: {}", peer, e),
                        }
                    });
                }
                Some(Packet::Write) => {
                    let _ = socket
                        .send_to(&error_packet(ERR_ACCESS, "Read-only server"), peer)
                        .await;
                }
                _ => {
                    let _ = socket
                        .send_to(&error_packet(ERR_ILLEGAL, "Illegal operation"), peer)
                        .await;
                }
            }
        }
        debug!("tftp: server stopped");
    });

    Ok((port, task))
}

/// Send `packet` and wait for an ACK of `block`, retransmitting on timeout.
async fn send_and_await_ack(socket: &UdpSocket, packet: &[u8], block: u16) -> io::Result<()> {
    let mut buf = [0u8; 516];

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            debug!("tftp: retransmitting block {} (attempt {})", block, attempt);
        }
        socket.send(packet).await?;

        let deadline = tokio::time::Instant::now() + ACK_TIMEOUT;
        loop {
            let len = match tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => break,
            };
            match parse(&buf[..len]) {
                Some(Packet::Ack(acked)) if acked == block => return Ok(()),
                // Duplicate ACK for an earlier block
                Some(Packet::Ack(_)) => continue,
                Some(Packet::Error(code, message)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        format!("client error {}: {}", code, message),
                    ));
                }
                _ => continue,
            }
        }
    }

    Err(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("no ACK for block {}", block),
    ))
}

async fn send_file(
    local: SocketAddr,
    peer: SocketAddr,
    data: Bytes,
    negotiated: Negotiated,
) -> io::Result<()> {
    let socket = UdpSocket::bind(local).await?;
    socket.connect(peer).await?;

    if !negotiated.acknowledged.is_empty() {
        send_and_await_ack(&socket, &oack_packet(&negotiated.acknowledged), 0).await?;
    }

    let blksize = negotiated.blksize;
    let mut block: u16 = 1;
    let mut offset = 0usize;

    loop {
        let end = (offset + blksize).min(data.len());
        let payload = &data[offset..end];
        send_and_await_ack(&socket, &data_packet(block, payload), block).await?;

        // A short block (possibly empty) ends the transfer
        if payload.len() < blksize {
            return Ok(());
        }
        offset = end;
        block = block.wrapping_add(1);
    }
}
