//! Admin-facing reactor: accepts admin client connections and shuttles
//! typed requests/replies between the responder tasks and the main loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::messages::{AdminReply, AdminRequest};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, RangemasterError,
};

/// Admin client identifier, assigned at accept time.
pub type ClientId = u64;

/// The admin-facing reactor.
pub struct AdminReactor {
    /// Receiver side of the req channel.
    rx_req: mpsc::UnboundedReceiver<(ClientId, AdminRequest)>,

    /// Map from client ID -> sender side of the reply channel, shared with
    /// the client acceptor task.
    tx_replies:
        flashmap::ReadHandle<ClientId, mpsc::UnboundedSender<AdminReply>>,

    /// Join handle of the client acceptor task.
    _acceptor_handle: JoinHandle<()>,
}

// AdminReactor public API implementation
impl AdminReactor {
    /// Creates the reactor and spawns the client acceptor task on
    /// `admin_addr`.
    pub async fn new_and_setup(
        admin_addr: SocketAddr,
    ) -> Result<Self, RangemasterError> {
        let (tx_req, rx_req) = mpsc::unbounded_channel();
        let (tx_replies_write, tx_replies_read) =
            flashmap::new::<ClientId, mpsc::UnboundedSender<AdminReply>>();

        let listener = tcp_bind_with_retry(admin_addr, 10).await?;
        let acceptor_handle = tokio::spawn(Self::acceptor_task(
            tx_req,
            listener,
            tx_replies_write,
        ));

        Ok(AdminReactor {
            rx_req,
            tx_replies: tx_replies_read,
            _acceptor_handle: acceptor_handle,
        })
    }

    /// Waits for the next admin request from some client.
    pub async fn recv_req(
        &mut self,
    ) -> Result<(ClientId, AdminRequest), RangemasterError> {
        match self.rx_req.recv().await {
            Some((client, req)) => Ok((client, req)),
            None => logged_err!("m"; "admin req channel has been closed"),
        }
    }

    /// Sends a reply to the given admin client.
    pub fn send_reply(
        &mut self,
        reply: AdminReply,
        client: ClientId,
    ) -> Result<(), RangemasterError> {
        let guard = self.tx_replies.guard();
        match guard.get(&client) {
            Some(tx_reply) => {
                tx_reply.send(reply).map_err(RangemasterError::msg)?;
                Ok(())
            }
            None => {
                logged_err!("m"; "admin client {} not connected", client)
            }
        }
    }
}

// AdminReactor acceptor task implementation
impl AdminReactor {
    /// Client acceptor task.
    async fn acceptor_task(
        tx_req: mpsc::UnboundedSender<(ClientId, AdminRequest)>,
        listener: TcpListener,
        mut tx_replies: flashmap::WriteHandle<
            ClientId,
            mpsc::UnboundedSender<AdminReply>,
        >,
    ) {
        pf_debug!("m"; "admin acceptor task spawned");
        let local_addr = listener.local_addr().unwrap();
        pf_info!("m"; "accepting admin clients on '{}'", local_addr);

        let next_client_id = Arc::new(AtomicU64::new(0));
        let (tx_exit, mut rx_exit) = mpsc::unbounded_channel::<ClientId>();

        loop {
            tokio::select! {
                // new admin client connection
                accepted = listener.accept() => {
                    if let Err(e) = accepted {
                        pf_warn!("m"; "error accepting admin client: {}", e);
                        continue;
                    }
                    let (stream, addr) = accepted.unwrap();
                    let client =
                        next_client_id.fetch_add(1, Ordering::AcqRel);
                    pf_debug!("m"; "accepted admin client {} '{}'",
                              client, addr);

                    let (tx_reply, rx_reply) = mpsc::unbounded_channel();
                    let mut guard = tx_replies.guard();
                    guard.insert(client, tx_reply);
                    guard.publish();

                    tokio::spawn(Self::responder_task(
                        client,
                        stream,
                        tx_req.clone(),
                        rx_reply,
                        tx_exit.clone(),
                    ));
                },

                // a responder task exited
                client = rx_exit.recv() => {
                    let Some(client) = client else { break; };
                    let mut guard = tx_replies.guard();
                    guard.remove(client);
                    guard.publish();
                },
            }
        }
    }
}

// AdminReactor responder task implementation
impl AdminReactor {
    /// Reads one admin request from the connection.
    async fn read_req(
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<AdminRequest, RangemasterError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    /// Writes an admin reply through the connection.
    fn write_reply(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        reply: Option<&AdminReply>,
    ) -> Result<bool, RangemasterError> {
        safe_tcp_write(write_buf, write_buf_cursor, conn_write, reply)
    }

    /// Per-client responder task.
    async fn responder_task(
        client: ClientId,
        conn: TcpStream,
        tx_req: mpsc::UnboundedSender<(ClientId, AdminRequest)>,
        mut rx_reply: mpsc::UnboundedReceiver<AdminReply>,
        tx_exit: mpsc::UnboundedSender<ClientId>,
    ) {
        let (mut conn_read, conn_write) = conn.into_split();
        let mut read_buf = BytesMut::new();
        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;

        let mut retrying = false;
        loop {
            tokio::select! {
                // gets a reply to send to the client
                reply = rx_reply.recv(), if !retrying => {
                    match reply {
                        Some(reply) => {
                            match Self::write_reply(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&reply),
                            ) {
                                Ok(true) => {}
                                Ok(false) => {
                                    retrying = true;
                                }
                                Err(e) => {
                                    pf_error!("m"; "error replying -> {}: \
                                                    {}", client, e);
                                }
                            }
                        },
                        None => break,
                    }
                },

                // retrying last unsuccessful reply send
                _ = conn_write.writable(), if retrying => {
                    match Self::write_reply(
                        &mut write_buf,
                        &mut write_buf_cursor,
                        &conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            retrying = false;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            pf_error!("m"; "error retrying reply -> {}: {}",
                                      client, e);
                        }
                    }
                },

                // receives request from the client
                req = Self::read_req(&mut read_buf, &mut conn_read) => {
                    match req {
                        Ok(AdminRequest::Leave) => {
                            // client leaving, reply in place and break
                            let reply = AdminReply::Leave;
                            if Self::write_reply(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&reply),
                            ).is_ok() {
                                pf_debug!("m"; "admin client {} has left",
                                          client);
                            }
                            break;
                        },

                        Ok(req) => {
                            if let Err(e) = tx_req.send((client, req)) {
                                pf_error!("m"; "error forwarding req of \
                                                {}: {}", client, e);
                            }
                        },

                        Err(_e) => {
                            break; // client likely exited ungracefully
                        }
                    }
                }
            }
        }

        if let Err(e) = tx_exit.send(client) {
            pf_error!("m"; "error sending exit notice for {}: {}",
                      client, e);
        }
    }
}
