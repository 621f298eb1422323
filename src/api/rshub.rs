//! Region-server-facing hub: accepts server connections, learns each
//! server's identity from its first message (fixing up the public address
//! observed on the socket), and shuttles typed requests/replies between the
//! connection tasks and the main loop.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::messages::{RsReply, RsRequest};
use crate::master::ServerName;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, RangemasterError,
};

/// Registration message from a server controller task to the acceptor.
struct Registration {
    name: ServerName,
    tx_send: mpsc::UnboundedSender<RsReply>,
    first_req: RsRequest,
}

/// The region-server-facing hub.
pub struct RegionServerHub {
    /// Receiver side of the recv channel.
    rx_recv: mpsc::UnboundedReceiver<(ServerName, RsRequest)>,

    /// Map from server name -> sender side of that server's reply channel,
    /// shared with the acceptor task.
    tx_sends: flashmap::ReadHandle<ServerName, mpsc::UnboundedSender<RsReply>>,

    /// Join handle of the acceptor task.
    _acceptor_handle: JoinHandle<()>,
}

// RegionServerHub public API implementation
impl RegionServerHub {
    /// Creates the hub and spawns the server acceptor task on `rs_addr`.
    pub async fn new_and_setup(
        rs_addr: SocketAddr,
    ) -> Result<Self, RangemasterError> {
        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        let (tx_sends_write, tx_sends_read) =
            flashmap::new::<ServerName, mpsc::UnboundedSender<RsReply>>();

        let listener = tcp_bind_with_retry(rs_addr, 10).await?;
        let acceptor_handle = tokio::spawn(Self::acceptor_task(
            tx_recv,
            listener,
            tx_sends_write,
        ));

        Ok(RegionServerHub {
            rx_recv,
            tx_sends: tx_sends_read,
            _acceptor_handle: acceptor_handle,
        })
    }

    /// Whether a server is currently connected.
    pub fn has_server(&self, name: &ServerName) -> bool {
        let guard = self.tx_sends.guard();
        guard.contains_key(name)
    }

    /// Waits for the next request from some server.
    pub async fn recv_req(
        &mut self,
    ) -> Result<(ServerName, RsRequest), RangemasterError> {
        match self.rx_recv.recv().await {
            Some((name, req)) => Ok((name, req)),
            None => logged_err!("m"; "rs recv channel has been closed"),
        }
    }

    /// Sends a reply to the named server.
    pub fn send_reply(
        &mut self,
        reply: RsReply,
        name: &ServerName,
    ) -> Result<(), RangemasterError> {
        let guard = self.tx_sends.guard();
        match guard.get(name) {
            Some(tx_send) => {
                tx_send.send(reply).map_err(RangemasterError::msg)?;
                Ok(())
            }
            None => {
                logged_err!("m"; "server '{}' not connected", name)
            }
        }
    }
}

// RegionServerHub acceptor task implementation
impl RegionServerHub {
    /// Server acceptor task: accepts connections, spawns a controller task
    /// per connection, and owns the registration of controller senders so
    /// that a server's first request is only surfaced after its reply
    /// channel is reachable.
    async fn acceptor_task(
        tx_recv: mpsc::UnboundedSender<(ServerName, RsRequest)>,
        listener: TcpListener,
        mut tx_sends: flashmap::WriteHandle<
            ServerName,
            mpsc::UnboundedSender<RsReply>,
        >,
    ) {
        pf_debug!("m"; "rs acceptor task spawned");
        let local_addr = listener.local_addr().unwrap();
        pf_info!("m"; "accepting region servers on '{}'", local_addr);

        let (tx_register, mut rx_register) =
            mpsc::unbounded_channel::<Registration>();
        let (tx_exit, mut rx_exit) = mpsc::unbounded_channel::<ServerName>();

        loop {
            tokio::select! {
                // new region server connection
                accepted = listener.accept() => {
                    if let Err(e) = accepted {
                        pf_warn!("m"; "error accepting rs connection: {}", e);
                        continue;
                    }
                    let (stream, addr) = accepted.unwrap();
                    tokio::spawn(Self::controller_task(
                        stream,
                        addr,
                        tx_recv.clone(),
                        tx_register.clone(),
                        tx_exit.clone(),
                    ));
                },

                // a controller task learned its server's identity
                registration = rx_register.recv() => {
                    let Some(registration) = registration else { break; };
                    let Registration { name, tx_send, first_req } =
                        registration;
                    let mut guard = tx_sends.guard();
                    // a reconnection supersedes the previous controller
                    guard.insert(name.clone(), tx_send);
                    guard.publish();
                    if let Err(e) = tx_recv.send((name, first_req)) {
                        pf_error!("m"; "error forwarding first req: {}", e);
                    }
                },

                // a controller task exited
                name = rx_exit.recv() => {
                    let Some(name) = name else { break; };
                    let mut guard = tx_sends.guard();
                    // only deregister if no newer controller took the name
                    let stale = guard
                        .get(&name)
                        .map(|tx| tx.is_closed())
                        .unwrap_or(false);
                    if stale {
                        guard.remove(name);
                    }
                    guard.publish();
                },
            }
        }
    }
}

// RegionServerHub controller task implementation
impl RegionServerHub {
    /// Reads one request from the connection.
    async fn read_req(
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<RsRequest, RangemasterError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    /// Writes a reply through the connection.
    fn write_reply(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        reply: Option<&RsReply>,
    ) -> Result<bool, RangemasterError> {
        safe_tcp_write(write_buf, write_buf_cursor, conn_write, reply)
    }

    /// The server's identity from its first request. The address a server
    /// declares is likely its local view; overwrite the host with the
    /// remote IP observed on the socket so directives go somewhere real.
    fn identify(req: RsRequest, addr: SocketAddr) -> (ServerName, RsRequest) {
        match req {
            RsRequest::Startup { mut info } => {
                info.host = addr.ip().to_string();
                (info.server_name(), RsRequest::Startup { info })
            }
            RsRequest::Report {
                info,
                msgs,
                hot_regions,
            } => (
                info.server_name(),
                RsRequest::Report {
                    info,
                    msgs,
                    hot_regions,
                },
            ),
        }
    }

    /// Per-connection controller task.
    async fn controller_task(
        conn: TcpStream,
        addr: SocketAddr,
        tx_recv: mpsc::UnboundedSender<(ServerName, RsRequest)>,
        tx_register: mpsc::UnboundedSender<Registration>,
        tx_exit: mpsc::UnboundedSender<ServerName>,
    ) {
        pf_debug!("m"; "rs controller task for '{}' spawned", addr);

        let (mut conn_read, conn_write) = conn.into_split();
        let mut read_buf = BytesMut::new();
        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;

        // identity comes from the first request
        let first_req: RsRequest =
            match Self::read_req(&mut read_buf, &mut conn_read).await {
                Ok(req) => req,
                Err(_e) => {
                    pf_debug!("m"; "rs connection '{}' closed early", addr);
                    return;
                }
            };
        let (name, first_req) = Self::identify(first_req, addr);

        let (tx_send, mut rx_send) = mpsc::unbounded_channel();
        if tx_register
            .send(Registration {
                name: name.clone(),
                tx_send,
                first_req,
            })
            .is_err()
        {
            return; // hub is being torn down
        }

        let mut retrying = false;
        loop {
            tokio::select! {
                // gets a reply to send to the server
                reply = rx_send.recv(), if !retrying => {
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
                                    pf_debug!("m"; "start retrying reply \
                                                    send -> '{}'", name);
                                    retrying = true;
                                }
                                Err(e) => {
                                    pf_error!("m"; "error sending -> '{}': \
                                                    {}", name, e);
                                }
                            }
                        },
                        None => break, // channel closed and no replies remain
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
                            pf_debug!("m"; "finished retrying last reply \
                                            send -> '{}'", name);
                            retrying = false;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            pf_error!("m"; "error retrying reply -> '{}': \
                                            {}", name, e);
                        }
                    }
                },

                // receives request from the server
                req = Self::read_req(&mut read_buf, &mut conn_read) => {
                    match req {
                        Ok(req) => {
                            let (req_name, req) =
                                Self::identify(req, addr);
                            if let Err(e) =
                                tx_recv.send((req_name, req))
                            {
                                pf_error!("m"; "error forwarding req of \
                                                '{}': {}", name, e);
                            }
                        },
                        Err(_e) => {
                            // server likely exited without niceties
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = tx_exit.send(name.clone()) {
            pf_error!("m"; "error sending exit notice for '{}': {}", name, e);
        }
        pf_debug!("m"; "rs controller task for '{}' '{}' exited", name, addr);
    }
}

/// Region-server-side counterpart used by servers (and tests) to reach the
/// master: one connection, synchronous request/reply.
pub struct RegionServerStub {
    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,
    read_buf: BytesMut,
    write_buf: BytesMut,
    write_buf_cursor: usize,
}

impl RegionServerStub {
    /// Connects to the master's region-server port.
    pub async fn connect(
        master_addr: SocketAddr,
    ) -> Result<Self, RangemasterError> {
        let conn = crate::utils::tcp_connect_with_retry(master_addr, 10)
            .await?;
        let (conn_read, conn_write) = conn.into_split();
        Ok(RegionServerStub {
            conn_read,
            conn_write,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            write_buf_cursor: 0,
        })
    }

    /// Sends a request and waits for the master's reply.
    pub async fn request(
        &mut self,
        req: &RsRequest,
    ) -> Result<RsReply, RangemasterError> {
        let mut done = safe_tcp_write(
            &mut self.write_buf,
            &mut self.write_buf_cursor,
            &self.conn_write,
            Some(req),
        )?;
        while !done {
            self.conn_write
                .as_ref()
                .writable()
                .await
                .map_err(RangemasterError::from)?;
            done = safe_tcp_write(
                &mut self.write_buf,
                &mut self.write_buf_cursor,
                &self.conn_write,
                None::<&RsRequest>,
            )?;
        }
        safe_tcp_read(&mut self.read_buf, &mut self.conn_read).await
    }
}
