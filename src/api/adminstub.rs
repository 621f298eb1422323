//! Admin client stub: one connection to the master's admin port with
//! synchronous request/reply, used by the CLI tool and tests.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::api::messages::{AdminReply, AdminRequest};
use crate::catalog::FamilySchema;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_connect_with_retry, RangemasterError,
};

/// Admin client connection to the master.
pub struct AdminClient {
    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,
    read_buf: BytesMut,
    write_buf: BytesMut,
    write_buf_cursor: usize,
}

impl AdminClient {
    /// Connects to the master's admin port.
    pub async fn connect(
        admin_addr: SocketAddr,
    ) -> Result<Self, RangemasterError> {
        let conn = tcp_connect_with_retry(admin_addr, 10).await?;
        let (conn_read, conn_write) = conn.into_split();
        Ok(AdminClient {
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
        req: &AdminRequest,
    ) -> Result<AdminReply, RangemasterError> {
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
                None::<&AdminRequest>,
            )?;
        }
        safe_tcp_read(&mut self.read_buf, &mut self.conn_read).await
    }

    /// Adds one column family to a table (single-step alter).
    pub async fn add_column(
        &mut self,
        table: &str,
        family: FamilySchema,
    ) -> Result<AdminReply, RangemasterError> {
        self.request(&AdminRequest::AlterTable {
            table: table.into(),
            adds: vec![family],
            mods: vec![],
            drops: vec![],
        })
        .await
    }

    /// Replaces one column family's schema (single-step alter).
    pub async fn modify_column(
        &mut self,
        table: &str,
        family_name: &str,
        family: FamilySchema,
    ) -> Result<AdminReply, RangemasterError> {
        self.request(&AdminRequest::AlterTable {
            table: table.into(),
            adds: vec![],
            mods: vec![(family_name.into(), family)],
            drops: vec![],
        })
        .await
    }

    /// Drops one column family from a table (single-step alter).
    pub async fn delete_column(
        &mut self,
        table: &str,
        family_name: &str,
    ) -> Result<AdminReply, RangemasterError> {
        self.request(&AdminRequest::AlterTable {
            table: table.into(),
            adds: vec![],
            mods: vec![],
            drops: vec![family_name.into()],
        })
        .await
    }

    /// Sends the leave notification and waits for the goodbye.
    pub async fn leave(&mut self) -> Result<(), RangemasterError> {
        match self.request(&AdminRequest::Leave).await? {
            AdminReply::Leave => Ok(()),
            reply => Err(RangemasterError::msg(format!(
                "unexpected reply to leave: {:?}",
                reply
            ))),
        }
    }
}
