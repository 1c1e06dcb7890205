use super::{OP_CLOSE, OP_OPEN, OP_READ, OP_SIZE, OP_SYNC, OP_WRITE};
use crate::{
    rpc::{self, Connection},
    source::{Error, Source},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

fn rpc_error(err: rpc::Error) -> Error {
    match err {
        rpc::Error::Closed | rpc::Error::ConnectionFailed => Error::Closed,
        rpc::Error::Remote(message) => Error::Remote(message),
        other => Error::Remote(other.to_string()),
    }
}

fn get_u64(mut reply: Bytes) -> Result<u64, Error> {
    if reply.len() != 8 {
        return Err(Error::Remote("malformed reply".to_string()));
    }
    Ok(reply.get_u64())
}

/// A [Source] whose bytes live on the other end of a [Connection].
///
/// Every operation is one synchronous call; the connection's half-duplex
/// discipline serializes them. The peer must have the serving handlers
/// registered (see [super::attach]).
#[derive(Clone)]
pub struct RemoteSource {
    connection: Arc<Connection>,
}

impl RemoteSource {
    /// Perform the `open` round trip and return the source together with
    /// the dataset size the peer reported.
    pub async fn open(connection: Arc<Connection>) -> Result<(Self, u64), Error> {
        let reply = connection
            .call(OP_OPEN, Bytes::new())
            .await
            .map_err(rpc_error)?;
        let size = get_u64(reply)?;
        Ok((Self { connection }, size))
    }
}

impl Source for RemoteSource {
    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, Error> {
        let mut request = BytesMut::with_capacity(16);
        request.put_u64(offset);
        request.put_u64(len as u64);
        self.connection
            .call(OP_READ, request.freeze())
            .await
            .map_err(rpc_error)
    }

    async fn write_at(&self, buf: Bytes, offset: u64) -> Result<usize, Error> {
        let mut request = BytesMut::with_capacity(8 + buf.len());
        request.put_u64(offset);
        request.put_slice(&buf);
        let reply = self
            .connection
            .call(OP_WRITE, request.freeze())
            .await
            .map_err(rpc_error)?;
        Ok(get_u64(reply)? as usize)
    }

    async fn size(&self) -> Result<u64, Error> {
        let reply = self
            .connection
            .call(OP_SIZE, Bytes::new())
            .await
            .map_err(rpc_error)?;
        get_u64(reply)
    }

    async fn sync(&self) -> Result<(), Error> {
        self.connection
            .call(OP_SYNC, Bytes::new())
            .await
            .map_err(rpc_error)?;
        Ok(())
    }

    async fn close(self) -> Result<(), Error> {
        self.connection
            .call(OP_CLOSE, Bytes::new())
            .await
            .map_err(rpc_error)?;
        Ok(())
    }
}
