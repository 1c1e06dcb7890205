use super::{OP_CLOSE, OP_OPEN, OP_READ, OP_SIZE, OP_SYNC, OP_WRITE};
use crate::{rpc::Handlers, source::Source};
use bytes::{Buf, BufMut, Bytes, BytesMut};

fn put_u64(value: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u64(value);
    buf.freeze()
}

/// Register handlers that serve `source` to the peer.
///
/// Every operation of the [Source] contract becomes one handler; failures
/// travel back as error replies (status values on the caller's side),
/// never as teardowns. Read replies must fit the connection's maximum
/// message size, so peers should keep their read batches within it.
pub fn attach<S: Source>(handlers: &mut Handlers, source: S) {
    {
        let source = source.clone();
        handlers.register(OP_OPEN, move |_| {
            let source = source.clone();
            async move {
                let size = source.size().await.map_err(|err| err.to_string())?;
                Ok(put_u64(size))
            }
        });
    }
    {
        let source = source.clone();
        handlers.register(OP_READ, move |mut request: Bytes| {
            let source = source.clone();
            async move {
                if request.len() != 16 {
                    return Err("malformed read request".to_string());
                }
                let offset = request.get_u64();
                let len = request.get_u64() as usize;
                source
                    .read_at(offset, len)
                    .await
                    .map_err(|err| err.to_string())
            }
        });
    }
    {
        let source = source.clone();
        handlers.register(OP_WRITE, move |mut request: Bytes| {
            let source = source.clone();
            async move {
                if request.len() < 8 {
                    return Err("malformed write request".to_string());
                }
                let offset = request.get_u64();
                let written = source
                    .write_at(request, offset)
                    .await
                    .map_err(|err| err.to_string())?;
                Ok(put_u64(written as u64))
            }
        });
    }
    {
        let source = source.clone();
        handlers.register(OP_SIZE, move |_| {
            let source = source.clone();
            async move {
                let size = source.size().await.map_err(|err| err.to_string())?;
                Ok(put_u64(size))
            }
        });
    }
    {
        let source = source.clone();
        handlers.register(OP_SYNC, move |_| {
            let source = source.clone();
            async move {
                source.sync().await.map_err(|err| err.to_string())?;
                Ok(Bytes::new())
            }
        });
    }
    // The source is shared with every other handler, so "close" persists
    // pending writes rather than releasing it.
    handlers.register(OP_CLOSE, move |_| {
        let source = source.clone();
        async move {
            source.sync().await.map_err(|err| err.to_string())?;
            Ok(Bytes::new())
        }
    });
}
