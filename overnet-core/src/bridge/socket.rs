//! Stream to byte stream bridge.
//!
//! Bytes travel as raw stream messages. An empty message marks end of input
//! so a half-closed local socket can still receive its answer; the bridge
//! closes the stream once both directions have ended.

use std::rc::Rc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::{BridgeFactory, BridgedStream, Control};
use crate::slice::Slice;
use crate::status::Status;

const READ_CHUNK: usize = 16 * 1024;

async fn local_to_network<S, R>(stream: &S, reader: &mut R, chunk: usize) -> Result<(), Status>
where
    S: BridgedStream,
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| Status::from(e).with_context("reading local socket"))?;
        if n == 0 {
            trace!(peer = %stream.peer(), "local end of input");
            return stream.push(Slice::new()).await;
        }
        stream.push(Slice::from_copied(&buf[..n])).await?;
    }
}

/// Returns true when the stream itself closed, false on end of input.
async fn network_to_local<S, W>(stream: &S, writer: &mut W) -> Result<bool, Status>
where
    S: BridgedStream,
    W: AsyncWrite + Unpin,
{
    loop {
        let bytes = match stream.pull().await? {
            Some(bytes) => bytes,
            None => return Ok(true),
        };
        if bytes.is_empty() {
            writer
                .shutdown()
                .await
                .map_err(|e| Status::from(e).with_context("shutting down local socket"))?;
            return Ok(false);
        }
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| Status::from(e).with_context("writing local socket"))?;
        writer
            .flush()
            .await
            .map_err(|e| Status::from(e).with_context("flushing local socket"))?;
    }
}

pub(super) async fn run<S, T>(factory: BridgeFactory, stream: S, io: T, control: Rc<Control>)
where
    S: BridgedStream,
    T: AsyncRead + AsyncWrite + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(io);
    let chunk = READ_CHUNK.min(factory.limits().max_message_size).max(1);
    let status = {
        let outbound = local_to_network(&stream, &mut reader, chunk);
        let inbound = network_to_local(&stream, &mut writer);
        tokio::pin!(outbound, inbound);
        let mut out_done = false;
        let mut in_done = false;
        loop {
            tokio::select! {
                result = &mut outbound, if !out_done => match result {
                    Ok(()) => out_done = true,
                    Err(e) => break e,
                },
                result = &mut inbound, if !in_done => match result {
                    Ok(true) => break Status::ok(),
                    Ok(false) => in_done = true,
                    Err(e) => break e,
                },
                status = control.requested() => break status,
            }
            if out_done && in_done {
                break Status::ok();
            }
        }
    };
    let _ = writer.shutdown().await;
    stream.close(status.clone()).await;
    factory.finished(&control, status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Introduction, ReliabilityAndOrdering};
    use crate::status::StatusCode;
    use crate::stream::Stream;
    use crate::test_util::{connect, endpoint, run_local, LossMode};
    use crate::codec::CodecLimits;

    #[tokio::test(start_paused = true)]
    async fn request_reply_over_half_close() {
        run_local(async {
            let a = endpoint(1);
            let b = endpoint(2);
            connect(&a, &b, LossMode::None);
            let sa = Stream::new(
                a.initiate_stream(b.node_id(), ReliabilityAndOrdering::ReliableOrdered, Introduction::new("tcp"))
                    .unwrap(),
            );
            let sb = Stream::new(b.recv_intro().await.unwrap().new_stream);
            let factory = BridgeFactory::new(CodecLimits::default());
            let (mut client, io_a) = tokio::io::duplex(64);
            let (mut server, io_b) = tokio::io::duplex(64);
            let ha = factory.bind_socket(sa, io_a);
            let hb = factory.bind_socket(sb, io_b);

            let request = vec![7u8; 1000];
            client.write_all(&request).await.unwrap();
            client.shutdown().await.unwrap();
            let mut got = Vec::new();
            server.read_to_end(&mut got).await.unwrap();
            assert_eq!(got, request);

            server.write_all(b"reply").await.unwrap();
            server.shutdown().await.unwrap();
            let mut reply = Vec::new();
            client.read_to_end(&mut reply).await.unwrap();
            assert_eq!(reply, b"reply");

            assert!(ha.closed().await.is_ok());
            assert!(hb.closed().await.is_ok());
            factory.idle().await;
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn remote_failure_closes_socket() {
        run_local(async {
            let a = endpoint(1);
            let b = endpoint(2);
            connect(&a, &b, LossMode::None);
            let sa = Stream::new(
                a.initiate_stream(b.node_id(), ReliabilityAndOrdering::ReliableOrdered, Introduction::new("tcp"))
                    .unwrap(),
            );
            let sb = Stream::new(b.recv_intro().await.unwrap().new_stream);
            let factory = BridgeFactory::new(CodecLimits::default());
            let (mut client, io_a) = tokio::io::duplex(64);
            let ha = factory.bind_socket(sa, io_a);

            sb.close(Status::unavailable("backend down")).await;
            let status = ha.closed().await;
            assert_eq!(status.code(), StatusCode::Unavailable);
            let mut rest = Vec::new();
            client.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        })
        .await;
    }
}
