use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt};
use kameo::error::ActorStopReason;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tokio::sync::watch;
use tracing::debug;

use super::{DisconnectReason, TerminalLatch};
use crate::core::{ClientError, ClientResult, WsFrame};

/// Writer actor that owns the transport sink and serializes outgoing frames.
///
/// Every write is bounded by the session's write timeout. A failed or timed-out write fails
/// the whole session through the shared terminal latch.
pub struct SessionWriter<W>
where
    W: Sink<WsFrame, Error = ClientError> + Send + Sync + Unpin + 'static,
{
    writer: W,
    write_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
    latch: Arc<TerminalLatch>,
}

impl<W> SessionWriter<W>
where
    W: Sink<WsFrame, Error = ClientError> + Send + Sync + Unpin + 'static,
{
    pub(crate) fn new(
        writer: W,
        write_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
        latch: Arc<TerminalLatch>,
    ) -> Self {
        Self {
            writer,
            write_timeout,
            shutdown_rx,
            latch,
        }
    }
}

impl<W> Actor for SessionWriter<W>
where
    W: Sink<WsFrame, Error = ClientError> + Send + Sync + Unpin + 'static,
{
    type Args = Self;
    type Error = ClientError;

    async fn on_start(args: Self::Args, _ctx: ActorRef<Self>) -> Result<Self, Self::Error> {
        Ok(args)
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        _reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        if tokio::time::timeout(self.write_timeout, self.writer.close())
            .await
            .is_err()
        {
            debug!(target: "session-writer", "transport close timed out");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct WriterWrite {
    pub frame: WsFrame,
}

impl<W> KameoMessage<WriterWrite> for SessionWriter<W>
where
    W: Sink<WsFrame, Error = ClientError> + Send + Sync + Unpin + 'static,
{
    type Reply = ClientResult<()>;

    async fn handle(
        &mut self,
        msg: WriterWrite,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if *self.shutdown_rx.borrow() {
            return Err(ClientError::ClientDisconnected);
        }
        debug!(target: "session-writer", "sending frame to wire");
        match tokio::time::timeout(self.write_timeout, self.writer.send(msg.frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.latch.fail(DisconnectReason::Failed(err.clone()));
                Err(err)
            }
            Err(_) => {
                self.latch.fail(DisconnectReason::Timeout);
                Err(ClientError::Timeout)
            }
        }
    }
}
