//! The handler task: the worker-side unit that actually processes requests.
//!
//! A handler spends its life blocked on its control channel waiting for the
//! supervisor to hand it a request frame. For each frame it produces a
//! response through [`super::service`], writes it directly on the shared
//! upstream socket and then announces completion with a [`HandlerRecord`] on
//! the completion channel. That record is what flips the handler back to
//! FREE in the supervisor's books; a handler is FREE exactly while it is
//! parked in `recv()`.

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, error, info};
use rand::Rng;
use tokio::{net::tcp::OwnedWriteHalf, sync::mpsc, sync::Mutex};

use crate::http;

use super::service;

/// FREE/BUSY discipline of one handler, tracked by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    /// Blocked reading the control channel, ready for work.
    Free,

    /// A request has been written to its control channel and no completion
    /// record has come back yet.
    Busy,
}

/// Completion message a handler sends after answering a request.
#[derive(Debug, Clone, Copy)]
pub struct HandlerRecord {
    pub index: usize,
    pub status: HandlerStatus,
}

/// Everything a handler needs besides its control channel.
pub(crate) struct Context {
    /// Position in the pool, echoed in every completion record.
    pub index: usize,

    /// Capacity advertised in SERVERCHECK responses.
    pub max_load: usize,

    /// Exit cleanly with probability `1/chaos_exit` after a completed
    /// request; 0 disables the roll.
    pub chaos_exit: u32,

    /// Write half of the balancer-facing socket, shared by all handlers.
    pub writer: Arc<Mutex<OwnedWriteHalf>>,

    /// Completion channel back to the supervisor.
    pub completions: mpsc::Sender<HandlerRecord>,
}

/// Body of a handler task. Returns when the control channel is closed (the
/// supervisor dropped it), on an unrecoverable write failure, or on a chaos
/// roll.
pub(crate) async fn run(ctx: Context, mut requests: mpsc::Receiver<Bytes>) {
    while let Some(frame) = requests.recv().await {
        let response = service::respond(&frame, ctx.max_load).await;
        let encoded = response.encode();

        {
            let mut writer = ctx.writer.lock().await;
            if let Err(err) = http::write_frame(&mut *writer, &encoded).await {
                error!("handler {} failed to write its response: {err}", ctx.index);
                return;
            }
        }

        let record = HandlerRecord {
            index: ctx.index,
            status: HandlerStatus::Free,
        };

        if ctx.completions.send(record).await.is_err() {
            return;
        }

        if ctx.chaos_exit > 0 && rand::thread_rng().gen_ratio(1, ctx.chaos_exit) {
            info!("handler {} exiting on a chaos roll", ctx.index);
            return;
        }
    }

    debug!("handler {} control channel closed", ctx.index);
}
