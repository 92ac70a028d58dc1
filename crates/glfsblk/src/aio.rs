//! Completion handoff between the client library's threads and the host.
//!
//! Block-layer requests run as futures on the host's I/O thread. The client
//! library completes requests on its own worker threads, which must never wake
//! host state directly. Every completion therefore goes through a
//! [`BottomHalf`]: the worker thread schedules it on the [`AioContext`], and
//! the [`AioDispatcher`] running on the host thread executes it, which in turn
//! wakes the suspended request.
//!
//! ```text
//!  host thread                       library worker thread
//!  -----------                       ---------------------
//!  submit_aio: allocate record
//!  submit(cb) ----------------------> request runs
//!  yield (Pending)                    cb(ret): classify, store ret,
//!                                     bh_new + schedule
//!  dispatcher runs bh  <--------------
//!    complete_aio: delete bh, wake
//!  resume: read ret, drop record
//! ```

use core::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::task::AtomicWaker;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::error::{GlusterError, Result};
use crate::glfs::{AioCallback, Errno};

type BhCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// The host I/O context that bottom halves are scheduled on.
///
/// Cheap to clone; clones feed the same [`AioDispatcher`].
#[derive(Clone)]
pub struct AioContext {
    tx: mpsc::UnboundedSender<BottomHalf>,
}

impl AioContext {
    /// Creates a context and the dispatcher that must run on the host's I/O
    /// thread.
    pub fn new() -> (AioContext, AioDispatcher) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AioContext { tx }, AioDispatcher { rx })
    }
}

impl fmt::Debug for AioContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AioContext")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Runs scheduled bottom halves. Owned by the host's I/O thread.
pub struct AioDispatcher {
    rx: mpsc::UnboundedReceiver<BottomHalf>,
}

impl AioDispatcher {
    /// Runs bottom halves until every [`AioContext`] handle is gone.
    pub async fn run(&mut self) {
        while let Some(bh) = self.rx.recv().await {
            bh.run();
        }
    }

    /// Runs bottom halves while driving `fut` on the same thread, and returns
    /// its output.
    pub async fn run_until<F: Future>(&mut self, fut: F) -> F::Output {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                out = &mut fut => return out,
                Some(bh) = self.rx.recv() => bh.run(),
            }
        }
    }

    /// Runs every bottom half already scheduled without waiting for more, and
    /// returns how many ran.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(bh) = self.rx.try_recv() {
            bh.run();
            ran += 1;
        }
        ran
    }
}

struct BhInner {
    ctx: AioContext,
    cb: Mutex<Option<BhCallback>>,
    scheduled: AtomicBool,
    deleted: AtomicBool,
}

/// A deferred callable bound to one [`AioContext`].
///
/// [`schedule`](BottomHalf::schedule) may be called from any thread; the
/// callable only ever runs on the thread driving the context's dispatcher.
/// Scheduling an already pending bottom half is a no-op.
#[derive(Clone)]
pub struct BottomHalf {
    inner: Arc<BhInner>,
}

impl BottomHalf {
    /// Creates an unscheduled bottom half (`bh_new`).
    pub fn new<F>(ctx: &AioContext, cb: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        BottomHalf {
            inner: Arc::new(BhInner {
                ctx: ctx.clone(),
                cb: Mutex::new(Some(Arc::new(cb))),
                scheduled: AtomicBool::new(false),
                deleted: AtomicBool::new(false),
            }),
        }
    }

    /// Queues the bottom half to run once on the context's thread.
    pub fn schedule(&self) {
        if self.inner.deleted.load(Ordering::Acquire) {
            return;
        }
        if self.inner.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.inner.ctx.tx.send(self.clone()).is_err() {
            self.inner.scheduled.store(false, Ordering::Release);
            warn!("bottom half scheduled after its dispatcher was dropped");
        }
    }

    /// Cancels the bottom half and drops its callable. It never runs again.
    pub fn delete(&self) {
        self.inner.deleted.store(true, Ordering::Release);
        self.inner.cb.lock().take();
    }

    /// Returns true once [`delete`](BottomHalf::delete) has been called.
    pub fn is_deleted(&self) -> bool {
        self.inner.deleted.load(Ordering::Acquire)
    }

    fn run(&self) {
        self.inner.scheduled.store(false, Ordering::Release);
        if self.is_deleted() {
            return;
        }
        // Clone out so the callable may delete its own bottom half.
        let cb = self.inner.cb.lock().clone();
        if let Some(cb) = cb {
            cb();
        }
    }
}

/// Per-request completion record.
///
/// Shared by the submitting future and the completion callback. The callback
/// only stores `ret` and `bh`; the record is released when the submitter
/// drops the last reference after resuming.
pub struct GlusterAiocb {
    size: i64,
    ret: AtomicI32,
    bh: Mutex<Option<BottomHalf>>,
    waiter: AtomicWaker,
    complete: AtomicBool,
}

impl GlusterAiocb {
    /// A fresh record expecting `size` bytes (0 when no byte count applies).
    pub fn new(size: i64) -> Self {
        Self {
            size,
            ret: AtomicI32::new(0),
            bh: Mutex::new(None),
            waiter: AtomicWaker::new(),
            complete: AtomicBool::new(false),
        }
    }

    /// Expected byte count.
    pub fn size(&self) -> i64 {
        self.size
    }

    /// Classified result: 0 or a negative error number.
    pub fn ret(&self) -> i32 {
        self.ret.load(Ordering::Acquire)
    }

    /// Returns true once the completion has been delivered on the host thread.
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Future that resolves to the classified result once the record's
    /// bottom half has run.
    pub fn wait(&self) -> AioWait<'_> {
        AioWait { acb: self }
    }
}

impl fmt::Debug for GlusterAiocb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlusterAiocb")
            .field("size", &self.size)
            .field("ret", &self.ret())
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Suspends a request until its completion arrives. See [`GlusterAiocb::wait`].
pub struct AioWait<'a> {
    acb: &'a GlusterAiocb,
}

impl Future for AioWait<'_> {
    type Output = i32;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<i32> {
        if self.acb.is_complete() {
            return Poll::Ready(self.acb.ret());
        }
        self.acb.waiter.register(cx.waker());
        if self.acb.is_complete() {
            Poll::Ready(self.acb.ret())
        } else {
            Poll::Pending
        }
    }
}

/// Maps a library completion onto the block layer's result.
///
/// The full byte count, or 0, is success. A negative value is an error number
/// and passes through. Anything in between is a short transfer and becomes
/// `-EIO`.
pub fn classify_completion(ret: isize, size: i64) -> i32 {
    if ret == 0 || ret as i64 == size {
        0
    } else if ret < 0 {
        ret as i32
    } else {
        -libc::EIO
    }
}

fn complete_aio(acb: &GlusterAiocb) {
    let bh = acb.bh.lock().take();
    if let Some(bh) = bh {
        bh.delete();
    }
    acb.complete.store(true, Ordering::Release);
    acb.waiter.wake();
}

/// Completion callback body. Runs on a library worker thread.
///
/// Stores the classified result and schedules a bottom half on `ctx` that
/// wakes the submitter. The record is neither freed nor resumed here.
pub fn gluster_finish_aiocb(ctx: &AioContext, acb: Arc<GlusterAiocb>, ret: isize) {
    acb.ret
        .store(classify_completion(ret, acb.size), Ordering::Release);
    trace!(ret, size = acb.size, "gluster aio completed");

    // The record owns its bottom half; the bottom half refers back weakly.
    let bh = {
        let acb = Arc::downgrade(&acb);
        BottomHalf::new(ctx, move || {
            if let Some(acb) = acb.upgrade() {
                complete_aio(&acb);
            }
        })
    };
    *acb.bh.lock() = Some(bh.clone());
    bh.schedule();
}

/// Submits one asynchronous library call and waits for its completion.
///
/// `submit` receives the completion callback to hand to the library. A
/// synchronous error means the callback will never run and is returned at
/// once. Dropping the returned future before it resolves leaks nothing but
/// leaves the request running; callers must not do it.
pub async fn submit_aio<F>(ctx: &AioContext, op: &'static str, size: i64, submit: F) -> Result<()>
where
    F: FnOnce(AioCallback) -> std::result::Result<(), Errno>,
{
    let acb = Arc::new(GlusterAiocb::new(size));
    let cb: AioCallback = {
        let ctx = ctx.clone();
        let acb = Arc::clone(&acb);
        Box::new(move |ret| gluster_finish_aiocb(&ctx, acb, ret))
    };

    if let Err(errno) = submit(cb) {
        return Err(GlusterError::Aio { op, errno });
    }

    match acb.wait().await {
        0 => Ok(()),
        ret => Err(GlusterError::Aio {
            op,
            errno: Errno(-ret),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn foreign_completion(cb: AioCallback, ret: isize) {
        thread::spawn(move || cb(ret));
    }

    #[test]
    fn test_classify_completion() {
        assert_eq!(classify_completion(0, 4096), 0);
        assert_eq!(classify_completion(4096, 4096), 0);
        assert_eq!(classify_completion(0, 0), 0);
        assert_eq!(classify_completion(-(libc::ENOSPC as isize), 4096), -libc::ENOSPC);
        assert_eq!(classify_completion(2048, 4096), -libc::EIO);
        assert_eq!(classify_completion(1, 4096), -libc::EIO);
    }

    #[test]
    fn test_bottom_half_runs_once_per_schedule() {
        let (ctx, mut dispatcher) = AioContext::new();
        let count = Arc::new(AtomicUsize::new(0));
        let bh = {
            let count = Arc::clone(&count);
            BottomHalf::new(&ctx, move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        bh.schedule();
        bh.schedule();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.dispatch_pending(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        bh.schedule();
        dispatcher.dispatch_pending();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_deleted_bottom_half_never_runs() {
        let (ctx, mut dispatcher) = AioContext::new();
        let count = Arc::new(AtomicUsize::new(0));
        let bh = {
            let count = Arc::clone(&count);
            BottomHalf::new(&ctx, move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        bh.schedule();
        bh.delete();
        dispatcher.dispatch_pending();
        bh.schedule();
        assert_eq!(dispatcher.dispatch_pending(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(bh.is_deleted());
    }

    #[test]
    fn test_schedule_after_dispatcher_dropped_is_harmless() {
        let (ctx, dispatcher) = AioContext::new();
        drop(dispatcher);
        let bh = BottomHalf::new(&ctx, || {});
        bh.schedule();
        assert!(!bh.is_deleted());
    }

    #[test]
    fn test_bottom_half_runs_on_dispatcher_thread() {
        let (ctx, mut dispatcher) = AioContext::new();
        let ran_on = Arc::new(Mutex::new(None));
        let bh = {
            let ran_on = Arc::clone(&ran_on);
            BottomHalf::new(&ctx, move || {
                *ran_on.lock() = Some(thread::current().id());
            })
        };

        let scheduler = bh.clone();
        thread::spawn(move || scheduler.schedule()).join().unwrap();
        assert!(ran_on.lock().is_none());

        dispatcher.dispatch_pending();
        assert_eq!(*ran_on.lock(), Some(thread::current().id()));
    }

    #[tokio::test]
    async fn test_submit_aio_full_transfer() {
        let (ctx, mut dispatcher) = AioContext::new();
        let res = dispatcher
            .run_until(submit_aio(&ctx, "pwritev", 65536, |cb| {
                foreign_completion(cb, 65536);
                Ok(())
            }))
            .await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn test_submit_aio_partial_write_is_eio() {
        let (ctx, mut dispatcher) = AioContext::new();
        let err = dispatcher
            .run_until(submit_aio(&ctx, "pwritev", 65536, |cb| {
                foreign_completion(cb, 32768);
                Ok(())
            }))
            .await
            .unwrap_err();
        assert_eq!(err.to_negative_errno(), -libc::EIO);
    }

    #[tokio::test]
    async fn test_submit_aio_propagates_remote_error() {
        let (ctx, mut dispatcher) = AioContext::new();
        let err = dispatcher
            .run_until(submit_aio(&ctx, "fsync", 0, |cb| {
                foreign_completion(cb, -(libc::ENOTCONN as isize));
                Ok(())
            }))
            .await
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOTCONN);
    }

    #[tokio::test]
    async fn test_submit_aio_sync_failure_skips_wait() {
        let (ctx, mut dispatcher) = AioContext::new();
        let err = submit_aio(&ctx, "preadv", 512, |_cb| Err(Errno(libc::EAGAIN)))
            .await
            .unwrap_err();
        assert!(matches!(err, GlusterError::Aio { op: "preadv", .. }));
        assert_eq!(err.to_errno(), libc::EAGAIN);
        assert_eq!(dispatcher.dispatch_pending(), 0);
    }

    #[tokio::test]
    async fn test_completion_is_delivered_through_bottom_half() {
        let (ctx, mut dispatcher) = AioContext::new();
        let acb = Arc::new(GlusterAiocb::new(4096));
        let cb_thread = {
            let ctx = ctx.clone();
            let acb = Arc::clone(&acb);
            thread::spawn(move || {
                gluster_finish_aiocb(&ctx, acb, 4096);
                thread::current().id()
            })
        }
        .join()
        .unwrap();
        assert_ne!(cb_thread, thread::current().id());

        // The callback thread stored the result but did not complete the record.
        assert_eq!(acb.ret(), 0);
        assert!(!acb.is_complete());

        assert_eq!(dispatcher.dispatch_pending(), 1);
        assert!(acb.is_complete());
        assert_eq!(acb.wait().await, 0);
    }

    #[test]
    fn test_record_freed_when_dispatcher_is_gone() {
        let (ctx, dispatcher) = AioContext::new();
        drop(dispatcher);
        let acb = Arc::new(GlusterAiocb::new(512));
        let weak = Arc::downgrade(&acb);
        gluster_finish_aiocb(&ctx, Arc::clone(&acb), 512);
        assert!(!acb.is_complete());
        drop(acb);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_abandoned_record_freed_before_dispatch() {
        let (ctx, mut dispatcher) = AioContext::new();
        let acb = Arc::new(GlusterAiocb::new(512));
        let weak = Arc::downgrade(&acb);
        gluster_finish_aiocb(&ctx, Arc::clone(&acb), 512);
        // The submitter goes away while the bottom half is still queued.
        drop(acb);
        assert!(weak.upgrade().is_none());
        assert_eq!(dispatcher.dispatch_pending(), 1);
    }

    #[tokio::test]
    async fn test_record_unreachable_after_resume() {
        let (ctx, mut dispatcher) = AioContext::new();
        let acb = Arc::new(GlusterAiocb::new(512));
        let weak = Arc::downgrade(&acb);
        {
            let ctx = ctx.clone();
            let acb = Arc::clone(&acb);
            thread::spawn(move || gluster_finish_aiocb(&ctx, acb, 512))
                .join()
                .unwrap();
        }

        let ret = dispatcher.run_until(acb.wait()).await;
        assert_eq!(ret, 0);
        // Only the submitter still holds the record.
        assert_eq!(Arc::strong_count(&acb), 1);
        drop(acb);
        assert!(weak.upgrade().is_none());
    }
}
