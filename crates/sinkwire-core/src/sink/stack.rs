//! Call-scoped sink stacks used to carry a response back through the chain.
//!
//! A forwarding sink that wants to see the response pushes itself (plus any
//! opaque state) before forwarding and pops itself again once the response
//! arrives. Frames unwind strictly LIFO, so intermediate sinks observe the
//! response before the original caller does.
//!
//! For asynchronous completion the stack itself is the continuation: the
//! terminal sink keeps the stack and resumes it later from whichever task
//! finishes the I/O. Both [`ClientSinkStack`] and [`PendingResponse`] are
//! consumed when resumed, so a continuation cannot be invoked twice. A
//! [`PendingResponse`] dropped without being resumed is observed by the
//! transport as [`ChannelError::ContinuationDropped`].

use super::{ClientChannelSink, ServerChannelSink};
use crate::error::{ChannelError, Result};
use crate::headers::Exchange;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Opaque per-frame state a sink stashes while its request is in flight.
pub type SinkState = Option<Box<dyn Any + Send>>;

/// A response or the error that replaced it.
pub type Reply = Result<Exchange>;

/// Final continuation of a client call.
pub type ReplySink = Box<dyn FnOnce(Reply) + Send>;

fn same_sink<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

struct ClientFrame {
    sink: Arc<dyn ClientChannelSink>,
    state: SinkState,
}

/// Sink stack for one asynchronous client call.
pub struct ClientSinkStack {
    frames: Vec<ClientFrame>,
    reply: Option<ReplySink>,
}

impl ClientSinkStack {
    /// Stack whose unwinding ends in `reply`.
    pub fn new(reply: impl FnOnce(Reply) + Send + 'static) -> Self {
        Self {
            frames: Vec::new(),
            reply: Some(Box::new(reply)),
        }
    }

    /// Stack whose reply is delivered through a oneshot channel.
    pub fn with_reply_channel() -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        let stack = Self::new(move |reply| {
            let _ = tx.send(reply);
        });
        (stack, rx)
    }

    /// Stack for a call that expects no response.
    pub fn one_way() -> Self {
        Self {
            frames: Vec::new(),
            reply: None,
        }
    }

    pub fn is_one_way(&self) -> bool {
        self.reply.is_none()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push(&mut self, sink: Arc<dyn ClientChannelSink>, state: SinkState) {
        self.frames.push(ClientFrame { sink, state });
    }

    /// Pop the top frame, which must belong to `sink`.
    pub fn pop(&mut self, sink: &Arc<dyn ClientChannelSink>) -> Result<SinkState> {
        match self.frames.last() {
            Some(top) if same_sink(&top.sink, sink) => {
                Ok(self.frames.pop().and_then(|frame| frame.state))
            }
            Some(_) => Err(ChannelError::StackMismatch(
                "top frame belongs to a different sink".to_string(),
            )),
            None => Err(ChannelError::StackMismatch("stack is empty".to_string())),
        }
    }

    pub fn async_process_response(self, response: Exchange) {
        self.resume(Ok(response));
    }

    /// Deliver an error through the same unwinding path as a response.
    pub fn dispatch_exception(self, err: ChannelError) {
        self.resume(Err(err));
    }

    /// Hand `reply` to the topmost frame, or to the caller once every frame
    /// has been unwound. One-way stacks discard the reply without unwinding.
    pub fn resume(mut self, reply: Reply) {
        if self.reply.is_none() {
            debug!("Discarding reply for one-way call");
            return;
        }
        match self.frames.pop() {
            Some(frame) => frame.sink.async_process_response(self, frame.state, reply),
            None => {
                if let Some(reply_sink) = self.reply.take() {
                    reply_sink(reply);
                }
            }
        }
    }
}

impl fmt::Debug for ClientSinkStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSinkStack")
            .field("depth", &self.frames.len())
            .field("one_way", &self.is_one_way())
            .finish()
    }
}

/// How an inbound call finally resolved.
#[derive(Debug)]
pub enum Completion {
    Reply(Reply),
    OneWay,
}

struct ServerFrame {
    sink: Arc<dyn ServerChannelSink>,
    state: SinkState,
}

/// Sink stack for one inbound call on the server.
pub struct ServerSinkStack {
    frames: Vec<ServerFrame>,
    root: Option<oneshot::Sender<Completion>>,
    suspended: bool,
}

impl ServerSinkStack {
    /// Create a stack and the receiver its eventual completion arrives on.
    pub fn new() -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        let stack = Self {
            frames: Vec::new(),
            root: Some(tx),
            suspended: false,
        };
        (stack, CompletionReceiver { rx })
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push(&mut self, sink: Arc<dyn ServerChannelSink>, state: SinkState) {
        self.frames.push(ServerFrame { sink, state });
    }

    /// Pop the top frame, which must belong to `sink`.
    pub fn pop(&mut self, sink: &Arc<dyn ServerChannelSink>) -> Result<SinkState> {
        match self.frames.last() {
            Some(top) if same_sink(&top.sink, sink) => {
                Ok(self.frames.pop().and_then(|frame| frame.state))
            }
            Some(_) => Err(ChannelError::StackMismatch(
                "top frame belongs to a different sink".to_string(),
            )),
            None => Err(ChannelError::StackMismatch("stack is empty".to_string())),
        }
    }

    /// Detach the not-yet-unwound stack so the response can be delivered
    /// later. The caller must then return [`ProcessingOutcome::Async`].
    ///
    /// Only the first call yields a live continuation. Suspending again logs a
    /// warning and returns a detached [`PendingResponse`] whose completion
    /// goes nowhere.
    ///
    /// [`ProcessingOutcome::Async`]: super::ProcessingOutcome::Async
    pub fn suspend(&mut self) -> PendingResponse {
        if self.suspended {
            warn!("Server stack suspended twice; the second continuation is detached");
        }
        self.suspended = true;
        PendingResponse {
            frames: std::mem::take(&mut self.frames),
            root: self.root.take(),
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }
}

impl fmt::Debug for ServerSinkStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSinkStack")
            .field("depth", &self.frames.len())
            .field("suspended", &self.suspended)
            .finish()
    }
}

/// A suspended server stack: the continuation for an asynchronous response.
#[must_use = "a pending response must be completed exactly once"]
pub struct PendingResponse {
    frames: Vec<ServerFrame>,
    root: Option<oneshot::Sender<Completion>>,
}

impl PendingResponse {
    pub fn async_process_response(self, response: Exchange) {
        self.resume(Ok(response));
    }

    pub fn dispatch_exception(self, err: ChannelError) {
        self.resume(Err(err));
    }

    /// Finish without a response. No frame is unwound.
    pub fn complete_one_way(mut self) {
        self.frames.clear();
        self.deliver(Completion::OneWay);
    }

    /// Hand `reply` to the topmost frame, or to the transport once every
    /// frame has been unwound.
    pub fn resume(mut self, reply: Reply) {
        match self.frames.pop() {
            Some(frame) => frame.sink.async_process_response(self, frame.state, reply),
            None => self.deliver(Completion::Reply(reply)),
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    fn deliver(&mut self, completion: Completion) {
        if let Some(root) = self.root.take() {
            if root.send(completion).is_err() {
                debug!("Connection went away before its asynchronous response was ready");
            }
        }
    }
}

impl fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponse")
            .field("depth", &self.frames.len())
            .finish()
    }
}

/// Transport-side end of a server stack.
#[derive(Debug)]
pub struct CompletionReceiver {
    rx: oneshot::Receiver<Completion>,
}

impl CompletionReceiver {
    /// Wait for the continuation. A dropped continuation is an error.
    pub async fn wait(self) -> Result<Completion> {
        self.rx.await.map_err(|_| ChannelError::ContinuationDropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderBag;
    use crate::sink::{ClientNext, ProcessingOutcome, ServerNext};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records the order in which frames see the response.
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ClientChannelSink for Recorder {
        async fn process_message(&self, request: Exchange, next: ClientNext<'_>) -> Result<Exchange> {
            next.process_message(request).await
        }

        fn async_process_response(&self, stack: ClientSinkStack, state: SinkState, reply: Reply) {
            let tag = state
                .and_then(|s| s.downcast::<u32>().ok())
                .map(|b| *b)
                .unwrap_or_default();
            self.log.lock().unwrap().push(format!("{}:{}", self.name, tag));
            stack.resume(reply);
        }
    }

    #[async_trait]
    impl ServerChannelSink for Recorder {
        async fn process_message(
            &self,
            stack: &mut ServerSinkStack,
            request: Exchange,
            next: ServerNext<'_>,
        ) -> Result<ProcessingOutcome> {
            next.process_message(stack, request).await
        }

        fn async_process_response(&self, stack: PendingResponse, _state: SinkState, reply: Reply) {
            self.log.lock().unwrap().push(self.name.to_string());
            stack.resume(reply);
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Recorder> {
        Arc::new(Recorder {
            name,
            log: log.clone(),
        })
    }

    #[test]
    fn test_client_stack_unwinds_lifo() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let outer: Arc<dyn ClientChannelSink> = recorder("outer", &log);
        let inner: Arc<dyn ClientChannelSink> = recorder("inner", &log);

        let delivered = Arc::new(Mutex::new(None));
        let sink = delivered.clone();
        let mut stack = ClientSinkStack::new(move |reply| {
            *sink.lock().unwrap() = Some(reply.map(|r| r.body));
        });
        stack.push(outer, Some(Box::new(1u32)));
        stack.push(inner, Some(Box::new(2u32)));

        stack.async_process_response(Exchange::new(HeaderBag::new(), &b"ok"[..]));

        assert_eq!(*log.lock().unwrap(), vec!["inner:2", "outer:1"]);
        let body = delivered.lock().unwrap().take().unwrap().unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[test]
    fn test_client_exception_takes_the_same_path() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let only: Arc<dyn ClientChannelSink> = recorder("only", &log);

        let (mut stack, mut rx) = ClientSinkStack::with_reply_channel();
        stack.push(only, None);
        stack.dispatch_exception(ChannelError::ConnectionClosed);

        assert_eq!(*log.lock().unwrap(), vec!["only:0"]);
        assert!(matches!(rx.try_recv(), Ok(Err(ChannelError::ConnectionClosed))));
    }

    #[test]
    fn test_one_way_stack_does_not_unwind() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let only: Arc<dyn ClientChannelSink> = recorder("only", &log);

        let mut stack = ClientSinkStack::one_way();
        stack.push(only, None);
        stack.async_process_response(Exchange::default());

        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_pop_rejects_foreign_sink() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a: Arc<dyn ClientChannelSink> = recorder("a", &log);
        let b: Arc<dyn ClientChannelSink> = recorder("b", &log);

        let mut stack = ClientSinkStack::one_way();
        stack.push(a.clone(), Some(Box::new(9u32)));
        assert!(matches!(stack.pop(&b), Err(ChannelError::StackMismatch(_))));

        let state = stack.pop(&a).unwrap().unwrap();
        assert_eq!(*state.downcast::<u32>().unwrap(), 9);
        assert!(stack.pop(&a).is_err());
    }

    #[tokio::test]
    async fn test_pending_response_unwinds_then_delivers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let outer: Arc<dyn ServerChannelSink> = recorder("outer", &log);
        let inner: Arc<dyn ServerChannelSink> = recorder("inner", &log);

        let (mut stack, completion) = ServerSinkStack::new();
        stack.push(outer, None);
        stack.push(inner, None);
        let pending = stack.suspend();
        assert!(stack.is_suspended());
        assert_eq!(stack.depth(), 0);
        assert_eq!(pending.depth(), 2);

        tokio::spawn(async move {
            pending.async_process_response(Exchange::new(HeaderBag::new(), &b"late"[..]));
        });

        match completion.wait().await.unwrap() {
            Completion::Reply(Ok(exchange)) => assert_eq!(&exchange.body[..], b"late"),
            other => panic!("Expected reply, got: {:?}", other),
        }
        assert_eq!(*log.lock().unwrap(), vec!["inner", "outer"]);
    }

    #[tokio::test]
    async fn test_one_way_completion_skips_frames() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let only: Arc<dyn ServerChannelSink> = recorder("only", &log);

        let (mut stack, completion) = ServerSinkStack::new();
        stack.push(only, None);
        stack.suspend().complete_one_way();

        assert!(matches!(completion.wait().await.unwrap(), Completion::OneWay));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_suspend_is_detached() {
        let (mut stack, completion) = ServerSinkStack::new();
        let first = stack.suspend();
        let second = stack.suspend();
        assert!(stack.is_suspended());
        assert_eq!(second.depth(), 0);

        second.async_process_response(Exchange::new(HeaderBag::new(), &b"second"[..]));
        first.async_process_response(Exchange::new(HeaderBag::new(), &b"first"[..]));

        match completion.wait().await.unwrap() {
            Completion::Reply(Ok(exchange)) => assert_eq!(&exchange.body[..], b"first"),
            other => panic!("Expected reply, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_continuation_is_detected() {
        let (mut stack, completion) = ServerSinkStack::new();
        let pending = stack.suspend();
        drop(pending);

        let err = completion.wait().await.unwrap_err();
        assert!(err.is_contract_violation());
    }
}
