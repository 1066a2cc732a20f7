//! Asynchronous name resolution for the network thread.
//!
//! Lookups run on the thread's tokio runtime. Finished lookups wait in a
//! channel until the thread flushes them into its callback queue, so
//! completion callbacks always run on the network thread.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc};
use tracing::trace;

use super::Callback;
use super::callbacks::{CallbackQueue, CallbackTarget};
use super::scheduler::Scheduler;

/// Address family a lookup is restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveFamily {
    #[default]
    Any,
    V4,
    V6,
}

impl ResolveFamily {
    fn accepts(self, address: &SocketAddr) -> bool {
        match self {
            ResolveFamily::Any => true,
            ResolveFamily::V4 => address.is_ipv4(),
            ResolveFamily::V6 => address.is_ipv6(),
        }
    }
}

type Resolved<S> = (CallbackTarget, Callback<S>);

/// Cloneable handle for starting lookups.
pub struct Resolver<S> {
    sender: mpsc::UnboundedSender<Resolved<S>>,
    runtime: Handle,
    interrupt: Arc<Notify>,
}

impl<S> Clone for Resolver<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            runtime: self.runtime.clone(),
            interrupt: Arc::clone(&self.interrupt),
        }
    }
}

impl<S: 'static> Resolver<S> {
    pub(crate) fn new(runtime: Handle, interrupt: Arc<Notify>) -> (Self, ResolverQueue<S>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                runtime,
                interrupt,
            },
            ResolverQueue { receiver },
        )
    }

    /// Resolves `host:port` and runs `callback` on the network thread
    /// with the addresses of `family`.
    ///
    /// An empty result for the requested family is reported as
    /// `io::ErrorKind::NotFound`.
    pub fn resolve(
        &self,
        target: CallbackTarget,
        host: impl Into<String>,
        port: u16,
        family: ResolveFamily,
        callback: impl FnOnce(&mut S, io::Result<Vec<SocketAddr>>) + Send + 'static,
    ) {
        let host = host.into();
        let sender = self.sender.clone();
        let interrupt = Arc::clone(&self.interrupt);

        self.runtime.spawn(async move {
            let result = tokio::net::lookup_host((host.as_str(), port))
                .await
                .map(|addresses| {
                    addresses
                        .filter(|address| family.accepts(address))
                        .collect::<Vec<_>>()
                })
                .and_then(|addresses| {
                    if addresses.is_empty() {
                        Err(io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("no {family:?} address for {host}"),
                        ))
                    } else {
                        Ok(addresses)
                    }
                });

            trace!("resolver: {host}:{port} -> {result:?}");

            let completion: Callback<S> =
                Box::new(move |state: &mut S, _: &mut Scheduler<S>| callback(state, result));
            if sender.send((target, completion)).is_ok() {
                interrupt.notify_one();
            }
        });
    }
}

impl<S> fmt::Debug for Resolver<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

/// Receiving side of finished lookups, owned by the network thread.
pub(crate) struct ResolverQueue<S> {
    receiver: mpsc::UnboundedReceiver<Resolved<S>>,
}

impl<S> ResolverQueue<S> {
    /// Moves finished lookups into `callbacks`. Returns how many.
    pub(crate) fn flush(&mut self, callbacks: &CallbackQueue<S>) -> usize {
        let mut flushed = 0;
        while let Ok((target, completion)) = self.receiver.try_recv() {
            callbacks.push_boxed(target, completion);
            flushed += 1;
        }
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_filter() {
        let v4: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let v6: SocketAddr = "[::1]:80".parse().unwrap();

        assert!(ResolveFamily::Any.accepts(&v4));
        assert!(ResolveFamily::Any.accepts(&v6));
        assert!(ResolveFamily::V4.accepts(&v4));
        assert!(!ResolveFamily::V4.accepts(&v6));
        assert!(ResolveFamily::V6.accepts(&v6));
    }

    #[test]
    fn test_flush_moves_results_into_callbacks() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let interrupt = Arc::new(Notify::new());
        let (resolver, mut queue) = Resolver::<Vec<SocketAddr>>::new(
            runtime.handle().clone(),
            Arc::clone(&interrupt),
        );
        let callbacks = CallbackQueue::new(Arc::clone(&interrupt));

        resolver.resolve(
            CallbackTarget::unique(),
            "127.0.0.1",
            6881,
            ResolveFamily::V4,
            |found, result| found.extend(result.unwrap()),
        );

        runtime.block_on(interrupt.notified());
        assert_eq!(queue.flush(&callbacks), 1);

        let mut found = Vec::new();
        callbacks.process(&mut found, &mut Scheduler::new());
        assert_eq!(found, vec!["127.0.0.1:6881".parse().unwrap()]);
    }
}
