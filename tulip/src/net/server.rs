use super::{Protocol, Socket, Transport, TransportOptions};
use crate::error::Result;
use crate::future::Future;
use crate::runtime::Handle;

use log::{debug, error};
use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

type ProtocolFactory = Box<dyn Fn() -> Box<dyn Protocol>>;

struct Inner {
    handle: Handle,
    listener: Socket,
    factory: ProtocolFactory,
    accept_fut: RefCell<Option<Future<(Socket, SocketAddr)>>>,
    serving: Cell<bool>,
}

/// A listening socket with an accept loop.
///
/// Every accepted connection gets a fresh protocol from the factory and a
/// [`Transport`] bound to the accepted socket. Created by
/// [`Handle::start_serving`] or [`Handle::create_server`].
#[derive(Clone)]
pub struct Server {
    inner: Rc<Inner>,
}

impl Server {
    /// The address the listening socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.listener.local_addr()
    }

    /// Returns `true` until the server is closed or its accept loop fails.
    pub fn is_serving(&self) -> bool {
        self.inner.serving.get()
    }

    /// Stops accepting and closes the listening socket.
    ///
    /// Connections already accepted are not affected. Idempotent.
    pub fn close(&self) {
        if !self.inner.serving.replace(false) {
            return;
        }

        debug!("stop serving {:?}", self.inner.listener);

        let pending = self.inner.accept_fut.borrow_mut().take();
        if let Some(future) = pending {
            future.cancel();
        }

        self.inner.handle.forget_socket(&self.inner.listener);
        self.inner.listener.close();
    }

    fn loop_accepting(&self, completed: Option<&Future<(Socket, SocketAddr)>>) {
        if let Some(future) = completed {
            self.inner.accept_fut.borrow_mut().take();

            match future.result() {
                Ok((conn, peer_addr)) => {
                    let protocol = (self.inner.factory)();
                    Transport::with_options(
                        &self.inner.handle,
                        conn,
                        protocol,
                        TransportOptions {
                            peer_addr: Some(peer_addr),
                            ..TransportOptions::default()
                        },
                    );
                }
                Err(err) if err.is_cancelled() => {
                    self.close();
                    return;
                }
                Err(err) => {
                    error!("Accept failed on {:?}: {err}", self.inner.listener);
                    self.close();
                    return;
                }
            }
        }

        if !self.inner.serving.get() {
            return;
        }

        let future = self.inner.handle.sock_accept(&self.inner.listener);
        *self.inner.accept_fut.borrow_mut() = Some(future.clone());

        let this = self.clone();
        future.add_done_callback(move |future| this.loop_accepting(Some(future)));
    }
}

impl Handle {
    /// Serves connections accepted on `listener`.
    ///
    /// The accept loop starts on the next loop iteration.
    pub fn start_serving(
        &self,
        factory: impl Fn() -> Box<dyn Protocol> + 'static,
        listener: Socket,
    ) -> Server {
        debug!("start serving {listener:?}");

        let server = Server {
            inner: Rc::new(Inner {
                handle: self.clone(),
                listener,
                factory: Box::new(factory),
                accept_fut: RefCell::new(None),
                serving: Cell::new(true),
            }),
        };

        let this = server.clone();
        self.call_soon(move || this.loop_accepting(None));

        server
    }

    /// Binds a listening socket to `address` and serves it.
    ///
    /// # Errors
    ///
    /// Fails if the address is invalid or cannot be bound.
    pub fn create_server(
        &self,
        address: &str,
        factory: impl Fn() -> Box<dyn Protocol> + 'static,
    ) -> Result<Server> {
        let listener = Socket::bind_listener(address)?;

        Ok(self.start_serving(factory, listener))
    }

    /// Connects to `address` and wraps the connection in a [`Transport`]
    /// driving `protocol`.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be created or the connection is refused.
    pub async fn create_connection(
        &self,
        address: SocketAddr,
        protocol: Box<dyn Protocol>,
    ) -> Result<Transport> {
        let sock = Socket::stream(&address)?;
        self.sock_connect(&sock, address).await?;

        let waiter = Future::new(self);
        let transport = Transport::with_options(
            self,
            sock,
            protocol,
            TransportOptions {
                peer_addr: Some(address),
                waiter: Some(waiter.clone()),
                write_only: false,
            },
        );
        waiter.await?;

        Ok(transport)
    }
}
