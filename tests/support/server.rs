use std::convert::Infallible;
use std::future::Future;
use std::net;
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::runtime;
use tokio::sync::oneshot;

use http_negotiate::Body;

pub struct Server {
    addr: net::SocketAddr,
    panic_rx: std_mpsc::Receiver<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Server {
    pub fn addr(&self) -> net::SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if !thread::panicking() {
            self.panic_rx
                .recv_timeout(Duration::from_secs(3))
                .expect("test server should not panic");
        }
    }
}

/// Serves HTTP/1.1 on a loopback port from a thread of its own, one
/// connection per task.
pub fn http<F, Fut>(func: F) -> Server
where
    F: Fn(http::Request<hyper::body::Incoming>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = http::Response<Body>> + Send + 'static,
{
    per_connection(move || func.clone())
}

/// Like [`http`], but calls `make` for every accepted connection, so that
/// each connection is served by a handler of its own.
pub fn per_connection<M, F, Fut>(mut make: M) -> Server
where
    M: FnMut() -> F + Send + 'static,
    F: Fn(http::Request<hyper::body::Incoming>) -> Fut + Send + 'static,
    Fut: Future<Output = http::Response<Body>> + Send + 'static,
{
    let test_name = thread::current().name().unwrap_or("<unknown>").to_string();

    // bound here so the address is known before the server thread runs; the
    // caller may itself be inside a runtime
    let listener = net::TcpListener::bind(net::SocketAddr::from(([127, 0, 0, 1], 0)))
        .expect("bind");
    listener.set_nonblocking(true).expect("non-blocking listener");
    let addr = listener.local_addr().unwrap();

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let (panic_tx, panic_rx) = std_mpsc::channel();
    let tname = format!("test({})-support-server", test_name);
    thread::Builder::new()
        .name(tname)
        .spawn(move || {
            let rt = runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("new rt");
            rt.block_on(async move {
                let listener = tokio::net::TcpListener::from_std(listener).expect("listener");
                loop {
                    tokio::select! {
                        _ = &mut shutdown_rx => break,
                        accepted = listener.accept() => {
                            let (io, _) = accepted.expect("accepted");
                            let func = make();
                            let svc = hyper::service::service_fn(move |req| {
                                let fut = func(req);
                                async move { Ok::<_, Infallible>(fut.await) }
                            });
                            tokio::spawn(async move {
                                let _ = http1::Builder::new()
                                    .serve_connection(TokioIo::new(io), svc)
                                    .await;
                            });
                        }
                    }
                }
            });
            // connections and their handlers go away with the runtime
            drop(rt);
            let _ = panic_tx.send(());
        })
        .expect("thread spawn");

    Server {
        addr,
        panic_rx,
        shutdown_tx: Some(shutdown_tx),
    }
}
