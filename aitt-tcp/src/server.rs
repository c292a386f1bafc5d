use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::Rng;

use aitt_core::SubscribeFn;

use crate::crypto::{IV_LEN, KEY_LEN};
use crate::stream::FrameStream;

/// Poll interval of the accept loop; bounds how long `close` waits for the
/// accept thread to observe the stop flag.
const ACCEPT_POLL: Duration = Duration::from_millis(20);

struct AcceptedConn {
    id: u64,
    stream: TcpStream,
    reader: Option<JoinHandle<()>>,
}

/// One listening endpoint serving a single subscribed topic.
///
/// Binds an OS-assigned port, accepts any number of publishing peers and
/// runs a blocking reader thread per accepted connection. `close` tears all
/// of it down synchronously.
pub(crate) struct Listener {
    topic: String,
    port: u16,
    secret: Option<([u8; KEY_LEN], [u8; IV_LEN])>,
    stop: Arc<AtomicBool>,
    conns: Arc<Mutex<Vec<AcceptedConn>>>,
    acceptor: Option<JoinHandle<()>>,
}

impl Listener {
    pub fn spawn(topic: &str, secure: bool, cb: SubscribeFn) -> io::Result<Listener> {
        let listener = TcpListener::bind("0.0.0.0:0")?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();

        let secret = if secure {
            let mut key = [0u8; KEY_LEN];
            let mut iv = [0u8; IV_LEN];
            rand::thread_rng().fill(&mut key[..]);
            rand::thread_rng().fill(&mut iv[..]);
            Some((key, iv))
        } else {
            None
        };

        let stop = Arc::new(AtomicBool::new(false));
        let conns = Arc::new(Mutex::new(Vec::new()));

        let acceptor = {
            let topic = topic.to_owned();
            let stop = Arc::clone(&stop);
            let conns = Arc::clone(&conns);
            thread::Builder::new()
                .name(format!("aitt-accept-{}", port))
                .spawn(move || accept_loop(listener, &topic, secret, cb, &stop, &conns))?
        };

        debug!("listening on port {} for topic {}", port, topic);

        Ok(Listener {
            topic: topic.to_owned(),
            port,
            secret,
            stop,
            conns,
            acceptor: Some(acceptor),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn secret(&self) -> Option<(&[u8; KEY_LEN], &[u8; IV_LEN])> {
        self.secret.as_ref().map(|(key, iv)| (key, iv))
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);

        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }

        let drained = {
            let mut conns = self.conns.lock().unwrap();
            std::mem::replace(&mut *conns, Vec::new())
        };
        for mut conn in drained {
            let _ = conn.stream.shutdown(std::net::Shutdown::Both);
            if let Some(reader) = conn.reader.take() {
                let _ = reader.join();
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop(
    listener: TcpListener,
    topic: &str,
    secret: Option<([u8; KEY_LEN], [u8; IV_LEN])>,
    cb: SubscribeFn,
    stop: &Arc<AtomicBool>,
    conns: &Arc<Mutex<Vec<AcceptedConn>>>,
) {
    static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("accepted {} on topic {}", peer, topic);

                let shutdown_handle = match stream.try_clone() {
                    Ok(clone) => clone,
                    Err(e) => {
                        warn!("cannot clone accepted socket from {}: {}", peer, e);
                        continue;
                    }
                };
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!("cannot make accepted socket blocking: {}", e);
                    continue;
                }

                let id = NEXT_CONN.fetch_add(1, Ordering::SeqCst);
                let reader = {
                    let cb = cb.clone();
                    let conns = Arc::clone(conns);
                    thread::Builder::new()
                        .name(format!("aitt-read-{}", id))
                        .spawn(move || {
                            read_loop(stream, secret, cb);
                            conns.lock().unwrap().retain(|conn| conn.id != id);
                        })
                };
                let reader = match reader {
                    Ok(handle) => handle,
                    Err(e) => {
                        error!("cannot spawn reader thread: {}", e);
                        continue;
                    }
                };

                conns.lock().unwrap().push(AcceptedConn {
                    id,
                    stream: shutdown_handle,
                    reader: Some(reader),
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                // A broken listening socket aborts the whole subscription.
                error!("accept failed on topic {}: {}", topic, e);
                return;
            }
        }
    }
}

fn read_loop(
    stream: TcpStream,
    secret: Option<([u8; KEY_LEN], [u8; IV_LEN])>,
    cb: SubscribeFn,
) {
    let mut frames =
        match FrameStream::accepted(stream, secret.as_ref().map(|(key, iv)| (key, iv))) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("handshake with publisher failed: {}", e);
                return;
            }
        };

    loop {
        match frames.recv_message() {
            Ok((topic, payload)) => cb(&topic, &payload),
            Err(e) => {
                debug!("publisher gone: {}", e);
                return;
            }
        }
    }
}
