use std::{
    io,
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    error::Error,
    transport::{lock, Transport},
};

/// Background worker that keeps the connection alive while the owner is not ticking.
///
/// It shares the transport mutex with the session, so its sends are serialized with
/// the session's own. Failures are logged and otherwise ignored: by the time the worker
/// runs the session may already have closed the transport.
pub(crate) struct KeepAlive {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl KeepAlive {
    pub fn spawn<T: Transport>(
        transport: Arc<Mutex<T>>,
        datagram: Vec<u8>,
        interval: Duration,
    ) -> io::Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("brisk-keep-alive".into())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let mut transport = lock(&transport);
                if !transport.can_send() {
                    continue;
                }
                match transport.send(&datagram) {
                    Ok(_) => log::trace!("keep-alive sent"),
                    Err(e) => log::debug!("keep-alive send failed: {}", Into::<Error>::into(e)),
                }
            })?;
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("keep-alive worker panicked");
            }
        }
    }
}
