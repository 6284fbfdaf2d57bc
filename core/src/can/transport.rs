//! The capability abstraction the adapter needs from a CAN bus: send one
//! frame without blocking, receive one frame without blocking. Collapses
//! the source's `CommAdapter` → `CanComm` inheritance chain into a trait a
//! mock can stand in for during tests.

use std::io;
use std::time::Duration;

/// A raw CAN frame as exchanged with the kernel (or a mock of it).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawFrame {
    pub can_id: u32,
    pub extended: bool,
    pub rtr: bool,
    pub dlc: u8,
    pub data: [u8; 8],
}

impl RawFrame {
    pub fn new(can_id: u32, extended: bool, rtr: bool, payload: &[u8]) -> Self {
        let dlc = payload.len().min(8) as u8;
        let mut data = [0u8; 8];
        data[..dlc as usize].copy_from_slice(&payload[..dlc as usize]);
        Self {
            can_id,
            extended,
            rtr,
            dlc,
            data,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }
}

/// Non-blocking send/receive over a CAN bus.
pub trait CanSink: Send {
    /// Bind to `ifname`, set non-blocking, ready to send/receive.
    fn open(ifname: &str) -> io::Result<Self>
    where
        Self: Sized;

    /// Enqueue-free, single-syscall send. Returns `ErrorKind::WouldBlock`
    /// equivalents (`EAGAIN`/`EWOULDBLOCK`/`ENOBUFS`) as `Err` rather than
    /// blocking.
    fn try_send(&self, frame: &RawFrame) -> io::Result<()>;

    /// Single-syscall receive. Returns `Err` with `ErrorKind::WouldBlock`
    /// when nothing is available.
    fn try_recv(&self) -> io::Result<RawFrame>;
}

/// Whether an I/O error represents kernel backpressure rather than a real
/// fault — `ENOBUFS`, `EAGAIN`, `EWOULDBLOCK`.
pub fn is_backpressure(err: &io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(err.kind(), ErrorKind::WouldBlock)
        || err.raw_os_error() == Some(libc::ENOBUFS)
}

/// Runs `ip link set <ifname> {down,up}` with a bounded timeout. Abstracted
/// behind a trait so interface-reset tests never spawn a real process.
#[async_trait::async_trait]
pub trait LinkResetter: Send + Sync {
    async fn set_link_down(&self, ifname: &str, timeout: Duration) -> io::Result<()>;
    async fn set_link_up(&self, ifname: &str, timeout: Duration) -> io::Result<()>;
}

/// Production resetter: shells out to `ip`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLinkResetter;

#[async_trait::async_trait]
impl LinkResetter for ProcessLinkResetter {
    async fn set_link_down(&self, ifname: &str, timeout: Duration) -> io::Result<()> {
        run_ip_link(ifname, "down", timeout).await
    }

    async fn set_link_up(&self, ifname: &str, timeout: Duration) -> io::Result<()> {
        run_ip_link(ifname, "up", timeout).await
    }
}

async fn run_ip_link(ifname: &str, state: &str, timeout: Duration) -> io::Result<()> {
    let fut = tokio::process::Command::new("ip")
        .args(["link", "set", ifname, state])
        .output();

    let output = tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "ip link timed out"))??;

    if output.status.success() {
        Ok(())
    } else {
        tracing::error!(
            ifname,
            state,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "ip link command failed"
        );
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("ip link set {ifname} {state} exited with {}", output.status),
        ))
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Programmable mock transport: every `try_send` pops the next queued
    /// result, repeating the last one once the queue is exhausted.
    pub struct MockSink {
        send_results: Mutex<VecDeque<io::Result<()>>>,
        recv_queue: Mutex<VecDeque<RawFrame>>,
    }

    impl MockSink {
        pub fn new() -> Self {
            Self {
                send_results: Mutex::new(VecDeque::new()),
                recv_queue: Mutex::new(VecDeque::new()),
            }
        }

        pub fn push_send_result(&self, result: io::Result<()>) {
            self.send_results.lock().unwrap().push_back(result);
        }

        pub fn push_recv_frame(&self, frame: RawFrame) {
            self.recv_queue.lock().unwrap().push_back(frame);
        }
    }

    impl CanSink for MockSink {
        fn open(_ifname: &str) -> io::Result<Self> {
            Ok(Self::new())
        }

        fn try_send(&self, _frame: &RawFrame) -> io::Result<()> {
            let mut results = self.send_results.lock().unwrap();
            match results.pop_front() {
                Some(result) => result,
                None => Ok(()),
            }
        }

        fn try_recv(&self) -> io::Result<RawFrame> {
            self.recv_queue
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))
        }
    }
}
