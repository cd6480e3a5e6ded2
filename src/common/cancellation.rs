use crossbeam_channel::{Receiver, Sender, TryRecvError};

/// Owning side of a cancellation pair. Cancellation fires when the
/// `Canceller` is dropped or `cancel` is called explicitly.
#[derive(Debug)]
pub struct Canceller {
    tx: Option<Sender<()>>,
}

impl Canceller {
    pub fn cancel(&mut self) {
        self.tx.take();
    }
}

/// Observing side of a cancellation pair. Every blocking operation in this
/// crate accepts a signal and returns `RaftError::Cancelled` when it fires.
///
/// The signal is backed by a channel that never carries messages, so its
/// receiver can participate in `select!` loops: a receive error means the
/// signal has fired.
#[derive(Clone, Debug)]
pub struct CancellationSignal {
    rx: Receiver<()>,
}

impl CancellationSignal {
    pub fn is_cancelled(&self) -> bool {
        match self.rx.try_recv() {
            Err(TryRecvError::Disconnected) => true,
            _ => false,
        }
    }

    /// Receiver for `select!` arms. It yields (with an error) only once the
    /// signal fires.
    pub fn receiver(&self) -> Receiver<()> {
        self.rx.clone()
    }

    /// A signal that never fires. Useful for tests and detached work.
    pub fn never() -> CancellationSignal {
        let (tx, rx) = crossbeam_channel::unbounded();
        std::mem::forget(tx);
        CancellationSignal { rx }
    }
}

/// Creates a connected `Canceller`/`CancellationSignal` pair.
pub fn cancellation() -> (Canceller, CancellationSignal) {
    let (tx, rx) = crossbeam_channel::unbounded();

    (Canceller { tx: Some(tx) }, CancellationSignal { rx })
}
