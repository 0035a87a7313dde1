use tokio::sync::mpsc;

pub type Sender<T> = mpsc::Sender<T>;
pub type Receiver<T> = mpsc::Receiver<T>;

/// Channel between pipeline stages.
///
/// Capacity 1 is the closest tokio gets to a synchronous hand-off: a sender
/// can park at most one item before it blocks on the receiver.
pub fn handoff_channel<T>() -> (Sender<T>, Receiver<T>) {
    mpsc::channel(1)
}
