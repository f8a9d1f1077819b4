use crate::audio_io::DeviceId;
use crate::queue::SynchronizedQueue;

/// Control-side queue of parameter changes for one processing unit.
///
/// Producers push from any control thread without waiting on the consumer.
/// The consumer calls [`CommandChannel::drain`] at a point in its loop where
/// mutating its own state is safe and applies the commands in push order.
pub struct CommandChannel<C> {
    queue: SynchronizedQueue<C>,
}

impl<C> CommandChannel<C> {
    pub fn new() -> Self {
        CommandChannel {
            queue: SynchronizedQueue::new(),
        }
    }

    pub fn push(&self, command: C) {
        self.queue.push(command);
    }

    /// Takes every pending command, oldest first.
    pub fn drain(&self) -> impl Iterator<Item = C> {
        self.queue.drain().into_iter()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<C> Default for CommandChannel<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCommand {
    Null,
    SetDevice(DeviceId),
}
