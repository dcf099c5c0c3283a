use {
    crate::package::{Package, PackageId},
    std::{collections::VecDeque, time::Duration},
};

/// Batching thresholds handed to the package buffer alongside a package.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    pub max_size: Option<usize>,
    pub max_time: Option<Duration>,
}

/// External collaborator buffering outgoing packages: during disconnects, and
/// for batched sends while connected.
pub trait PackageBuffer: Send + 'static {
    fn add(&mut self, package: Package, batch: Option<BatchOptions>);

    /// Drains every buffered package in insertion order.
    fn flush(&mut self) -> Vec<Package>;

    /// Drops any pending batch-time trigger without flushing.
    fn clear_batch_time(&mut self);

    /// Removes a package that has not been sent yet.
    fn try_remove(&mut self, id: PackageId) -> Option<Package>;
}

/// Reference buffer: a plain FIFO. Time/size thresholds are ignored; flushing
/// is driven entirely by the controller.
#[derive(Default)]
pub struct QueueBuffer {
    queue: VecDeque<Package>,
}

impl PackageBuffer for QueueBuffer {
    fn add(&mut self, package: Package, _batch: Option<BatchOptions>) {
        self.queue.push_back(package);
    }

    fn flush(&mut self) -> Vec<Package> {
        self.queue.drain(..).collect()
    }

    fn clear_batch_time(&mut self) {}

    fn try_remove(&mut self, id: PackageId) -> Option<Package> {
        let index = self.queue.iter().position(|package| package.id() == id)?;
        self.queue.remove(index)
    }
}
