// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use nix::errno::Errno;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;

/// A FIFO of tasks posted from the framework and accelerator callback
/// threads, consumed in order by the component thread. The eventfd carries
/// semaphore semantics so one `read` wakes the consumer per posted task.
pub(crate) struct TaskQueue<T> {
    event: EventFd,
    tasks: Mutex<VecDeque<T>>,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Result<Arc<Self>, Errno> {
        Ok(Arc::new(Self {
            event: EventFd::from_flags(EfdFlags::EFD_SEMAPHORE)?,
            tasks: Mutex::new(VecDeque::new()),
        }))
    }

    /// Appends `task` and wakes the component thread.
    pub fn post(&self, task: T) {
        self.tasks.lock().unwrap().push_back(task);
        let _ = self.event.write(1);
    }

    /// Blocks until a task is available and pops it.
    pub fn dequeue(&self) -> T {
        loop {
            match self.event.read() {
                Ok(_) => {
                    if let Some(task) = self.tasks.lock().unwrap().pop_front() {
                        return task;
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(_) => {
                    // The eventfd is unusable; drain whatever is queued.
                    if let Some(task) = self.tasks.lock().unwrap().pop_front() {
                        return task;
                    }
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
            }
        }
    }
}
