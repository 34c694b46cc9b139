// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::block_pool::BlockPool;
use crate::block_pool::FetchBlockError;
use crate::component::task_queue::TaskQueue;
use crate::component::worker::ComponentTask;
use crate::HalPixelFormat;
use crate::MemoryUsage;
use crate::Resolution;

/// Wait between fetch attempts while the client holds no buffer; none of
/// them can plausibly be back in the pool before then.
const DEQUEUE_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Converts the pool's blocking fetch interface into `OutputBufferReturned`
/// tasks for the component thread. Runs only while output buffers exist.
pub(crate) struct DequeueThread {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl DequeueThread {
    pub fn start(
        pool: Arc<dyn BlockPool>,
        tasks: Arc<TaskQueue<ComponentTask>>,
        buffers_in_client: Arc<AtomicU32>,
        size: Resolution,
        pixel_format: HalPixelFormat,
        usage: MemoryUsage,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        buffers_in_client.store(0, Ordering::SeqCst);

        let thread_stop = stop.clone();
        let handle = thread::Builder::new().name("c2-vda-dequeue".into()).spawn(move || {
            dequeue_loop(pool, tasks, buffers_in_client, thread_stop, size, pixel_format, usage)
        })?;

        Ok(Self { handle: Some(handle), stop })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DequeueThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dequeue_loop(
    pool: Arc<dyn BlockPool>,
    tasks: Arc<TaskQueue<ComponentTask>>,
    buffers_in_client: Arc<AtomicU32>,
    stop: Arc<AtomicBool>,
    size: Resolution,
    pixel_format: HalPixelFormat,
    usage: MemoryUsage,
) {
    log::debug!("dequeue loop starts");
    while !stop.load(Ordering::SeqCst) {
        if buffers_in_client.load(Ordering::SeqCst) == 0 {
            thread::sleep(DEQUEUE_RETRY_DELAY);
            continue;
        }
        match pool.fetch_graphic_block(size.width, size.height, pixel_format, usage) {
            Err(FetchBlockError::TimedOut) => continue,
            Ok(block) => {
                let Some(pool_id) = pool.pool_id_of(&block) else {
                    log::error!("dequeue loop could not resolve a pool id");
                    break;
                };
                tasks.post(ComponentTask::OutputBufferReturned { block, pool_id });
                buffers_in_client.fetch_sub(1, Ordering::SeqCst);
            }
            Err(e) => {
                log::error!("dequeue loop got error: {}", e);
                break;
            }
        }
    }
    log::debug!("dequeue loop terminates");
}
