// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The component thread. Every mutation of pipeline state happens here, in
//! the order tasks were posted; accelerator callbacks are bounced into the
//! same queue so no locking is needed on the hot path.

use std::collections::VecDeque;
use std::os::fd::AsFd;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::block_pool::BlockPool;
use crate::block_pool::FetchBlockError;
use crate::block_pool::GraphicBlock;
use crate::component::dequeue::DequeueThread;
use crate::component::output_buffers::OutputBufferRegistry;
use crate::component::output_buffers::DPB_OUTPUT_BUFFER_EXTRA_COUNT;
use crate::component::task_queue::TaskQueue;
use crate::component::C2Status;
use crate::component::Listener;
use crate::component::State;
use crate::component::VideoFormat;
use crate::vda::VdaAdaptor;
use crate::vda::VdaClient;
use crate::vda::VdaError;
use crate::vda::VdaFactory;
use crate::vda::VdaResult;
use crate::vda::VideoCodecProfile;
use crate::work::C2Work;
use crate::work::DrainMode;
use crate::work::GraphicBuffer;
use crate::work::QueuedWork;
use crate::work::FLAG_END_OF_STREAM;
use crate::HalPixelFormat;
use crate::MemoryUsage;
use crate::Rect;
use crate::Resolution;

/// Max retries when a pool fetch times out during buffer allocation.
const ALLOCATE_BUFFER_MAX_RETRIES: u32 = 10;
const ALLOCATE_RETRY_DELAY: Duration = Duration::from_millis(10);

/// The state machine on the component thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ComponentState {
    /// Initial state, and the state after a completed stop. Start moves to
    /// `Started` once the accelerator initializes.
    Uninitialized,
    /// The accelerator is ready to make progress.
    Started,
    /// A drain point was dispatched; waiting for the accelerator flush.
    Draining,
    /// A flush reset is in flight; back to `Started` on completion.
    Flushing,
    /// A stop reset is in flight; `Uninitialized` on completion.
    Stopping,
    Error,
}

/// Everything the component thread reacts to, in posting order.
pub(crate) enum ComponentTask {
    Start { profile: VideoCodecProfile, done: mpsc::Sender<VdaResult<()>> },
    Stop { done: mpsc::Sender<()> },
    Queue { work: C2Work },
    DequeueWork,
    Drain { mode: DrainMode },
    Flush,
    InputBufferDone { bitstream_id: i32 },
    OutputBufferDone { picture_buffer_id: i32, bitstream_id: i32 },
    OutputBufferReturned { block: GraphicBlock, pool_id: u32 },
    OutputFormatChanged { format: VideoFormat },
    VisibleRectChanged { visible_rect: Rect },
    DrainDone,
    ResetDone,
    NotifyError { error: VdaError },
    Destroy,
}

/// The accelerator-facing callback half of the component. Callbacks arrive
/// on arbitrary threads and are reposted as tasks.
pub(crate) struct VdaClientProxy {
    tasks: Arc<TaskQueue<ComponentTask>>,
    requested_visible_rect: Mutex<Rect>,
}

impl VdaClientProxy {
    fn new(tasks: Arc<TaskQueue<ComponentTask>>) -> Self {
        Self { tasks, requested_visible_rect: Mutex::new(Rect::default()) }
    }
}

impl VdaClient for VdaClientProxy {
    fn provide_picture_buffers(&self, min_num_buffers: u32, coded_size: Resolution) {
        // The output is flexible 4:2:0; the coded size stands in for the
        // crop until picture_ready reports a real one.
        let format = VideoFormat {
            pixel_format: HalPixelFormat::YCbCr420Flexible,
            min_num_buffers,
            coded_size,
            visible_rect: Rect::from(coded_size),
        };
        *self.requested_visible_rect.lock().unwrap() = Rect::default();
        self.tasks.post(ComponentTask::OutputFormatChanged { format });
    }

    fn dismiss_picture_buffer(&self, _picture_buffer_id: i32) {
        // Buffers are reclaimed wholesale on format changes and reset.
    }

    fn picture_ready(&self, picture_buffer_id: i32, bitstream_id: i32, visible_rect: Rect) {
        {
            let mut requested = self.requested_visible_rect.lock().unwrap();
            if *requested != visible_rect {
                *requested = visible_rect;
                self.tasks.post(ComponentTask::VisibleRectChanged { visible_rect });
            }
        }
        self.tasks.post(ComponentTask::OutputBufferDone { picture_buffer_id, bitstream_id });
    }

    fn notify_end_of_bitstream_buffer(&self, bitstream_id: i32) {
        self.tasks.post(ComponentTask::InputBufferDone { bitstream_id });
    }

    fn notify_flush_done(&self) {
        self.tasks.post(ComponentTask::DrainDone);
    }

    fn notify_reset_done(&self) {
        self.tasks.post(ComponentTask::ResetDone);
    }

    fn notify_error(&self, error: VdaError) {
        self.tasks.post(ComponentTask::NotifyError { error });
    }
}

pub(crate) struct ComponentWorker {
    tasks: Arc<TaskQueue<ComponentTask>>,
    state: Arc<Mutex<State>>,
    listener: Arc<Mutex<Option<Arc<dyn Listener>>>>,
    queued_count: Arc<AtomicUsize>,
    factory: Arc<dyn VdaFactory>,
    pool: Arc<dyn BlockPool>,
    secure_mode: bool,

    vda: Option<Box<dyn VdaAdaptor>>,
    component_state: ComponentState,
    incoming_queue: VecDeque<QueuedWork>,
    pending_works: VecDeque<C2Work>,
    abandoned_works: Vec<C2Work>,
    pending_output_eos: bool,
    registry: OutputBufferRegistry,
    buffers_in_client: Arc<AtomicU32>,
    dequeue_thread: Option<DequeueThread>,
    stop_done: Option<mpsc::Sender<()>>,
}

impl ComponentWorker {
    pub fn new(
        tasks: Arc<TaskQueue<ComponentTask>>,
        state: Arc<Mutex<State>>,
        listener: Arc<Mutex<Option<Arc<dyn Listener>>>>,
        queued_count: Arc<AtomicUsize>,
        factory: Arc<dyn VdaFactory>,
        pool: Arc<dyn BlockPool>,
        secure_mode: bool,
    ) -> Self {
        Self {
            tasks,
            state,
            listener,
            queued_count,
            factory,
            pool,
            secure_mode,
            vda: None,
            component_state: ComponentState::Uninitialized,
            incoming_queue: VecDeque::new(),
            pending_works: VecDeque::new(),
            abandoned_works: Vec::new(),
            pending_output_eos: false,
            registry: OutputBufferRegistry::default(),
            buffers_in_client: Arc::new(AtomicU32::new(0)),
            dequeue_thread: None,
            stop_done: None,
        }
    }

    pub fn run(mut self) {
        loop {
            match self.tasks.dequeue() {
                ComponentTask::Destroy => {
                    self.on_destroy();
                    break;
                }
                task => self.handle_task(task),
            }
        }
    }

    fn handle_task(&mut self, task: ComponentTask) {
        match task {
            ComponentTask::Start { profile, done } => self.on_start(profile, done),
            ComponentTask::Stop { done } => self.on_stop(done),
            ComponentTask::Queue { work } => self.on_queue_work(work),
            ComponentTask::DequeueWork => self.on_dequeue_work(),
            ComponentTask::Drain { mode } => self.on_drain(mode),
            ComponentTask::Flush => self.on_flush(),
            ComponentTask::InputBufferDone { bitstream_id } => {
                self.on_input_buffer_done(bitstream_id)
            }
            ComponentTask::OutputBufferDone { picture_buffer_id, bitstream_id } => {
                self.on_output_buffer_done(picture_buffer_id, bitstream_id)
            }
            ComponentTask::OutputBufferReturned { block, pool_id } => {
                self.on_output_buffer_returned(block, pool_id)
            }
            ComponentTask::OutputFormatChanged { format } => {
                self.on_output_format_changed(format)
            }
            ComponentTask::VisibleRectChanged { visible_rect } => {
                self.on_visible_rect_changed(visible_rect)
            }
            ComponentTask::DrainDone => self.on_drain_done(),
            ComponentTask::ResetDone => self.on_reset_done(),
            ComponentTask::NotifyError { error } => {
                log::error!("got error from the accelerator: {}", error);
                self.report_error(error.to_status());
            }
            ComponentTask::Destroy => unreachable!("handled by the run loop"),
        }
    }

    /// The guard at the entry of every posted callback: nothing mutates
    /// state once the component errored out or has been torn down.
    fn expect_running(&self) -> bool {
        match self.component_state {
            ComponentState::Error => false,
            ComponentState::Uninitialized => {
                log::error!("task dropped before initialization");
                false
            }
            _ => true,
        }
    }

    fn on_start(&mut self, profile: VideoCodecProfile, done: mpsc::Sender<VdaResult<()>>) {
        log::debug!("on_start");
        if self.component_state != ComponentState::Uninitialized {
            log::error!("start requested in state {:?}", self.component_state);
            let _ = done.send(Err(VdaError::IllegalState));
            return;
        }

        let mut vda = self.factory.create();
        let client: Arc<dyn VdaClient> = Arc::new(VdaClientProxy::new(self.tasks.clone()));
        let result = vda.initialize(profile, self.secure_mode, client);
        if result.is_ok() {
            self.vda = Some(vda);
            self.component_state = ComponentState::Started;
        }
        let _ = done.send(result);
    }

    fn on_stop(&mut self, done: mpsc::Sender<()>) {
        log::debug!("on_stop");

        while let Some(queued) = self.incoming_queue.pop_front() {
            self.queued_count.fetch_sub(1, Ordering::SeqCst);
            self.abandoned_works.push(queued.work);
        }

        let reset_sent = match self.component_state {
            // A flush already sent a reset; its completion serves the stop.
            ComponentState::Flushing => true,
            ComponentState::Error | ComponentState::Uninitialized => false,
            _ => match self.vda.as_mut() {
                Some(vda) => match vda.reset() {
                    Ok(()) => true,
                    Err(e) => {
                        log::error!("reset failed while stopping: {}", e);
                        false
                    }
                },
                None => false,
            },
        };

        self.stop_done = Some(done);
        if reset_sent {
            self.component_state = ComponentState::Stopping;
        } else {
            // No reset completion will arrive; tear down right away.
            self.on_stop_done();
        }
    }

    fn on_stop_done(&mut self) {
        log::debug!("on_stop_done");
        // Works queued while the stop reset was in flight are abandoned too.
        while let Some(queued) = self.incoming_queue.pop_front() {
            self.queued_count.fetch_sub(1, Ordering::SeqCst);
            self.abandoned_works.push(queued.work);
        }
        self.report_abandoned_works();
        self.registry.clear_pending_format();
        if let Some(mut vda) = self.vda.take() {
            vda.destroy();
        }
        // Blocks still at the client are dropped here; a later return is
        // ignored by the uninitialized-state check.
        self.registry.clear();
        self.stop_dequeue_thread();
        self.component_state = ComponentState::Uninitialized;
        if let Some(done) = self.stop_done.take() {
            let _ = done.send(());
        }
    }

    fn on_destroy(&mut self) {
        log::debug!("on_destroy");
        if let Some(mut vda) = self.vda.take() {
            vda.destroy();
        }
        self.stop_dequeue_thread();
    }

    fn on_queue_work(&mut self, work: C2Work) {
        log::debug!(
            "on_queue_work: flags=0x{:x}, index={}, timestamp={}",
            work.input.flags,
            work.input.ordinal.frame_index,
            work.input.ordinal.timestamp
        );
        if !self.expect_running() {
            self.queued_count.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        let drain_mode =
            if work.is_eos() { DrainMode::WithEos } else { DrainMode::NoDrain };
        self.incoming_queue.push_back(QueuedWork { work, drain_mode });

        self.tasks.post(ComponentTask::DequeueWork);
    }

    fn on_dequeue_work(&mut self) {
        if !self.expect_running() {
            return;
        }
        if self.incoming_queue.is_empty() {
            return;
        }
        if matches!(self.component_state, ComponentState::Draining | ComponentState::Flushing) {
            log::debug!("dequeueing paused while the component drains or flushes");
            return;
        }
        if self.component_state != ComponentState::Started {
            log::error!("the work queue should be empty outside of the started state");
            return;
        }

        let Some(QueuedWork { mut work, drain_mode }) = self.incoming_queue.pop_front() else {
            return;
        };
        self.queued_count.fetch_sub(1, Ordering::SeqCst);

        if work.input.buffers.is_empty() {
            if drain_mode == DrainMode::NoDrain && !work.is_codec_config() {
                log::error!("a work without input must be an EOS or codec-config marker");
                self.report_error(C2Status::BadValue);
                return;
            }
            // Insert the placeholder so "no input" and "input returned" are
            // checked the same way later on.
            work.input.buffers.push(None);
        } else if let Some(Some(input)) = work.input.buffers.first() {
            if input.size == 0 {
                log::error!("input buffer with no content");
                self.report_error(C2Status::BadValue);
                return;
            }
            let bitstream_id = work.bitstream_id();
            let fd = match input.fd.as_fd().try_clone_to_owned() {
                Ok(fd) => fd,
                Err(e) => {
                    log::error!(
                        "failed to dup input buffer (bitstream id={}): {}",
                        bitstream_id,
                        e
                    );
                    self.report_error(C2Status::Corrupted);
                    return;
                }
            };
            log::debug!(
                "decode bitstream id={}, offset={}, size={}",
                bitstream_id,
                input.offset,
                input.size
            );
            let Some(vda) = self.vda.as_mut() else {
                self.report_error(C2Status::Corrupted);
                return;
            };
            if let Err(e) = vda.decode(bitstream_id, fd, input.offset, input.size) {
                self.report_error(e.to_status());
                return;
            }
        }

        work.worklet.output.flags = 0;
        work.worklet.output.buffers.clear();
        work.worklet.output.ordinal = work.input.ordinal;

        if drain_mode != DrainMode::NoDrain {
            let Some(vda) = self.vda.as_mut() else {
                self.report_error(C2Status::Corrupted);
                return;
            };
            if let Err(e) = vda.flush() {
                self.report_error(e.to_status());
                return;
            }
            self.component_state = ComponentState::Draining;
            self.pending_output_eos = drain_mode == DrainMode::WithEos;
        }

        self.pending_works.push_back(work);

        if !self.incoming_queue.is_empty() {
            self.tasks.post(ComponentTask::DequeueWork);
        }
    }

    fn on_drain(&mut self, mode: DrainMode) {
        log::debug!("on_drain: mode={:?}", mode);
        if !self.expect_running() {
            return;
        }

        if let Some(tail) = self.incoming_queue.back_mut() {
            // Mark the last queued work as the drain point; an existing mark
            // is kept.
            if tail.drain_mode == DrainMode::NoDrain {
                tail.drain_mode = mode;
            }
        } else if !self.pending_works.is_empty() {
            if self.component_state == ComponentState::Started {
                let Some(vda) = self.vda.as_mut() else {
                    self.report_error(C2Status::Corrupted);
                    return;
                };
                if let Err(e) = vda.flush() {
                    self.report_error(e.to_status());
                    return;
                }
                self.component_state = ComponentState::Draining;
                self.pending_output_eos = mode == DrainMode::WithEos;
            } else {
                log::debug!("drain neglected in state {:?}", self.component_state);
            }
        } else {
            log::debug!("no work in flight, drain takes no effect");
        }
    }

    fn on_drain_done(&mut self) {
        log::debug!("on_drain_done");
        match self.component_state {
            ComponentState::Draining => self.component_state = ComponentState::Started,
            // A stop or flush reset is in flight and owns the epilogue; EOS
            // must not be reported while stopping.
            ComponentState::Stopping | ComponentState::Flushing | ComponentState::Error => return,
            _ => {
                log::error!("unexpected drain done in state {:?}", self.component_state);
                self.report_error(C2Status::BadState);
                return;
            }
        }

        if self.pending_output_eos {
            self.report_eos_work();
        }
        if !self.pending_works.is_empty() {
            log::error!("works left pending after draining finished");
            self.report_error(C2Status::Corrupted);
            return;
        }

        // Dequeueing was paused while draining; resume it.
        self.tasks.post(ComponentTask::DequeueWork);
    }

    fn on_flush(&mut self) {
        log::debug!("on_flush");
        if matches!(self.component_state, ComponentState::Flushing | ComponentState::Stopping) {
            // Another flush or a stop is already tearing the queues down.
            return;
        }
        if !self.expect_running() {
            return;
        }

        let Some(vda) = self.vda.as_mut() else {
            self.report_error(C2Status::Corrupted);
            return;
        };
        if let Err(e) = vda.reset() {
            self.report_error(e.to_status());
            return;
        }
        while let Some(queued) = self.incoming_queue.pop_front() {
            self.queued_count.fetch_sub(1, Ordering::SeqCst);
            self.abandoned_works.push(queued.work);
        }
        self.component_state = ComponentState::Flushing;
    }

    fn on_flush_done(&mut self) {
        log::debug!("on_flush_done");
        self.report_abandoned_works();
        self.component_state = ComponentState::Started;

        // Dequeueing was paused while flushing; resume it.
        self.tasks.post(ComponentTask::DequeueWork);
    }

    fn on_reset_done(&mut self) {
        match self.component_state {
            ComponentState::Error => (),
            ComponentState::Flushing => self.on_flush_done(),
            ComponentState::Stopping => self.on_stop_done(),
            _ => {
                log::error!("unexpected reset done in state {:?}", self.component_state);
                self.report_error(C2Status::Corrupted);
            }
        }
    }

    fn on_input_buffer_done(&mut self, bitstream_id: i32) {
        log::debug!("on_input_buffer_done: bitstream id={}", bitstream_id);
        if !self.expect_running() {
            return;
        }

        let Some(work) =
            self.pending_works.iter_mut().find(|w| w.bitstream_id() == bitstream_id)
        else {
            log::error!("no pending work with bitstream id={}", bitstream_id);
            self.report_error(C2Status::Corrupted);
            return;
        };
        work.clear_input_buffer();

        self.report_finished_work_if_any();
    }

    fn on_output_buffer_done(&mut self, picture_buffer_id: i32, bitstream_id: i32) {
        log::debug!(
            "on_output_buffer_done: picture id={}, bitstream id={}",
            picture_buffer_id,
            bitstream_id
        );
        if !self.expect_running() {
            return;
        }

        if !self.pending_works.iter().any(|w| w.bitstream_id() == bitstream_id) {
            log::error!("no pending work with bitstream id={}", bitstream_id);
            self.report_error(C2Status::Corrupted);
            return;
        }

        let crop = self.registry.output_format().visible_rect;
        let block = match self.registry.take_block_for_client(picture_buffer_id) {
            Ok(block) => block,
            Err(status) => {
                self.report_error(status);
                return;
            }
        };
        self.buffers_in_client.fetch_add(1, Ordering::SeqCst);

        if let Some(work) =
            self.pending_works.iter_mut().find(|w| w.bitstream_id() == bitstream_id)
        {
            work.worklet.output.buffers.push(GraphicBuffer { block, crop });
        }

        self.report_finished_work_if_any();
    }

    fn on_output_buffer_returned(&mut self, block: GraphicBlock, pool_id: u32) {
        log::debug!("on_output_buffer_returned: pool id={}", pool_id);
        if self.component_state == ComponentState::Uninitialized {
            // Returned after the component stopped; let the buffer go.
            return;
        }

        let coded_size = self.registry.output_format().coded_size;
        if block.width() != coded_size.width || block.height() != coded_size.height {
            // Stale block from before a resolution change.
            log::debug!("discard obsolete graphic block: pool id={}", pool_id);
            return;
        }

        let block_id = match self.registry.return_block(block, pool_id) {
            Ok(block_id) => block_id,
            Err(status) => {
                self.report_error(status);
                return;
            }
        };

        if self.registry.pending_format().is_some() {
            self.try_change_output_format();
        } else {
            let Some(vda) = self.vda.as_mut() else {
                self.report_error(C2Status::Corrupted);
                return;
            };
            if let Err(status) = self.registry.send_to_accelerator(vda.as_mut(), block_id) {
                self.report_error(status);
            }
        }
    }

    fn on_output_format_changed(&mut self, format: VideoFormat) {
        log::debug!(
            "on_output_format_changed: pixel_format={:?}, min_num_buffers={}, coded_size={}, crop={}",
            format.pixel_format,
            format.min_num_buffers,
            format.coded_size,
            format.visible_rect
        );
        if !self.expect_running() {
            return;
        }

        if let Err(status) = self.registry.begin_format_change(format) {
            self.report_error(status);
            return;
        }
        self.try_change_output_format();
    }

    fn on_visible_rect_changed(&mut self, visible_rect: Rect) {
        log::debug!("on_visible_rect_changed: {}", visible_rect);
        if !self.expect_running() {
            return;
        }

        // The crop must refer to the current geometry.
        if self.registry.pending_format().is_some() {
            log::error!("visible rect changed while an output format change is pending");
            self.report_error(C2Status::BadState);
            return;
        }
        self.registry.set_visible_rect(visible_rect);
    }

    fn try_change_output_format(&mut self) {
        log::debug!("try_change_output_format");
        if self.registry.pending_format().is_none() {
            log::error!("no output format change pending");
            return;
        }

        match self.registry.pending_change_blocked_on_client() {
            Err(status) => {
                self.report_error(status);
                return;
            }
            Ok(true) => {
                log::debug!("output format change waits for client-held buffers");
                return;
            }
            Ok(false) => (),
        }

        let format = self.registry.commit_pending_format();
        if let Err(status) = self.allocate_buffers(format.coded_size, format.pixel_format) {
            self.registry.clear();
            self.report_error(status);
            return;
        }

        for block_id in self.registry.block_ids() {
            let Some(vda) = self.vda.as_mut() else {
                self.report_error(C2Status::Corrupted);
                return;
            };
            if let Err(status) = self.registry.send_to_accelerator(vda.as_mut(), block_id) {
                self.report_error(status);
                return;
            }
        }
    }

    fn allocate_buffers(
        &mut self,
        size: Resolution,
        pixel_format: HalPixelFormat,
    ) -> Result<(), C2Status> {
        // The dequeue thread must not race the pool while the buffer set is
        // rebuilt.
        self.stop_dequeue_thread();

        let buffer_count =
            self.registry.output_format().min_num_buffers + DPB_OUTPUT_BUFFER_EXTRA_COUNT;
        log::info!("allocating {} output buffers of {}", buffer_count, size);

        let Some(vda) = self.vda.as_mut() else {
            return Err(C2Status::Corrupted);
        };
        vda.assign_picture_buffers(buffer_count);

        if let Err(e) = self.pool.request_new_buffer_set(buffer_count) {
            log::error!("failed to request a new buffer set: {}", e);
            return Err(fetch_error_status(e));
        }

        self.registry.clear();
        let usage = self.memory_usage();
        for _ in 0..buffer_count {
            let block = self.fetch_block_with_retries(size, pixel_format, usage)?;
            let Some(pool_id) = self.pool.pool_id_of(&block) else {
                log::error!("failed to resolve the pool id of a fetched block");
                return Err(C2Status::Corrupted);
            };
            if self.secure_mode {
                let platform_format = self.pool.secure_pixel_format();
                self.registry.append_secure_output_buffer(block, pool_id, platform_format)?;
            } else {
                self.registry.append_output_buffer(block, pool_id)?;
            }
        }
        self.registry.set_min_num_buffers(buffer_count);

        self.start_dequeue_thread(size, pixel_format, usage)
    }

    fn fetch_block_with_retries(
        &self,
        size: Resolution,
        pixel_format: HalPixelFormat,
        usage: MemoryUsage,
    ) -> Result<GraphicBlock, C2Status> {
        let mut retries_left = ALLOCATE_BUFFER_MAX_RETRIES;
        loop {
            match self.pool.fetch_graphic_block(size.width, size.height, pixel_format, usage) {
                Ok(block) => return Ok(block),
                Err(FetchBlockError::TimedOut) => {
                    retries_left -= 1;
                    if retries_left == 0 {
                        log::error!(
                            "gave up fetching a block after {} timeouts",
                            ALLOCATE_BUFFER_MAX_RETRIES
                        );
                        return Err(C2Status::NoMemory);
                    }
                    log::debug!("allocate buffer timeout, {} retries left", retries_left);
                    thread::sleep(ALLOCATE_RETRY_DELAY);
                }
                Err(e) => {
                    log::error!("failed to allocate a buffer: {}", e);
                    return Err(fetch_error_status(e));
                }
            }
        }
    }

    fn memory_usage(&self) -> MemoryUsage {
        if self.secure_mode {
            MemoryUsage::READ_PROTECTED
        } else {
            MemoryUsage::CPU_READ
        }
    }

    fn start_dequeue_thread(
        &mut self,
        size: Resolution,
        pixel_format: HalPixelFormat,
        usage: MemoryUsage,
    ) -> Result<(), C2Status> {
        match DequeueThread::start(
            self.pool.clone(),
            self.tasks.clone(),
            self.buffers_in_client.clone(),
            size,
            pixel_format,
            usage,
        ) {
            Ok(thread) => {
                self.dequeue_thread = Some(thread);
                Ok(())
            }
            Err(e) => {
                log::error!("failed to start the dequeue thread: {}", e);
                Err(C2Status::Corrupted)
            }
        }
    }

    fn stop_dequeue_thread(&mut self) {
        if let Some(mut thread) = self.dequeue_thread.take() {
            thread.stop();
        }
    }

    /// A work is done once the accelerator returned its input and produced
    /// its output. EOS works and the last work of a pending drain are
    /// reported by the drain epilogue instead.
    fn is_work_done(&self, work: &C2Work) -> bool {
        if work.is_eos() {
            return false;
        }
        if !work.input_returned() {
            return false;
        }
        if self.pending_output_eos && self.pending_works.len() == 1 {
            return false;
        }
        if !work.is_codec_config() && work.worklet.output.buffers.is_empty() {
            return false;
        }
        true
    }

    fn report_finished_work_if_any(&mut self) {
        let mut finished: Vec<C2Work> = Vec::new();
        let mut i = 0;
        while i < self.pending_works.len() {
            if !self.is_work_done(&self.pending_works[i]) {
                i += 1;
                continue;
            }
            // Removal keeps the remaining works in submission order.
            if let Some(mut work) = self.pending_works.remove(i) {
                work.result = Some(C2Status::Ok);
                work.worklets_processed = 1;
                finished.push(work);
            }
        }

        if !finished.is_empty() {
            self.notify_work_done(finished);
        }
    }

    fn report_eos_work(&mut self) {
        log::debug!("report_eos_work");
        // Every work prior to the EOS one must have been reported by now.
        if self.pending_works.len() != 1 {
            log::error!("works other than the EOS work left pending");
            self.report_error(C2Status::Corrupted);
            return;
        }
        self.pending_output_eos = false;

        let Some(mut work) = self.pending_works.pop_front() else {
            return;
        };
        work.clear_input_buffer();
        work.result = Some(C2Status::Ok);
        work.worklets_processed = 1;
        work.worklet.output.flags |= FLAG_END_OF_STREAM;
        self.notify_work_done(vec![work]);
    }

    fn report_abandoned_works(&mut self) {
        let mut abandoned: Vec<C2Work> = Vec::new();
        while let Some(mut work) = self.pending_works.pop_front() {
            work.result = Some(C2Status::NotFound);
            work.clear_input_buffer();
            abandoned.push(work);
        }
        for mut work in self.abandoned_works.drain(..) {
            work.result = Some(C2Status::NotFound);
            work.clear_input_buffer();
            abandoned.push(work);
        }

        // A pending EOS is abandoned along with everything else.
        self.pending_output_eos = false;

        if !abandoned.is_empty() {
            self.notify_work_done(abandoned);
        }
    }

    fn notify_work_done(&self, works: Vec<C2Work>) {
        let listener = self.listener.lock().unwrap().clone();
        let Some(listener) = listener else {
            log::error!("dropping {} finished works without a listener", works.len());
            return;
        };
        listener.on_work_done(works);
    }

    /// Moves the component to the error state and tells the listener, once.
    fn report_error(&mut self, status: C2Status) {
        if self.component_state == ComponentState::Error {
            return;
        }
        self.component_state = ComponentState::Error;
        *self.state.lock().unwrap() = State::Error;

        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener.on_error(status);
        }
    }
}

// Timeouts stay internal to the allocation path; the listener only ever
// sees the exhaustion they amount to.
fn fetch_error_status(e: FetchBlockError) -> C2Status {
    match e {
        FetchBlockError::TimedOut | FetchBlockError::NoMemory => C2Status::NoMemory,
        FetchBlockError::Other(_) => C2Status::Corrupted,
    }
}
