// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The framework-facing component: a synchronous lifecycle surface over the
//! asynchronous pipeline running on the component thread.

mod dequeue;
mod output_buffers;
mod task_queue;
mod worker;

pub use output_buffers::VideoFormat;

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

use crate::block_pool::BlockPool;
use crate::intf::ComponentIntf;
use crate::vda::VdaFactory;
use crate::work::C2Work;
use crate::work::DrainMode;
use crate::work::WorkOrdinal;
use task_queue::TaskQueue;
use worker::ComponentTask;
use worker::ComponentWorker;

/// Status codes returned to the framework. Numerical values mirror the
/// framework ABI, which borrows them from errno.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum C2Status {
    Ok = 0,
    BadState = 1,  // EPERM
    NotFound = 2,  // ENOENT
    NoMemory = 12, // ENOMEM
    Corrupted = 14, // EFAULT
    BadValue = 22, // EINVAL
    Omitted = 38,  // ENOSYS
    TimedOut = 110, // ETIMEDOUT
}

/// The state machine on the framework side of the component.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// Construction did not complete; the component is unusable.
    Unloaded,
    /// Stopped. `start()` moves to `Running`.
    Loaded,
    /// Decoding. `stop()` or `reset()` moves back to `Loaded`.
    Running,
    /// The worker reported an error; only `stop()` makes progress.
    Error,
}

/// Receives completed work and errors. Calls arrive on the component thread.
pub trait Listener: Send + Sync {
    fn on_work_done(&self, works: Vec<C2Work>);
    fn on_error(&self, status: C2Status);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlushMode {
    /// Flush this component only.
    Component,
    /// Flush through the whole chain. Unsupported.
    Chain,
}

/// Incoming works outstanding beyond this bound are refused; the framework
/// must hold them back until earlier works drain.
pub const MAX_INCOMING_WORKS: usize = 64;

pub struct C2VdaComponent {
    intf: Arc<ComponentIntf>,
    state: Arc<Mutex<State>>,
    /// Serializes the lifecycle calls of concurrent framework threads.
    start_stop_lock: Mutex<()>,
    tasks: Arc<TaskQueue<ComponentTask>>,
    listener: Arc<Mutex<Option<Arc<dyn Listener>>>>,
    queued_count: Arc<AtomicUsize>,
    thread: Option<JoinHandle<()>>,
}

impl C2VdaComponent {
    /// Builds the interface for `name` and starts the component thread. The
    /// outer state is `Loaded` on success.
    pub fn new(
        name: &str,
        factory: Arc<dyn VdaFactory>,
        pool: Arc<dyn BlockPool>,
    ) -> Result<Self, C2Status> {
        let intf = Arc::new(ComponentIntf::new(name, factory.as_ref())?);
        let tasks = TaskQueue::new().map_err(|e| {
            log::error!("failed to create the task queue: {}", e);
            C2Status::Corrupted
        })?;
        let state = Arc::new(Mutex::new(State::Unloaded));
        let listener: Arc<Mutex<Option<Arc<dyn Listener>>>> = Arc::new(Mutex::new(None));
        let queued_count = Arc::new(AtomicUsize::new(0));

        let worker = ComponentWorker::new(
            tasks.clone(),
            state.clone(),
            listener.clone(),
            queued_count.clone(),
            factory,
            pool,
            intf.is_secure(),
        );
        let thread = thread::Builder::new()
            .name("c2-vda-component".into())
            .spawn(move || worker.run())
            .map_err(|e| {
                log::error!("component thread failed to start: {}", e);
                C2Status::Corrupted
            })?;

        *state.lock().unwrap() = State::Loaded;
        Ok(Self {
            intf,
            state,
            start_stop_lock: Mutex::new(()),
            tasks,
            listener,
            queued_count,
            thread: Some(thread),
        })
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    pub fn intf(&self) -> Arc<ComponentIntf> {
        self.intf.clone()
    }

    // The listener can only change while the component is stopped.
    pub fn set_listener(&self, listener: Arc<dyn Listener>, _may_block: bool) -> C2Status {
        if self.state() != State::Loaded {
            return C2Status::BadState;
        }
        *self.listener.lock().unwrap() = Some(listener);
        C2Status::Ok
    }

    /// Initializes the accelerator with the configured codec profile and
    /// blocks until it reports back.
    pub fn start(&self) -> C2Status {
        let _lock = self.start_stop_lock.lock().unwrap();

        if self.state() != State::Loaded {
            return C2Status::BadState;
        }

        let profile = self.intf.codec_profile();
        log::info!("starting with codec profile {:?}", profile);

        let (done, result) = mpsc::channel();
        self.tasks.post(ComponentTask::Start { profile, done });
        match result.recv() {
            Ok(Ok(())) => {
                *self.state.lock().unwrap() = State::Running;
                C2Status::Ok
            }
            Ok(Err(e)) => {
                log::error!("failed to start component due to accelerator error: {}", e);
                C2Status::Corrupted
            }
            Err(_) => C2Status::Corrupted,
        }
    }

    /// Tears the streaming session down and blocks until the worker has
    /// reported every in-flight work as abandoned.
    pub fn stop(&self) -> C2Status {
        let _lock = self.start_stop_lock.lock().unwrap();

        let state = self.state();
        if !(state == State::Running || state == State::Error) {
            // Already stopped.
            return C2Status::Ok;
        }

        let (done, stopped) = mpsc::channel();
        self.tasks.post(ComponentTask::Stop { done });
        let _ = stopped.recv();
        *self.state.lock().unwrap() = State::Loaded;
        C2Status::Ok
    }

    pub fn reset(&self) -> C2Status {
        // Reset is indistinguishable from stop for this component.
        self.stop()
    }

    pub fn release(&self) -> C2Status {
        self.reset()
    }

    /// Submits work items. On success the items are posted to the component
    /// thread in order; on refusal `works` is left untouched.
    pub fn queue(&self, works: &mut Vec<C2Work>) -> C2Status {
        if self.state() != State::Running {
            return C2Status::BadState;
        }

        let count = works.len();
        let outstanding = self.queued_count.fetch_add(count, Ordering::SeqCst);
        if outstanding + count > MAX_INCOMING_WORKS {
            self.queued_count.fetch_sub(count, Ordering::SeqCst);
            log::debug!("incoming queue full, {} works refused", count);
            return C2Status::BadState;
        }

        for work in works.drain(..) {
            self.tasks.post(ComponentTask::Queue { work });
        }
        C2Status::Ok
    }

    pub fn announce(&self, _outlines: &[WorkOrdinal]) -> C2Status {
        C2Status::Omitted // Tunneling is not supported.
    }

    /// Abandons queued and in-flight work. The abandoned items surface
    /// through the listener rather than `flushed_work`.
    pub fn flush(&self, mode: FlushMode, _flushed_work: &mut Vec<C2Work>) -> C2Status {
        if mode != FlushMode::Component {
            return C2Status::Omitted;
        }
        if self.state() != State::Running {
            return C2Status::BadState;
        }
        self.tasks.post(ComponentTask::Flush);
        C2Status::Ok
    }

    /// Requests that queued work be decoded without waiting for more input.
    pub fn drain(&self, mode: DrainMode) -> C2Status {
        if mode == DrainMode::NoDrain {
            return C2Status::Omitted;
        }
        if self.state() != State::Running {
            return C2Status::BadState;
        }
        self.tasks.post(ComponentTask::Drain { mode });
        C2Status::Ok
    }
}

impl Drop for C2VdaComponent {
    fn drop(&mut self) {
        self.stop();
        self.tasks.post(ComponentTask::Destroy);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_pool::FetchBlockError;
    use crate::block_pool::GraphicBlock;
    use crate::intf::VideoCodec;
    use crate::intf::VP8_DECODER_NAME;
    use crate::vda::FramePlane;
    use crate::vda::SupportedProfile;
    use crate::vda::VdaAdaptor;
    use crate::vda::VdaClient;
    use crate::vda::VdaError;
    use crate::vda::VdaResult;
    use crate::vda::VideoCodecProfile;
    use crate::work::frame_index_to_bitstream_id;
    use crate::work::LinearBlock;
    use crate::work::FLAG_END_OF_STREAM;
    use crate::HalPixelFormat;
    use crate::MemoryUsage;
    use crate::PlaneLayout;
    use crate::Rect;
    use crate::Resolution;
    use std::collections::HashMap;
    use std::collections::VecDeque;
    use std::fs::File;
    use std::os::fd::AsRawFd;
    use std::os::fd::OwnedFd;
    use std::os::fd::RawFd;
    use std::time::Duration;
    use std::time::Instant;

    const CODED_320: Resolution = Resolution { width: 320, height: 240 };
    const CODED_640: Resolution = Resolution { width: 640, height: 480 };

    fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn null_fd() -> OwnedFd {
        OwnedFd::from(File::open("/dev/null").unwrap())
    }

    fn test_block(size: Resolution) -> GraphicBlock {
        let y_size = (size.width * size.height) as usize;
        GraphicBlock {
            handle: null_fd(),
            size,
            planes: vec![
                PlaneLayout { offset: 0, row_stride: size.width as usize, col_inc: 1 },
                PlaneLayout { offset: y_size, row_stride: size.width as usize / 2, col_inc: 1 },
                PlaneLayout {
                    offset: y_size + y_size / 4,
                    row_stride: size.width as usize / 2,
                    col_inc: 1,
                },
            ],
        }
    }

    fn input_work(frame_index: u64, timestamp: u64) -> C2Work {
        C2Work::new(
            0,
            WorkOrdinal { frame_index, timestamp },
            Some(LinearBlock { fd: null_fd(), offset: 0, size: 1024 }),
        )
    }

    fn eos_work(frame_index: u64) -> C2Work {
        C2Work::new(FLAG_END_OF_STREAM, WorkOrdinal { frame_index, timestamp: 0 }, None)
    }

    #[derive(Clone, Debug, PartialEq)]
    enum VdaCall {
        Initialize { profile: VideoCodecProfile, secure_mode: bool },
        Decode { bitstream_id: i32, offset: u32, bytes_used: u32 },
        AssignPictureBuffers { count: u32 },
        ImportBufferForPicture { picture_buffer_id: i32, format: HalPixelFormat, num_planes: usize },
        ReusePictureBuffer { picture_buffer_id: i32 },
        Flush,
        Reset,
        Destroy,
    }

    #[derive(Default)]
    struct FakeVdaState {
        client: Option<Arc<dyn VdaClient>>,
        calls: Vec<VdaCall>,
        init_error: Option<VdaError>,
        auto_reset_done: bool,
    }

    #[derive(Clone)]
    struct FakeVdaHandle(Arc<Mutex<FakeVdaState>>);

    impl FakeVdaHandle {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(FakeVdaState {
                auto_reset_done: true,
                ..Default::default()
            })))
        }

        fn client(&self) -> Arc<dyn VdaClient> {
            self.0.lock().unwrap().client.clone().expect("accelerator not initialized")
        }

        fn calls(&self) -> Vec<VdaCall> {
            self.0.lock().unwrap().calls.clone()
        }

        fn decode_ids(&self) -> Vec<i32> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    VdaCall::Decode { bitstream_id, .. } => Some(bitstream_id),
                    _ => None,
                })
                .collect()
        }

        fn count(&self, pred: impl Fn(&VdaCall) -> bool) -> usize {
            self.0.lock().unwrap().calls.iter().filter(|call| pred(call)).count()
        }

        fn import_count(&self) -> usize {
            self.count(|call| matches!(call, VdaCall::ImportBufferForPicture { .. }))
        }

        fn flush_count(&self) -> usize {
            self.count(|call| matches!(call, VdaCall::Flush))
        }

        fn reset_count(&self) -> usize {
            self.count(|call| matches!(call, VdaCall::Reset))
        }

        fn set_auto_reset_done(&self, auto: bool) {
            self.0.lock().unwrap().auto_reset_done = auto;
        }

        fn set_init_error(&self, error: VdaError) {
            self.0.lock().unwrap().init_error = Some(error);
        }
    }

    struct FakeVda(FakeVdaHandle);

    impl VdaAdaptor for FakeVda {
        fn initialize(
            &mut self,
            profile: VideoCodecProfile,
            secure_mode: bool,
            client: Arc<dyn VdaClient>,
        ) -> VdaResult<()> {
            let mut state = self.0 .0.lock().unwrap();
            state.calls.push(VdaCall::Initialize { profile, secure_mode });
            state.client = Some(client);
            match state.init_error.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn decode(
            &mut self,
            bitstream_id: i32,
            _fd: OwnedFd,
            offset: u32,
            bytes_used: u32,
        ) -> VdaResult<()> {
            self.0 .0.lock().unwrap().calls.push(VdaCall::Decode {
                bitstream_id,
                offset,
                bytes_used,
            });
            Ok(())
        }

        fn assign_picture_buffers(&mut self, count: u32) {
            self.0 .0.lock().unwrap().calls.push(VdaCall::AssignPictureBuffers { count });
        }

        fn import_buffer_for_picture(
            &mut self,
            picture_buffer_id: i32,
            format: HalPixelFormat,
            _fd: OwnedFd,
            planes: Vec<FramePlane>,
        ) -> VdaResult<()> {
            self.0 .0.lock().unwrap().calls.push(VdaCall::ImportBufferForPicture {
                picture_buffer_id,
                format,
                num_planes: planes.len(),
            });
            Ok(())
        }

        fn reuse_picture_buffer(&mut self, picture_buffer_id: i32) -> VdaResult<()> {
            self.0 .0.lock().unwrap().calls.push(VdaCall::ReusePictureBuffer { picture_buffer_id });
            Ok(())
        }

        fn flush(&mut self) -> VdaResult<()> {
            self.0 .0.lock().unwrap().calls.push(VdaCall::Flush);
            Ok(())
        }

        fn reset(&mut self) -> VdaResult<()> {
            let client = {
                let mut state = self.0 .0.lock().unwrap();
                state.calls.push(VdaCall::Reset);
                if state.auto_reset_done { state.client.clone() } else { None }
            };
            if let Some(client) = client {
                client.notify_reset_done();
            }
            Ok(())
        }

        fn destroy(&mut self) {
            self.0 .0.lock().unwrap().calls.push(VdaCall::Destroy);
        }
    }

    struct FakeVdaFactory {
        vda: FakeVdaHandle,
    }

    impl VdaFactory for FakeVdaFactory {
        fn supported_profiles(&self, codec: VideoCodec) -> Vec<SupportedProfile> {
            let profile = match codec {
                VideoCodec::H264 => VideoCodecProfile::H264Main,
                VideoCodec::Vp8 => VideoCodecProfile::Vp8Profile0,
                VideoCodec::Vp9 => VideoCodecProfile::Vp9Profile0,
            };
            vec![SupportedProfile {
                profile,
                min_resolution: Resolution { width: 32, height: 32 },
                max_resolution: Resolution { width: 4096, height: 4096 },
            }]
        }

        fn create(&self) -> Box<dyn VdaAdaptor> {
            Box::new(FakeVda(self.vda.clone()))
        }
    }

    #[derive(Default)]
    struct FakePoolState {
        free_slots: VecDeque<u32>,
        next_pool_id: u32,
        fd_to_pool_id: HashMap<RawFd, u32>,
        timeouts_to_inject: usize,
    }

    #[derive(Clone, Default)]
    struct FakePool(Arc<Mutex<FakePoolState>>);

    impl FakePool {
        fn inject_timeouts(&self, count: usize) {
            self.0.lock().unwrap().timeouts_to_inject = count;
        }

        /// The client released a buffer; its slot is fetchable again.
        fn release(&self, pool_id: u32) {
            self.0.lock().unwrap().free_slots.push_back(pool_id);
        }
    }

    impl BlockPool for FakePool {
        fn allocator_id(&self) -> u32 {
            0
        }

        fn request_new_buffer_set(&self, count: u32) -> Result<(), FetchBlockError> {
            let mut state = self.0.lock().unwrap();
            let first = state.next_pool_id;
            state.free_slots = (first..first + count).collect();
            state.next_pool_id += count;
            Ok(())
        }

        fn fetch_graphic_block(
            &self,
            width: u32,
            height: u32,
            _format: HalPixelFormat,
            _usage: MemoryUsage,
        ) -> Result<GraphicBlock, FetchBlockError> {
            let fetched = {
                let mut state = self.0.lock().unwrap();
                if state.timeouts_to_inject > 0 {
                    state.timeouts_to_inject -= 1;
                    None
                } else if let Some(pool_id) = state.free_slots.pop_front() {
                    let block = test_block(Resolution { width, height });
                    state.fd_to_pool_id.insert(block.handle.as_raw_fd(), pool_id);
                    Some(block)
                } else {
                    None
                }
            };
            match fetched {
                Some(block) => Ok(block),
                None => {
                    // A real pool blocks for a while before timing out.
                    thread::sleep(Duration::from_millis(1));
                    Err(FetchBlockError::TimedOut)
                }
            }
        }

        fn pool_id_of(&self, block: &GraphicBlock) -> Option<u32> {
            self.0.lock().unwrap().fd_to_pool_id.get(&block.handle.as_raw_fd()).copied()
        }
    }

    #[derive(Default)]
    struct ListenerState {
        batches: Vec<Vec<C2Work>>,
        errors: Vec<C2Status>,
    }

    #[derive(Clone, Default)]
    struct TestListener(Arc<Mutex<ListenerState>>);

    impl Listener for TestListener {
        fn on_work_done(&self, works: Vec<C2Work>) {
            self.0.lock().unwrap().batches.push(works);
        }

        fn on_error(&self, status: C2Status) {
            self.0.lock().unwrap().errors.push(status);
        }
    }

    impl TestListener {
        fn total_done(&self) -> usize {
            self.0.lock().unwrap().batches.iter().map(|batch| batch.len()).sum()
        }

        fn take_batches(&self) -> Vec<Vec<C2Work>> {
            std::mem::take(&mut self.0.lock().unwrap().batches)
        }

        fn errors(&self) -> Vec<C2Status> {
            self.0.lock().unwrap().errors.clone()
        }
    }

    struct TestSession {
        component: C2VdaComponent,
        vda: FakeVdaHandle,
        pool: FakePool,
        listener: TestListener,
    }

    impl TestSession {
        fn new() -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let vda = FakeVdaHandle::new();
            let pool = FakePool::default();
            let listener = TestListener::default();
            let component = C2VdaComponent::new(
                VP8_DECODER_NAME,
                Arc::new(FakeVdaFactory { vda: vda.clone() }),
                Arc::new(pool.clone()),
            )
            .unwrap();
            assert_eq!(component.set_listener(Arc::new(listener.clone()), false), C2Status::Ok);
            Self { component, vda, pool, listener }
        }

        fn started() -> Self {
            let session = Self::new();
            assert_eq!(session.component.start(), C2Status::Ok);
            session
        }

        fn provide_output_buffers(&self, min_num_buffers: u32, coded_size: Resolution) {
            let imports_before = self.vda.import_count();
            self.vda.client().provide_picture_buffers(min_num_buffers, coded_size);
            let expected = imports_before + (min_num_buffers + 3) as usize;
            wait_for("output buffers imported", || self.vda.import_count() >= expected);
        }

        fn queue(&self, works: Vec<C2Work>) -> C2Status {
            let mut works = works;
            self.component.queue(&mut works)
        }

        /// Returns the input buffer and emits the decoded picture for one
        /// frame, using the identity mapping of picture and bitstream IDs.
        fn complete_frame(&self, id: i32, coded_size: Resolution) {
            let client = self.vda.client();
            client.notify_end_of_bitstream_buffer(id);
            client.picture_ready(id, id, Rect::from(coded_size));
        }
    }

    #[test]
    fn simple_three_frame_decode() {
        let session = TestSession::started();
        session.provide_output_buffers(6, CODED_320);

        assert_eq!(
            session.vda.count(|c| matches!(c, VdaCall::AssignPictureBuffers { count: 9 })),
            1
        );

        let timestamps = [0u64, 33333, 66666];
        let works: Vec<C2Work> =
            (0..3).map(|i| input_work(i as u64, timestamps[i])).collect();
        assert_eq!(session.queue(works), C2Status::Ok);

        wait_for("three decodes", || session.vda.decode_ids().len() == 3);
        assert_eq!(session.vda.decode_ids(), vec![0, 1, 2]);

        for id in 0..3 {
            session.complete_frame(id, CODED_320);
        }

        wait_for("three works done", || session.listener.total_done() == 3);
        let works: Vec<C2Work> =
            session.listener.take_batches().into_iter().flatten().collect();
        for (i, work) in works.iter().enumerate() {
            assert_eq!(work.input.ordinal.frame_index, i as u64);
            assert_eq!(work.worklet.output.ordinal.timestamp, timestamps[i]);
            assert_eq!(work.result, Some(C2Status::Ok));
            assert_eq!(work.worklets_processed, 1);
            assert_eq!(work.worklet.output.buffers.len(), 1);
            let buffer = &work.worklet.output.buffers[0];
            assert_eq!(buffer.block.size, CODED_320);
            assert_eq!(buffer.crop.width(), 320);
            assert_eq!(buffer.crop.height(), 240);
        }
    }

    #[test]
    fn eos_drain_reports_a_single_marked_work() {
        let session = TestSession::started();
        session.provide_output_buffers(6, CODED_320);

        assert_eq!(session.queue((0..3).map(|i| input_work(i, i * 33333)).collect()), C2Status::Ok);
        wait_for("three decodes", || session.vda.decode_ids().len() == 3);
        for id in 0..3 {
            session.complete_frame(id, CODED_320);
        }
        wait_for("three works done", || session.listener.total_done() == 3);
        session.listener.take_batches();

        assert_eq!(session.queue(vec![eos_work(3)]), C2Status::Ok);
        wait_for("accelerator flushed", || session.vda.flush_count() == 1);
        assert_eq!(session.vda.flush_count(), 1);

        session.vda.client().notify_flush_done();
        wait_for("EOS work done", || session.listener.total_done() == 1);

        let batches = session.listener.take_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        let eos = &batches[0][0];
        assert_eq!(eos.input.ordinal.frame_index, 3);
        assert_eq!(eos.result, Some(C2Status::Ok));
        assert_ne!(eos.worklet.output.flags & FLAG_END_OF_STREAM, 0);
        assert!(eos.worklet.output.buffers.is_empty());
    }

    #[test]
    fn mid_stream_flush_abandons_everything_in_order() {
        let session = TestSession::started();
        session.provide_output_buffers(6, CODED_320);

        assert_eq!(session.queue((0..10).map(|i| input_work(i, i)).collect()), C2Status::Ok);
        wait_for("ten decodes", || session.vda.decode_ids().len() == 10);

        // Three pictures come out, but none of the inputs has been returned.
        let client = session.vda.client();
        for id in 0..3 {
            client.picture_ready(id, id, Rect::from(CODED_320));
        }

        assert_eq!(
            session.component.flush(FlushMode::Component, &mut Vec::new()),
            C2Status::Ok
        );

        wait_for("ten works abandoned", || session.listener.total_done() == 10);
        assert_eq!(session.vda.reset_count(), 1);

        let batches = session.listener.take_batches();
        assert_eq!(batches.len(), 1, "abandoned works must arrive as one batch");
        let works = &batches[0];
        for (i, work) in works.iter().enumerate() {
            assert_eq!(work.input.ordinal.frame_index, i as u64);
            assert_eq!(work.result, Some(C2Status::NotFound));
            assert!(work.input_returned(), "abandoned input buffers must be cleared");
        }

        // The component is decoding again after the flush.
        assert_eq!(session.queue(vec![input_work(10, 10)]), C2Status::Ok);
        wait_for("decode resumes", || session.vda.decode_ids().len() == 11);
    }

    #[test]
    fn flush_twice_is_idempotent() {
        let session = TestSession::started();
        session.provide_output_buffers(6, CODED_320);

        assert_eq!(session.queue((0..4).map(|i| input_work(i, i)).collect()), C2Status::Ok);
        wait_for("four decodes", || session.vda.decode_ids().len() == 4);

        assert_eq!(
            session.component.flush(FlushMode::Component, &mut Vec::new()),
            C2Status::Ok
        );
        assert_eq!(
            session.component.flush(FlushMode::Component, &mut Vec::new()),
            C2Status::Ok
        );

        wait_for("four works abandoned", || session.listener.total_done() == 4);
        assert!(session.listener.errors().is_empty());

        // Still in a working state, with nothing left over from the flushes.
        assert_eq!(session.queue(vec![input_work(4, 4)]), C2Status::Ok);
        wait_for("decode resumes", || session.vda.decode_ids().len() == 5);
        assert_eq!(session.listener.total_done(), 4);
    }

    #[test]
    fn format_change_waits_for_client_and_reallocates() {
        let session = TestSession::started();
        session.provide_output_buffers(6, CODED_320);

        assert_eq!(session.queue((0..3).map(|i| input_work(i, i)).collect()), C2Status::Ok);
        wait_for("three decodes", || session.vda.decode_ids().len() == 3);
        for id in 0..3 {
            session.complete_frame(id, CODED_320);
        }
        wait_for("three works done", || session.listener.total_done() == 3);
        // Drop the delivered works, releasing their graphic buffers.
        session.listener.take_batches();

        // The stream switches to 640x480 with a deeper buffer requirement.
        session.vda.client().provide_picture_buffers(8, CODED_640);

        // Reallocation holds off until the client returns the three buffers
        // it still owns; blocks 0..2 landed in pool slots 0..2.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(
            session.vda.count(|c| matches!(c, VdaCall::AssignPictureBuffers { count: 11 })),
            0
        );
        for pool_id in 0..3 {
            session.pool.release(pool_id);
        }

        wait_for("new buffer set imported", || session.vda.import_count() == 9 + 11);
        assert_eq!(
            session.vda.count(|c| matches!(c, VdaCall::AssignPictureBuffers { count: 11 })),
            1
        );

        // Every new buffer reaches the accelerator before any further decode.
        assert_eq!(session.queue(vec![input_work(3, 3)]), C2Status::Ok);
        wait_for("decode resumes", || session.vda.decode_ids().len() == 4);

        let calls = session.vda.calls();
        let assign = calls
            .iter()
            .position(|c| matches!(c, VdaCall::AssignPictureBuffers { count: 11 }))
            .unwrap();
        let next_decode = calls[assign..]
            .iter()
            .position(|c| matches!(c, VdaCall::Decode { .. }))
            .map(|i| assign + i)
            .unwrap();
        let imports_between = calls[assign..next_decode]
            .iter()
            .filter(|c| matches!(c, VdaCall::ImportBufferForPicture { .. }))
            .count();
        assert_eq!(imports_between, 11);
        assert!(session.listener.errors().is_empty());
    }

    #[test]
    fn allocation_survives_nine_timeouts() {
        let session = TestSession::started();
        session.pool.inject_timeouts(9);
        session.provide_output_buffers(6, CODED_320);
        assert!(session.listener.errors().is_empty());
    }

    #[test]
    fn allocation_fails_after_ten_timeouts() {
        let session = TestSession::started();
        session.pool.inject_timeouts(10);
        session.vda.client().provide_picture_buffers(6, CODED_320);

        wait_for("allocation error", || !session.listener.errors().is_empty());
        assert_eq!(session.listener.errors(), vec![C2Status::NoMemory]);

        // The component refuses further work from the error state.
        assert_eq!(session.queue(vec![input_work(0, 0)]), C2Status::BadState);
    }

    #[test]
    fn stop_during_drain_abandons_without_eos() {
        let session = TestSession::started();
        session.provide_output_buffers(6, CODED_320);

        assert_eq!(session.queue((0..5).map(|i| input_work(i, i)).collect()), C2Status::Ok);
        wait_for("five decodes", || session.vda.decode_ids().len() == 5);

        assert_eq!(session.component.drain(DrainMode::WithEos), C2Status::Ok);
        wait_for("accelerator flushed", || session.vda.flush_count() == 1);

        // Stop lands before the drain completes; its reset supersedes it.
        assert_eq!(session.component.stop(), C2Status::Ok);
        assert_eq!(session.vda.reset_count(), 1);
        assert_eq!(session.component.state(), State::Loaded);

        assert_eq!(session.listener.total_done(), 5);
        let batches = session.listener.take_batches();
        for work in batches.into_iter().flatten() {
            assert_eq!(work.result, Some(C2Status::NotFound));
            assert_eq!(work.worklet.output.flags & FLAG_END_OF_STREAM, 0);
        }
    }

    #[test]
    fn flush_done_while_stopping_is_dropped() {
        let session = TestSession::started();
        session.provide_output_buffers(6, CODED_320);

        assert_eq!(session.queue((0..2).map(|i| input_work(i, i)).collect()), C2Status::Ok);
        wait_for("two decodes", || session.vda.decode_ids().len() == 2);

        assert_eq!(session.component.drain(DrainMode::WithEos), C2Status::Ok);
        wait_for("accelerator flushed", || session.vda.flush_count() == 1);

        session.vda.set_auto_reset_done(false);
        let component = &session.component;
        thread::scope(|scope| {
            let stopper = scope.spawn(|| component.stop());
            wait_for("stop reset issued", || session.vda.reset_count() == 1);

            // The late drain completion must not resurrect the EOS work.
            let client = session.vda.client();
            client.notify_flush_done();
            client.notify_reset_done();

            assert_eq!(stopper.join().unwrap(), C2Status::Ok);
        });

        for work in session.listener.take_batches().into_iter().flatten() {
            assert_eq!(work.result, Some(C2Status::NotFound));
            assert_eq!(work.worklet.output.flags & FLAG_END_OF_STREAM, 0);
        }
        assert!(session.listener.errors().is_empty());
    }

    #[test]
    fn component_can_restart_after_stop() {
        let session = TestSession::started();
        session.provide_output_buffers(6, CODED_320);
        assert_eq!(session.component.stop(), C2Status::Ok);

        assert_eq!(session.component.start(), C2Status::Ok);
        assert_eq!(
            session.vda.count(|c| matches!(c, VdaCall::Initialize { .. })),
            2
        );
        assert_eq!(session.component.state(), State::Running);
    }

    #[test]
    fn start_failure_keeps_the_component_loaded() {
        let session = TestSession::new();
        session.vda.set_init_error(VdaError::PlatformFailure);
        assert_eq!(session.component.start(), C2Status::Corrupted);
        assert_eq!(session.component.state(), State::Loaded);

        // A later attempt may succeed.
        assert_eq!(session.component.start(), C2Status::Ok);
    }

    #[test]
    fn entry_points_require_the_right_state() {
        let session = TestSession::new();
        assert_eq!(session.queue(vec![input_work(0, 0)]), C2Status::BadState);
        assert_eq!(session.component.drain(DrainMode::WithEos), C2Status::BadState);
        assert_eq!(
            session.component.flush(FlushMode::Component, &mut Vec::new()),
            C2Status::BadState
        );
        assert_eq!(session.component.announce(&[]), C2Status::Omitted);

        assert_eq!(session.component.start(), C2Status::Ok);
        assert_eq!(session.component.drain(DrainMode::NoDrain), C2Status::Omitted);
        assert_eq!(
            session.component.flush(FlushMode::Chain, &mut Vec::new()),
            C2Status::Omitted
        );
        // The listener cannot change while running.
        assert_eq!(
            session.component.set_listener(Arc::new(session.listener.clone()), false),
            C2Status::BadState
        );
        // A second start is refused.
        assert_eq!(session.component.start(), C2Status::BadState);

        assert_eq!(session.component.stop(), C2Status::Ok);
        // Stopping twice is harmless.
        assert_eq!(session.component.stop(), C2Status::Ok);
    }

    #[test]
    fn queue_applies_backpressure() {
        let session = TestSession::started();

        // Do not provide output buffers: nothing is dequeued on the worker
        // side fast enough to matter, and the refusal happens up front.
        let mut works: Vec<C2Work> =
            (0..MAX_INCOMING_WORKS as u64 + 1).map(|i| input_work(i, i)).collect();
        assert_eq!(session.component.queue(&mut works), C2Status::BadState);
        // The refused works stay with the caller.
        assert_eq!(works.len(), MAX_INCOMING_WORKS + 1);
    }

    #[test]
    fn bitstream_ids_are_unique_among_pending_works() {
        let session = TestSession::started();
        session.provide_output_buffers(6, CODED_320);

        assert_eq!(session.queue((0..8).map(|i| input_work(i, i)).collect()), C2Status::Ok);
        wait_for("eight decodes", || session.vda.decode_ids().len() == 8);

        let ids = session.vda.decode_ids();
        let mut deduped = ids.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), ids.len());
        assert_eq!(ids, (0..8).map(|i| frame_index_to_bitstream_id(i)).collect::<Vec<_>>());
    }
}
