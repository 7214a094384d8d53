//! 命令队列
//!
//! `Queue` 拥有一个硬件队列和一个命令列表池。提交流程：
//!
//! 1. 丢弃设备重置之前录制的命令列表，空列表直接回收
//! 2. 按顺序关闭每个列表，追踪器把待定转换与全局状态衔接起来
//! 3. 为每个列表占用一个栅栏值
//! 4. 处理本批次的隐式衰减
//! 5. 让所有引用的内存驻留，驻留完成值加入等待集
//! 6. 在队列上等待依赖，执行原生列表，逐个发出栅栏值
//! 7. 已提交的列表交给后台线程，GPU 完成之后重置并放回池中

use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use super::command::{Commands, CommandsData};
use super::device::Device;
use super::device_child::{DeviceChild, DeviceChildHandle, ResetPriority};
use super::sync::{Fence, FenceValue, FenceValues};
use super::tracker::DecayBatch;
use crate::core::error::{DeviceError, Result};
use crate::gfx::backend::{QueueKind, RawQueue};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// 后台线程检查完成情况的间隔
const RECYCLE_POLL: Duration = Duration::from_millis(1);

/// 等待后台线程回收的上限
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

struct Retired {
    value: FenceValue,
    data: CommandsData,
}

#[derive(Default)]
struct PoolState {
    ready: Vec<CommandsData>,
    in_flight: usize,
}

/// 可复用的命令列表
struct CommandPool {
    device: Arc<Device>,
    name: String,
    state: Mutex<PoolState>,
    idle: Condvar,
}

impl CommandPool {
    fn new(device: Arc<Device>, name: &str) -> Self {
        Self {
            device,
            name: name.to_string(),
            state: Mutex::new(PoolState::default()),
            idle: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 取出一个属于当前设备的列表，过期的直接销毁
    fn take(&self, generation: u64) -> Option<CommandsData> {
        let mut stale = Vec::new();
        let found = {
            let mut state = self.state();
            loop {
                match state.ready.pop() {
                    Some(data) if data.generation() == generation => break Some(data),
                    Some(data) => stale.push(data),
                    None => break None,
                }
            }
        };

        drop(stale);
        found
    }

    /// 还没有提交过的列表直接放回
    fn push_ready(&self, data: CommandsData) {
        if data.generation() == self.device.generation() {
            self.state().ready.push(data);
        }
    }

    fn begin_flight(&self, count: usize) {
        self.state().in_flight += count;
    }

    /// GPU 完成之后由后台线程调用
    fn recycle(&self, mut data: CommandsData) {
        if data.generation() == self.device.generation() && self.device.is_valid() {
            match data.reset() {
                Ok(()) => self.state().ready.push(data),
                Err(e) => warn!(queue = %self.name, error = %e, "Failed to reset command list"),
            }
        }

        self.recycle_dropped();
    }

    /// 一个已提交的列表离开流水线
    fn recycle_dropped(&self) {
        let mut state = self.state();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.idle.notify_all();
        }
    }

    /// 等待所有已提交的列表被回收
    fn wait_idle(&self) {
        let state = self.state();
        let (state, timeout) = self
            .idle
            .wait_timeout_while(state, IDLE_TIMEOUT, |s| s.in_flight > 0)
            .unwrap_or_else(PoisonError::into_inner);

        if timeout.timed_out() {
            warn!(queue = %self.name, in_flight = state.in_flight, "Timed out waiting for command lists");
        }
    }

    fn clear(&self) {
        let ready = std::mem::take(&mut self.state().ready);
        drop(ready);
    }
}

/// 后台回收：按提交顺序等待 GPU 完成，然后重置
fn recycle_worker(pool: Arc<CommandPool>, receiver: Receiver<Retired>) {
    let mut pending: VecDeque<Retired> = VecDeque::new();
    let mut connected = true;

    while connected || !pending.is_empty() {
        let received = if pending.is_empty() {
            receiver.recv().map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            receiver.recv_timeout(RECYCLE_POLL)
        };

        match received {
            Ok(retired) => pending.push_back(retired),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => connected = false,
        }

        while pending.front().is_some_and(|r| r.value.complete()) {
            if let Some(retired) = pending.pop_front() {
                pool.recycle(retired.data);
            }
        }

        // 队列已销毁，剩下的列表不会再被使用
        if !connected {
            for retired in pending.drain(..) {
                drop(retired.data);
                pool.recycle_dropped();
            }
        }
    }

    debug!(queue = %pool.name, "Command list recycler stopped");
}

/// 硬件命令队列
pub struct Queue {
    name: String,
    kind: QueueKind,
    id: u64,
    device: Arc<Device>,
    raw: Mutex<Option<RawQueue>>,
    residency_fence: Arc<Fence>,
    idle_fence: Fence,
    pool: Arc<CommandPool>,
    sender: Mutex<Option<Sender<Retired>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    submit: Mutex<()>,
    _child: DeviceChildHandle,
}

impl Queue {
    /// 创建队列；`residency_fence` 由所有队列共享，驻留调入在它上面完成
    pub fn new(device: &Arc<Device>, name: &str, kind: QueueKind, residency_fence: Arc<Fence>) -> Result<Arc<Self>> {
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let backend = device.backend();

        let raw = backend.create_queue(kind).map_err(|e| {
            device.fatal_error(&format!("failed to create {} queue: {}", name, e));
            e
        })?;

        let idle_fence = match Fence::with_queue_id(device, format!("{} idle", name), Some(id)) {
            Ok(fence) => fence,
            Err(e) => {
                backend.destroy_queue(raw);
                return Err(e);
            }
        };

        let pool = Arc::new(CommandPool::new(device.clone(), name));
        let (sender, receiver) = crossbeam_channel::unbounded();
        let worker = {
            let pool = pool.clone();
            thread::Builder::new()
                .name(format!("{} recycler", name))
                .spawn(move || recycle_worker(pool, receiver))
        };
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                backend.destroy_queue(raw);
                return Err(e.into());
            }
        };

        info!(queue = name, kind = kind.name(), "Queue created");

        Ok(Arc::new_cyclic(|weak: &Weak<Queue>| {
            let child: Weak<dyn DeviceChild> = weak.clone();
            Self {
                name: name.to_string(),
                kind,
                id,
                device: device.clone(),
                raw: Mutex::new(Some(raw)),
                residency_fence,
                idle_fence,
                pool,
                sender: Mutex::new(Some(sender)),
                worker: Mutex::new(Some(worker)),
                submit: Mutex::new(()),
                _child: device.children().register(child, ResetPriority::Queue),
            }
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn raw(&self) -> Option<RawQueue> {
        *self.raw.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 借出一个命令列表，池中没有可用的时新建
    pub fn new_commands(self: &Arc<Self>) -> Result<Commands> {
        let data = match self.pool.take(self.device.generation()) {
            Some(data) => data,
            None => {
                debug!(queue = %self.name, "Creating command list");
                CommandsData::new(&self.device, &self.name, self.kind, self.id)?
            }
        };

        Ok(Commands::new(self.clone(), data))
    }

    pub fn execute_one(&self, commands: &mut Commands) -> Result<FenceValue> {
        let value = commands.next_fence_value();
        self.execute(std::slice::from_mut(commands))?;
        Ok(value)
    }

    /// 按顺序提交一批命令列表，返回它们完成时的栅栏值
    pub fn execute(&self, commands: &mut [Commands]) -> Result<FenceValues> {
        let _span = crate::span_trace!("execute").entered();
        let _submit = self.submit.lock().unwrap_or_else(PoisonError::into_inner);

        let mut waits = FenceValues::default();
        let mut batch = DecayBatch::new();
        let mut submitted: Vec<CommandsData> = Vec::new();

        for commands in commands.iter_mut() {
            if commands.is_empty() {
                if let Some(data) = commands.take_data() {
                    // 可能已经有人拿到了这个值
                    data.fence().signal(None);
                    self.pool.push_ready(data);
                }
                continue;
            }

            if !commands.is_valid() {
                warn!(queue = %self.name, "Discarding commands recorded before device reset");
                drop(commands.take_data());
                continue;
            }

            commands.close(&mut waits, &mut batch);
            if let Some(data) = commands.take_data() {
                submitted.push(data);
            }
        }

        let mut values = FenceValues::default();
        if submitted.is_empty() {
            return Ok(values);
        }

        let reserved: Vec<FenceValue> = submitted.iter().map(|d| d.fence().signal_later()).collect();
        reserved.iter().for_each(|v| values.add(v.clone()));

        let residency_set: HashSet<_> = submitted.iter().flat_map(|d| d.residency_set().iter().copied()).collect();
        let outcome = self.device.residency().make_resident(&residency_set, &values, &self.residency_fence, &mut waits);

        if !outcome.should_execute(self.device.config().residency.over_budget) {
            crate::residency_warn!(
                queue = %self.name,
                over_budget = outcome.over_budget,
                "Skipping execution, referenced memory is not resident"
            );
            self.abandon(submitted, &reserved);
            return Err(DeviceError::CommandExecution("referenced memory could not be made resident".to_string()).into());
        }

        if let Err(e) = waits.wait(Some(self)) {
            self.device.fatal_error(&format!("{} queue wait failed: {}", self.name, e));
            self.abandon(submitted, &reserved);
            return Err(e);
        }

        let Some(raw) = self.raw() else {
            self.abandon(submitted, &reserved);
            return Err(DeviceError::Removed(format!("{} queue is released", self.name)).into());
        };

        let lists: Vec<_> = submitted.iter().flat_map(CommandsData::lists).collect();
        if let Err(e) = self.device.backend().execute_command_lists(raw, &lists) {
            self.device.fatal_error(&format!("{} ExecuteCommandLists failed: {}", self.name, e));
            self.abandon(submitted, &reserved);
            return Err(DeviceError::CommandExecution(e.to_string()).into());
        }

        let decayed = batch.finish(self.kind);
        for value in &reserved {
            value.signal(Some(self));
        }

        debug!(
            queue = %self.name,
            lists = lists.len(),
            waits = waits.len(),
            decayed,
            made_resident = outcome.made_resident,
            evicted = outcome.evicted,
            "Executed command lists"
        );

        self.retire(submitted, reserved);
        Ok(values)
    }

    /// 没有执行的列表：在 CPU 上发出占用的值，保持时间线连续；资源的全局状态没有变化
    fn abandon(&self, submitted: Vec<CommandsData>, reserved: &[FenceValue]) {
        reserved.iter().for_each(|v| v.signal(None));
        self.retire(submitted, reserved.to_vec());
    }

    fn retire(&self, submitted: Vec<CommandsData>, reserved: Vec<FenceValue>) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else { return };

        self.pool.begin_flight(submitted.len());
        for (data, value) in submitted.into_iter().zip(reserved) {
            if let Err(e) = sender.send(Retired { value, data }) {
                drop(e.into_inner());
                self.pool.recycle_dropped();
            }
        }
    }

    /// 在 CPU 上等待队列中所有已提交的工作完成
    pub fn wait_for_idle(&self) -> Result<()> {
        let value = self.idle_fence.signal(Some(self));
        value.wait(None)?;
        self.pool.wait_idle();
        Ok(())
    }

    fn destroy_raw(&self) {
        if let Some(raw) = self.raw.lock().unwrap_or_else(PoisonError::into_inner).take() {
            self.device.backend().destroy_queue(raw);
        }
    }
}

impl DeviceChild for Queue {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn before_reset(&self) -> Option<Box<dyn Any + Send>> {
        self.pool.wait_idle();
        self.pool.clear();
        self.destroy_raw();
        None
    }

    fn reset(&self, _data: Option<Box<dyn Any + Send>>) -> bool {
        match self.device.backend().create_queue(self.kind) {
            Ok(raw) => {
                *self.raw.lock().unwrap_or_else(PoisonError::into_inner) = Some(raw);
                true
            }
            Err(e) => {
                warn!(queue = %self.name, error = %e, "Failed to recreate queue");
                false
            }
        }
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());
        if let Some(worker) = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take() {
            if worker.join().is_err() {
                warn!(queue = %self.name, "Command list recycler panicked");
            }
        }

        self.pool.clear();
        self.destroy_raw();
    }
}
