use std::collections::{BTreeMap, VecDeque};

use log::{debug, info, warn};

use crate::constants::MAX_QUEUE_SIZE;
use crate::error::{Error, Result};
use crate::io::{Instruction, Workload};
use crate::vm_manager::{Pid, VmManager};

/// Bounded FIFO of runnable processes
#[derive(Debug)]
pub struct ReadyQueue {
    slots: VecDeque<Pid>,
    capacity: usize,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::with_capacity(MAX_QUEUE_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ReadyQueue {
            slots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn enqueue(&mut self, pid: Pid) -> Result<()> {
        if self.is_full() {
            return Err(Error::QueueFull);
        }
        self.slots.push_back(pid);
        Ok(())
    }

    pub fn dequeue(&mut self) -> Option<Pid> {
        self.slots.pop_front()
    }

    #[inline]
    pub fn empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a dispatcher run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub executed: u64,
    pub failed: u64,
    pub finished: u64,
}

struct Task {
    workload: Workload,
    pc: usize,
}

impl Task {
    fn done(&self) -> bool {
        self.pc >= self.workload.len()
    }
}

/// Round-robin executor of workloads against a `VmManager`
pub struct Dispatcher {
    queue: ReadyQueue,
    /// spawned processes waiting for a queue slot
    pending: VecDeque<Pid>,
    tasks: BTreeMap<Pid, Task>,
    time_slice: usize,
}

impl Dispatcher {
    pub fn new(time_slice: usize) -> Self {
        Self::with_queue(ReadyQueue::new(), time_slice)
    }

    pub fn with_queue(queue: ReadyQueue, time_slice: usize) -> Self {
        Dispatcher {
            queue,
            pending: VecDeque::new(),
            tasks: BTreeMap::new(),
            // a zero slice would never make progress
            time_slice: time_slice.max(1),
        }
    }

    /// Register a spawned process and its workload
    pub fn admit(&mut self, pid: Pid, workload: Workload) {
        self.tasks.insert(pid, Task { workload, pc: 0 });
        self.pending.push_back(pid);
    }

    fn fill_queue(&mut self) -> Result<()> {
        while !self.queue.is_full() {
            let Some(pid) = self.pending.pop_front() else {
                break;
            };
            self.queue.enqueue(pid)?;
            debug!("pid {}: admitted to ready queue", pid);
        }
        Ok(())
    }

    /// Run every admitted workload to completion. Each finished process is
    /// terminated so its frames return to the devices.
    pub fn run(&mut self, vm: &mut VmManager) -> Result<RunReport> {
        let mut report = RunReport::default();
        loop {
            self.fill_queue()?;
            let Some(pid) = self.queue.dequeue() else {
                break;
            };
            let Some(task) = self.tasks.get_mut(&pid) else {
                continue;
            };

            for _ in 0..self.time_slice {
                let Some(&inst) = task.workload.code.get(task.pc) else {
                    break;
                };
                task.pc += 1;
                report.executed += 1;
                if let Err(err) = execute(vm, pid, inst) {
                    report.failed += 1;
                    warn!("pid {}: `{}` failed: {}", pid, inst, err);
                }
            }

            if task.done() {
                self.tasks.remove(&pid);
                if let Err(err) = vm.terminate(pid) {
                    warn!("pid {}: terminate failed: {}", pid, err);
                }
                report.finished += 1;
                info!("pid {}: finished", pid);
            } else {
                self.queue.enqueue(pid)?;
            }
        }
        Ok(report)
    }
}

fn execute(vm: &mut VmManager, pid: Pid, inst: Instruction) -> Result<()> {
    match inst {
        Instruction::Alloc { size, region } => {
            let addr = vm.allocate(pid, size, region)?;
            debug!("pid {}: alloc {} bytes for region {} at {:#x}", pid, size, region, addr);
        }
        Instruction::Free { region } => vm.free(pid, region)?,
        Instruction::Read { region, offset } => {
            let value = vm.read(pid, region, offset)?;
            debug!("pid {}: read region={} offset={} value={}", pid, region, offset, value);
        }
        Instruction::Write {
            value,
            region,
            offset,
        } => vm.write(pid, region, offset, value)?,
        Instruction::Calc => {}
    }
    Ok(())
}
