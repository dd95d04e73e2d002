//! Task registry: the one table shared by every thread of the daemon.
//!
//! Job steps and tasks live in fixed-capacity slot arenas sized at daemon
//! start. Slots are addressed by generation-checked handles so a handle held
//! across a free can never alias a reused slot. Every read and write goes
//! through the single table mutex, held only for bookkeeping.

use crate::error::RegistryError;
use crate::lifecycle::check_transition;
use nagent_proto::TaskState;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error};

/// Table sizes, fixed for the lifetime of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLimits {
    pub max_steps: usize,
    pub max_tasks: usize,
    pub max_tasks_per_step: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    index: u32,
    generation: u32,
}

/// Identity of a task as requested by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSpec {
    /// Global rank within the step.
    pub task_id: u32,
    /// Ordinal among this node's tasks of the step.
    pub local_id: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Point-in-time copy of one task entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub handle: TaskHandle,
    pub job_id: u32,
    pub step_id: u32,
    pub task_id: u32,
    pub local_id: u32,
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<Pid>,
    pub state: TaskState,
    pub exit_code: i32,
    pub kill_sent: bool,
    /// Every state the task has been in, oldest first.
    pub history: Vec<TaskState>,
}

/// Point-in-time copy of one job step and its tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInfo {
    pub handle: StepHandle,
    pub job_id: u32,
    pub step_id: u32,
    pub capacity: usize,
    pub revoked: bool,
    pub tasks: Vec<TaskInfo>,
}

/// Result of signalling a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KillSummary {
    pub signalled: usize,
    /// Tasks already terminal, skipped without error.
    pub skipped: usize,
    pub failed: usize,
}

struct StepSlot {
    job_id: u32,
    step_id: u32,
    capacity: usize,
    revoked: bool,
    tasks: Vec<TaskHandle>,
}

struct TaskSlot {
    step: StepHandle,
    job_id: u32,
    step_id: u32,
    spec: TaskSpec,
    pid: Option<Pid>,
    state: TaskState,
    exit_code: i32,
    kill_sent: bool,
    history: Vec<TaskState>,
}

impl TaskSlot {
    fn info(&self, handle: TaskHandle) -> TaskInfo {
        TaskInfo {
            handle,
            job_id: self.job_id,
            step_id: self.step_id,
            task_id: self.spec.task_id,
            local_id: self.spec.local_id,
            uid: self.spec.uid,
            gid: self.spec.gid,
            pid: self.pid,
            state: self.state,
            exit_code: self.exit_code,
            kill_sent: self.kill_sent,
            history: self.history.clone(),
        }
    }

    fn set_state(&mut self, to: TaskState) -> Result<TaskState, RegistryError> {
        let from = self.state;
        check_transition(from, to)?;
        self.state = to;
        self.history.push(to);
        Ok(from)
    }
}

struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// Fixed-size arena with a free list of indices.
struct Slots<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
}

impl<T> Slots<T> {
    fn with_capacity(capacity: usize) -> Self {
        let entries = (0..capacity)
            .map(|_| Entry {
                generation: 0,
                value: None,
            })
            .collect();
        // Reversed so the lowest index is handed out first.
        let free = (0..capacity as u32).rev().collect();
        Self { entries, free }
    }

    fn insert(&mut self, value: T) -> Option<(u32, u32)> {
        let index = self.free.pop()?;
        let entry = &mut self.entries[index as usize];
        entry.generation = entry.generation.wrapping_add(1);
        entry.value = Some(value);
        Some((index, entry.generation))
    }

    fn get(&self, index: u32, generation: u32) -> Option<&T> {
        self.entries
            .get(index as usize)
            .filter(|e| e.generation == generation)
            .and_then(|e| e.value.as_ref())
    }

    fn get_mut(&mut self, index: u32, generation: u32) -> Option<&mut T> {
        self.entries
            .get_mut(index as usize)
            .filter(|e| e.generation == generation)
            .and_then(|e| e.value.as_mut())
    }

    fn remove(&mut self, index: u32, generation: u32) -> Option<T> {
        let entry = self
            .entries
            .get_mut(index as usize)
            .filter(|e| e.generation == generation)?;
        let value = entry.value.take()?;
        self.free.push(index);
        Some(value)
    }

    fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }
}

struct Table {
    limits: RegistryLimits,
    steps: Slots<StepSlot>,
    tasks: Slots<TaskSlot>,
    step_index: HashMap<(u32, u32), StepHandle>,
}

impl Table {
    fn step(&self, handle: StepHandle) -> Result<&StepSlot, RegistryError> {
        self.steps
            .get(handle.index, handle.generation)
            .ok_or(RegistryError::StaleHandle)
    }

    fn step_mut(&mut self, handle: StepHandle) -> Result<&mut StepSlot, RegistryError> {
        self.steps
            .get_mut(handle.index, handle.generation)
            .ok_or(RegistryError::StaleHandle)
    }

    fn task(&self, handle: TaskHandle) -> Result<&TaskSlot, RegistryError> {
        self.tasks
            .get(handle.index, handle.generation)
            .ok_or(RegistryError::StaleHandle)
    }

    fn task_mut(&mut self, handle: TaskHandle) -> Result<&mut TaskSlot, RegistryError> {
        self.tasks
            .get_mut(handle.index, handle.generation)
            .ok_or(RegistryError::StaleHandle)
    }

    fn lookup_step(&self, job_id: u32, step_id: u32) -> Result<StepHandle, RegistryError> {
        self.step_index
            .get(&(job_id, step_id))
            .copied()
            .ok_or(RegistryError::UnknownStep { job_id, step_id })
    }

    fn step_info(&self, handle: StepHandle) -> Result<StepInfo, RegistryError> {
        let step = self.step(handle)?;
        let tasks = step
            .tasks
            .iter()
            .filter_map(|t| self.task(*t).ok().map(|slot| slot.info(*t)))
            .collect();
        Ok(StepInfo {
            handle,
            job_id: step.job_id,
            step_id: step.step_id,
            capacity: step.capacity,
            revoked: step.revoked,
            tasks,
        })
    }

    fn free_step(&mut self, handle: StepHandle) {
        if let Some(step) = self.steps.remove(handle.index, handle.generation) {
            self.step_index.remove(&(step.job_id, step.step_id));
            debug!(job_id = step.job_id, step_id = step.step_id, "Job step slot freed");
        }
    }
}

/// Mutex-guarded table of job steps and tasks.
pub struct TaskRegistry {
    table: Mutex<Table>,
}

impl TaskRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            table: Mutex::new(Table {
                limits,
                steps: Slots::with_capacity(limits.max_steps),
                tasks: Slots::with_capacity(limits.max_tasks),
                step_index: HashMap::with_capacity(limits.max_steps),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        match self.table.lock() {
            Ok(guard) => guard,
            Err(_) => {
                // A thread died mid-update; the table cannot be trusted.
                error!("Task registry mutex poisoned, aborting");
                std::process::abort();
            }
        }
    }

    pub fn limits(&self) -> RegistryLimits {
        self.lock().limits
    }

    /// Claim a slot for a new job step.
    pub fn alloc_job_step(&self, job_id: u32, step_id: u32) -> Result<StepHandle, RegistryError> {
        let mut table = self.lock();
        if table.step_index.contains_key(&(job_id, step_id)) {
            return Err(RegistryError::StepExists { job_id, step_id });
        }
        let capacity = table.limits.max_tasks_per_step;
        let (index, generation) = table
            .steps
            .insert(StepSlot {
                job_id,
                step_id,
                capacity,
                revoked: false,
                tasks: Vec::new(),
            })
            .ok_or(RegistryError::CapacityExceeded("job step"))?;
        let handle = StepHandle { index, generation };
        table.step_index.insert((job_id, step_id), handle);
        debug!(job_id, step_id, slot = index, "Job step slot allocated");
        Ok(handle)
    }

    pub fn find_step(&self, job_id: u32, step_id: u32) -> Option<StepHandle> {
        self.lock().lookup_step(job_id, step_id).ok()
    }

    /// Claim a task slot in `step`. The task starts in `Requested`.
    pub fn alloc_task(
        &self,
        step: StepHandle,
        spec: TaskSpec,
    ) -> Result<TaskHandle, RegistryError> {
        let mut table = self.lock();
        let (job_id, step_id, capacity, count) = {
            let slot = table.step(step)?;
            (slot.job_id, slot.step_id, slot.capacity, slot.tasks.len())
        };
        if count >= capacity {
            return Err(RegistryError::CapacityExceeded("task"));
        }
        let duplicate = table.step(step)?.tasks.iter().any(|t| {
            table
                .task(*t)
                .is_ok_and(|slot| slot.spec.task_id == spec.task_id)
        });
        if duplicate {
            return Err(RegistryError::TaskExists {
                job_id,
                step_id,
                task_id: spec.task_id,
            });
        }

        let (index, generation) = table
            .tasks
            .insert(TaskSlot {
                step,
                job_id,
                step_id,
                spec,
                pid: None,
                state: TaskState::Requested,
                exit_code: 0,
                kill_sent: false,
                history: vec![TaskState::Requested],
            })
            .ok_or(RegistryError::CapacityExceeded("task"))?;
        let handle = TaskHandle { index, generation };
        table.step_mut(step)?.tasks.push(handle);
        Ok(handle)
    }

    /// Record a successful fork: pid plus `Requested -> Forked`.
    pub fn set_forked(&self, task: TaskHandle, pid: Pid) -> Result<(), RegistryError> {
        let mut table = self.lock();
        let slot = table.task_mut(task)?;
        slot.set_state(TaskState::Forked)?;
        slot.pid = Some(pid);
        Ok(())
    }

    /// Validated state change; returns the previous state.
    pub fn transition(&self, task: TaskHandle, to: TaskState) -> Result<TaskState, RegistryError> {
        self.lock().task_mut(task)?.set_state(to)
    }

    /// Move a task into a terminal state with its exit code.
    pub fn record_exit(
        &self,
        task: TaskHandle,
        to: TaskState,
        exit_code: i32,
    ) -> Result<TaskInfo, RegistryError> {
        let mut table = self.lock();
        let slot = table.task_mut(task)?;
        slot.set_state(to)?;
        slot.exit_code = exit_code;
        Ok(slot.info(task))
    }

    pub fn task_info(&self, task: TaskHandle) -> Option<TaskInfo> {
        let table = self.lock();
        table.task(task).ok().map(|slot| slot.info(task))
    }

    pub fn lookup_task(&self, job_id: u32, step_id: u32, task_id: u32) -> Option<TaskHandle> {
        let table = self.lock();
        let step = table.lookup_step(job_id, step_id).ok()?;
        table.step(step).ok()?.tasks.iter().copied().find(|t| {
            table
                .task(*t)
                .is_ok_and(|slot| slot.spec.task_id == task_id)
        })
    }

    /// Deliver `signal` through `deliver` to every live task of the step.
    ///
    /// Terminal tasks are skipped; the call never waits for reaping.
    pub fn signal_step<F>(
        &self,
        job_id: u32,
        step_id: u32,
        signal: Signal,
        mut deliver: F,
    ) -> Result<KillSummary, RegistryError>
    where
        F: FnMut(Pid, Signal) -> nix::Result<()>,
    {
        let mut table = self.lock();
        let step = table.lookup_step(job_id, step_id)?;
        let handles = table.step(step)?.tasks.clone();
        let mut summary = KillSummary::default();

        for handle in handles {
            let Ok(slot) = table.task_mut(handle) else {
                continue;
            };
            match (slot.state.is_live(), slot.pid) {
                (true, Some(pid)) => match deliver(pid, signal) {
                    Ok(()) => {
                        slot.kill_sent = true;
                        summary.signalled += 1;
                    }
                    // Already gone, the reaper will catch up.
                    Err(nix::errno::Errno::ESRCH) => summary.skipped += 1,
                    Err(e) => {
                        error!(job_id, step_id, task_id = slot.spec.task_id, %pid, error = %e, "Failed to signal task");
                        summary.failed += 1;
                    }
                },
                _ => summary.skipped += 1,
            }
        }
        Ok(summary)
    }

    /// Signal a single live task. Returns `false` when it is not live.
    pub fn signal_task<F>(
        &self,
        task: TaskHandle,
        signal: Signal,
        deliver: F,
    ) -> Result<bool, RegistryError>
    where
        F: FnOnce(Pid, Signal) -> nix::Result<()>,
    {
        let mut table = self.lock();
        let slot = table.task_mut(task)?;
        match (slot.state.is_live(), slot.pid) {
            (true, Some(pid)) => match deliver(pid, signal) {
                Ok(()) => {
                    slot.kill_sent = true;
                    Ok(true)
                }
                Err(_) => Ok(false),
            },
            _ => Ok(false),
        }
    }

    /// Release a task slot whose exit has been reported.
    ///
    /// A revoked step whose last task goes away is freed with it.
    pub fn free_task(&self, task: TaskHandle) -> Result<(), RegistryError> {
        let mut table = self.lock();
        let state = table.task(task)?.state;
        if !state.is_terminal() && state != TaskState::Requested {
            return Err(RegistryError::InvalidTransition {
                from: state,
                to: TaskState::Exited,
            });
        }
        let slot = table
            .tasks
            .remove(task.index, task.generation)
            .ok_or(RegistryError::StaleHandle)?;

        let step_handle = slot.step;
        let free_step = match table.step_mut(step_handle) {
            Ok(step) => {
                step.tasks.retain(|t| *t != task);
                step.revoked && step.tasks.is_empty()
            }
            Err(_) => false,
        };
        if free_step {
            table.free_step(step_handle);
        }
        Ok(())
    }

    /// Revoke a job step. Fails while any of its tasks is still live; the
    /// slot is freed once no task entries remain.
    pub fn release_job_step(&self, job_id: u32, step_id: u32) -> Result<bool, RegistryError> {
        let mut table = self.lock();
        let handle = table.lookup_step(job_id, step_id)?;
        let active = table
            .step(handle)?
            .tasks
            .iter()
            .filter(|t| table.task(**t).is_ok_and(|slot| !slot.state.is_terminal()))
            .count();
        if active > 0 {
            return Err(RegistryError::StepBusy {
                job_id,
                step_id,
                active,
            });
        }
        let step = table.step_mut(handle)?;
        step.revoked = true;
        if step.tasks.is_empty() {
            table.free_step(handle);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn step_snapshot(&self, job_id: u32, step_id: u32) -> Result<StepInfo, RegistryError> {
        let table = self.lock();
        let handle = table.lookup_step(job_id, step_id)?;
        table.step_info(handle)
    }

    pub fn snapshot(&self) -> Vec<StepInfo> {
        let table = self.lock();
        let mut steps: Vec<StepInfo> = table
            .step_index
            .values()
            .filter_map(|h| table.step_info(*h).ok())
            .collect();
        steps.sort_by_key(|s| (s.job_id, s.step_id));
        steps
    }

    pub fn step_count(&self) -> usize {
        self.lock().steps.len()
    }

    pub fn task_count(&self) -> usize {
        self.lock().tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn limits(max_steps: usize, max_tasks: usize, per_step: usize) -> RegistryLimits {
        RegistryLimits {
            max_steps,
            max_tasks,
            max_tasks_per_step: per_step,
        }
    }

    fn spec(task_id: u32) -> TaskSpec {
        TaskSpec {
            task_id,
            local_id: task_id,
            uid: 1000,
            gid: 1000,
        }
    }

    fn finish(registry: &TaskRegistry, task: TaskHandle, pid: i32) {
        registry.set_forked(task, Pid::from_raw(pid)).unwrap();
        registry.transition(task, TaskState::Execed).unwrap();
        registry.transition(task, TaskState::Running).unwrap();
        registry.record_exit(task, TaskState::Exited, 0).unwrap();
    }

    #[test]
    fn test_step_allocation_and_lookup() {
        let registry = TaskRegistry::new(limits(2, 4, 4));
        let step = registry.alloc_job_step(1000, 2000).unwrap();
        assert_eq!(registry.find_step(1000, 2000), Some(step));
        assert_eq!(registry.find_step(1000, 2001), None);
        assert_eq!(
            registry.alloc_job_step(1000, 2000),
            Err(RegistryError::StepExists {
                job_id: 1000,
                step_id: 2000
            })
        );
        assert_eq!(registry.step_count(), 1);
    }

    #[test]
    fn test_step_capacity_exceeded() {
        let registry = TaskRegistry::new(limits(2, 4, 4));
        registry.alloc_job_step(1, 0).unwrap();
        registry.alloc_job_step(2, 0).unwrap();
        assert_eq!(
            registry.alloc_job_step(3, 0),
            Err(RegistryError::CapacityExceeded("job step"))
        );
    }

    #[test]
    fn test_task_capacity_exceeded_keeps_existing_entries() {
        let registry = TaskRegistry::new(limits(2, 2, 8));
        let step = registry.alloc_job_step(1, 0).unwrap();
        let a = registry.alloc_task(step, spec(0)).unwrap();
        let b = registry.alloc_task(step, spec(1)).unwrap();
        assert_eq!(
            registry.alloc_task(step, spec(2)),
            Err(RegistryError::CapacityExceeded("task"))
        );
        assert_eq!(registry.task_info(a).unwrap().task_id, 0);
        assert_eq!(registry.task_info(b).unwrap().task_id, 1);
        assert_eq!(registry.lookup_task(1, 0, 1), Some(b));
    }

    #[test]
    fn test_per_step_capacity() {
        let registry = TaskRegistry::new(limits(2, 8, 1));
        let step = registry.alloc_job_step(1, 0).unwrap();
        registry.alloc_task(step, spec(0)).unwrap();
        assert_eq!(
            registry.alloc_task(step, spec(1)),
            Err(RegistryError::CapacityExceeded("task"))
        );
    }

    #[test]
    fn test_duplicate_task_id_rejected() {
        let registry = TaskRegistry::new(limits(1, 4, 4));
        let step = registry.alloc_job_step(1, 0).unwrap();
        registry.alloc_task(step, spec(3)).unwrap();
        assert!(matches!(
            registry.alloc_task(step, spec(3)),
            Err(RegistryError::TaskExists { task_id: 3, .. })
        ));
    }

    #[test]
    fn test_lifecycle_history_and_invalid_transition() {
        let registry = TaskRegistry::new(limits(1, 1, 1));
        let step = registry.alloc_job_step(1, 0).unwrap();
        let task = registry.alloc_task(step, spec(0)).unwrap();

        assert_eq!(
            registry.transition(task, TaskState::Running),
            Err(RegistryError::InvalidTransition {
                from: TaskState::Requested,
                to: TaskState::Running
            })
        );

        finish(&registry, task, 4242);
        let info = registry.task_info(task).unwrap();
        assert_eq!(info.pid, Some(Pid::from_raw(4242)));
        assert_eq!(
            info.history,
            vec![
                TaskState::Requested,
                TaskState::Forked,
                TaskState::Execed,
                TaskState::Running,
                TaskState::Exited
            ]
        );
    }

    #[test]
    fn test_stale_handle_after_free() {
        let registry = TaskRegistry::new(limits(1, 1, 1));
        let step = registry.alloc_job_step(1, 0).unwrap();
        let old = registry.alloc_task(step, spec(0)).unwrap();
        finish(&registry, old, 10);
        registry.free_task(old).unwrap();

        // Same slot index, new generation.
        let new = registry.alloc_task(step, spec(0)).unwrap();
        assert_ne!(old, new);
        assert!(registry.task_info(old).is_none());
        assert_eq!(
            registry.transition(old, TaskState::Forked),
            Err(RegistryError::StaleHandle)
        );
    }

    #[test]
    fn test_free_live_task_rejected() {
        let registry = TaskRegistry::new(limits(1, 1, 1));
        let step = registry.alloc_job_step(1, 0).unwrap();
        let task = registry.alloc_task(step, spec(0)).unwrap();
        registry.set_forked(task, Pid::from_raw(99)).unwrap();
        assert!(registry.free_task(task).is_err());
        assert_eq!(registry.task_count(), 1);
    }

    #[test]
    fn test_release_busy_then_free_after_report() {
        let registry = TaskRegistry::new(limits(1, 2, 2));
        let step = registry.alloc_job_step(7, 1).unwrap();
        let task = registry.alloc_task(step, spec(0)).unwrap();
        registry.set_forked(task, Pid::from_raw(50)).unwrap();

        assert!(matches!(
            registry.release_job_step(7, 1),
            Err(RegistryError::StepBusy { active: 1, .. })
        ));

        registry.transition(task, TaskState::Execed).unwrap();
        registry.transition(task, TaskState::Running).unwrap();
        registry.record_exit(task, TaskState::Exited, 0).unwrap();

        // Terminal but unreported: revoked, not yet freed.
        assert_eq!(registry.release_job_step(7, 1), Ok(false));
        assert_eq!(registry.step_count(), 1);

        registry.free_task(task).unwrap();
        assert_eq!(registry.step_count(), 0);
        assert_eq!(registry.find_step(7, 1), None);

        // Slot reusable.
        registry.alloc_job_step(7, 1).unwrap();
    }

    #[test]
    fn test_release_empty_step_frees_immediately() {
        let registry = TaskRegistry::new(limits(1, 1, 1));
        registry.alloc_job_step(1, 1).unwrap();
        assert_eq!(registry.release_job_step(1, 1), Ok(true));
        assert_eq!(
            registry.release_job_step(1, 1),
            Err(RegistryError::UnknownStep {
                job_id: 1,
                step_id: 1
            })
        );
    }

    #[test]
    fn test_signal_step_skips_terminal_tasks() {
        let registry = TaskRegistry::new(limits(1, 4, 4));
        let step = registry.alloc_job_step(1, 0).unwrap();
        let live = registry.alloc_task(step, spec(0)).unwrap();
        let done = registry.alloc_task(step, spec(1)).unwrap();
        registry.set_forked(live, Pid::from_raw(100)).unwrap();
        finish(&registry, done, 101);

        let mut delivered = Vec::new();
        let summary = registry
            .signal_step(1, 0, Signal::SIGTERM, |pid, sig| {
                delivered.push((pid, sig));
                Ok(())
            })
            .unwrap();
        assert_eq!(delivered, vec![(Pid::from_raw(100), Signal::SIGTERM)]);
        assert_eq!(
            summary,
            KillSummary {
                signalled: 1,
                skipped: 1,
                failed: 0
            }
        );
        assert!(registry.task_info(live).unwrap().kill_sent);
        assert!(!registry.task_info(done).unwrap().kill_sent);
    }

    #[test]
    fn test_concurrent_step_alloc_has_one_winner() {
        let registry = Arc::new(TaskRegistry::new(limits(8, 8, 8)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.alloc_job_step(1000, 2000).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.step_count(), 1);
    }

    #[test]
    fn test_concurrent_alloc_free_stress() {
        const THREADS: u32 = 8;
        const ROUNDS: u32 = 200;
        let registry = Arc::new(TaskRegistry::new(limits(THREADS as usize, 4, 4)));

        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let step = registry.alloc_job_step(t, 0).unwrap();
                    let mut rejected = 0;
                    for round in 0..ROUNDS {
                        match registry.alloc_task(step, spec(round)) {
                            Ok(task) => {
                                let info = registry.task_info(task).unwrap();
                                assert_eq!(info.job_id, t);
                                assert_eq!(info.task_id, round);
                                finish(&registry, task, (t * ROUNDS + round + 2) as i32);
                                registry.free_task(task).unwrap();
                            }
                            Err(RegistryError::CapacityExceeded(_)) => rejected += 1,
                            Err(e) => panic!("unexpected error {e}"),
                        }
                    }
                    rejected
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }
        // Every task slot returned, every step intact.
        assert_eq!(registry.task_count(), 0);
        assert_eq!(registry.step_count(), THREADS as usize);
        for t in 0..THREADS {
            assert!(registry.step_snapshot(t, 0).unwrap().tasks.is_empty());
        }
    }
}
