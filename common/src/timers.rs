use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap},
    hash::Hash,
};

/// Scheduled work owned by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    ConfigMode,
    SampleMode,
    Sample,
    CronTick,
    DeferredSubscribe,
    /// Sample mode started without a device identity.
    SessionRetry,
}

#[derive(Debug, Clone, Copy)]
struct Entry<T> {
    fire_at_ms: u64,
    seq: u64,
    task: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at_ms == other.fire_at_ms && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.fire_at_ms, self.seq).cmp(&(other.fire_at_ms, other.seq))
    }
}

/// Priority queue of `(fire_time, task)` drained by a single event loop.
///
/// A task is armed at most once: arming an armed task replaces the earlier
/// registration. Disarmed and replaced entries stay in the heap and are
/// skipped when they surface.
#[derive(Debug)]
pub struct TaskQueue<T> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    armed: HashMap<T, (u64, u64)>,
    next_seq: u64,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            armed: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<T: Copy + Eq + Hash> TaskQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, task: T, now_ms: u64, delay_ms: u64) {
        self.arm_at(task, now_ms.saturating_add(delay_ms));
    }

    pub fn arm_at(&mut self, task: T, fire_at_ms: u64) {
        self.disarm(task);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.armed.insert(task, (fire_at_ms, seq));
        self.heap.push(Reverse(Entry {
            fire_at_ms,
            seq,
            task,
        }));
    }

    pub fn disarm(&mut self, task: T) -> bool {
        self.armed.remove(&task).is_some()
    }

    pub fn is_armed(&self, task: T) -> bool {
        self.armed.contains_key(&task)
    }

    pub fn deadline_of(&self, task: T) -> Option<u64> {
        self.armed.get(&task).map(|(fire_at_ms, _)| *fire_at_ms)
    }

    pub fn armed_len(&self) -> usize {
        self.armed.len()
    }

    /// Next due task in fire order; ties keep arming order.
    pub fn pop_due(&mut self, now_ms: u64) -> Option<T> {
        loop {
            let Reverse(entry) = self.heap.peek()?;
            if entry.fire_at_ms > now_ms {
                return None;
            }
            let Reverse(entry) = self.heap.pop()?;
            if self.is_current(&entry) {
                self.armed.remove(&entry.task);
                return Some(entry.task);
            }
        }
    }

    pub fn next_deadline(&mut self) -> Option<u64> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.is_current(entry) {
                return Some(entry.fire_at_ms);
            }
            self.heap.pop();
        }
        None
    }

    fn is_current(&self, entry: &Entry<T>) -> bool {
        self.armed
            .get(&entry.task)
            .is_some_and(|(_, seq)| *seq == entry.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut queue = TaskQueue::new();
        queue.arm(Task::SampleMode, 0, 121_000);
        queue.arm(Task::ConfigMode, 0, 1_000);

        assert_eq!(queue.pop_due(999), None);
        assert_eq!(queue.pop_due(1_000), Some(Task::ConfigMode));
        assert_eq!(queue.pop_due(1_000), None);
        assert_eq!(queue.next_deadline(), Some(121_000));
        assert_eq!(queue.pop_due(200_000), Some(Task::SampleMode));
        assert_eq!(queue.next_deadline(), None);
    }

    #[test]
    fn rearming_replaces_previous_registration() {
        let mut queue = TaskQueue::new();
        queue.arm(Task::Sample, 0, 60_000);
        queue.arm(Task::Sample, 10_000, 60_000);

        assert_eq!(queue.armed_len(), 1);
        assert_eq!(queue.pop_due(60_000), None);
        assert_eq!(queue.pop_due(70_000), Some(Task::Sample));
        assert_eq!(queue.pop_due(u64::MAX), None);
    }

    #[test]
    fn disarmed_task_never_fires() {
        let mut queue = TaskQueue::new();
        queue.arm(Task::ConfigMode, 0, 100);
        assert!(queue.disarm(Task::ConfigMode));
        assert!(!queue.disarm(Task::ConfigMode));

        assert_eq!(queue.next_deadline(), None);
        assert_eq!(queue.pop_due(1_000), None);
    }

    #[test]
    fn equal_deadlines_fire_in_arming_order() {
        let mut queue = TaskQueue::new();
        queue.arm_at(Task::CronTick, 500);
        queue.arm_at(Task::Sample, 500);

        assert_eq!(queue.pop_due(500), Some(Task::CronTick));
        assert_eq!(queue.pop_due(500), Some(Task::Sample));
    }

    #[test]
    fn deadline_of_reports_current_registration() {
        let mut queue = TaskQueue::new();
        queue.arm(Task::DeferredSubscribe, 5, 60_000);
        assert_eq!(queue.deadline_of(Task::DeferredSubscribe), Some(60_005));
        assert!(queue.is_armed(Task::DeferredSubscribe));
        assert_eq!(queue.deadline_of(Task::Sample), None);
    }
}
