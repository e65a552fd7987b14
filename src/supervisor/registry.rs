use crate::error::{Result, SupervisorError};

const INITIAL_CAPACITY: usize = 16;

/// Items that remember their own slot in a `TaskRegistry`.
pub trait Indexed {
    fn index(&self) -> usize;
    fn set_index(&mut self, index: usize);
}

/// Ordered, compacting list of tasks.
///
/// Every entry's recorded index equals its position. Capacity doubles when
/// full and is never given back.
#[derive(Debug)]
pub struct TaskRegistry<T> {
    slots: Vec<T>,
}

impl<T: Indexed> TaskRegistry<T> {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }

    /// Index of the first task at or after `start` accepted by `pred`.
    pub fn find_from<P>(&self, start: usize, mut pred: P) -> Option<usize>
    where
        P: FnMut(&T) -> bool,
    {
        self.slots
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, task)| pred(task))
            .map(|(i, _)| i)
    }

    /// Append a task and record its slot.
    pub fn add(&mut self, mut task: T) -> Result<usize> {
        if self.slots.len() == self.slots.capacity() {
            let target = match self.slots.capacity() {
                0 => INITIAL_CAPACITY,
                n => n * 2,
            };
            self.slots.try_reserve_exact(target - self.slots.len())?;
        }

        let index = self.slots.len();
        task.set_index(index);
        self.slots.push(task);
        Ok(index)
    }

    /// Take the task at `index` out, shifting later tasks down one slot.
    ///
    /// Fails with `Inconsistent` if the slot is empty or its task records a
    /// different index.
    pub fn remove(&mut self, index: usize) -> Result<T> {
        match self.slots.get(index) {
            Some(task) if task.index() == index => {}
            _ => return Err(SupervisorError::Inconsistent { index }),
        }

        let task = self.slots.remove(index);
        for (i, task) in self.slots.iter_mut().enumerate().skip(index) {
            task.set_index(i);
        }
        Ok(task)
    }
}

impl<T: Indexed> Default for TaskRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
