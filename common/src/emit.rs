//! Event emitters
//!
//! Bounded FIFO channels carrying completed events to user space. A push
//! into a full emitter fails and the event is lost; handlers count the loss
//! and move on.

/// Why an event push was rejected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmitError {
    Full,
}

/// Destination for completed events
pub trait EventSink<T> {
    fn push(&mut self, event: &T) -> Result<(), EmitError>;
}

impl<T, Q: EventSink<T> + ?Sized> EventSink<T> for &mut Q {
    #[inline(always)]
    fn push(&mut self, event: &T) -> Result<(), EmitError> {
        (**self).push(event)
    }
}

/// Ring buffer over caller-provided storage
#[derive(Clone, Debug)]
pub struct BoundedQueue<T, S> {
    slots: S,
    head: usize,
    len: usize,
    _marker: core::marker::PhantomData<T>,
}

impl<T, S> BoundedQueue<T, S>
where
    T: Copy,
    S: AsRef<[Option<T>]> + AsMut<[Option<T>]>,
{
    pub fn new(mut slots: S) -> Self {
        for slot in slots.as_mut().iter_mut() {
            *slot = None;
        }
        Self {
            slots,
            head: 0,
            len: 0,
            _marker: core::marker::PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.as_ref().len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remove the oldest event
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let cap = self.capacity();
        let event = self.slots.as_mut()[self.head].take();
        self.head = (self.head + 1) % cap;
        self.len -= 1;
        event
    }
}

impl<T, S> EventSink<T> for BoundedQueue<T, S>
where
    T: Copy,
    S: AsRef<[Option<T>]> + AsMut<[Option<T>]>,
{
    fn push(&mut self, event: &T) -> Result<(), EmitError> {
        let cap = self.capacity();
        if self.len == cap {
            return Err(EmitError::Full);
        }
        let tail = (self.head + self.len) % cap;
        self.slots.as_mut()[tail] = Some(*event);
        self.len += 1;
        Ok(())
    }
}

impl<T: Copy, const N: usize> BoundedQueue<T, [Option<T>; N]> {
    pub fn inline() -> Self {
        Self::new([None; N])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut q: BoundedQueue<u32, [Option<u32>; 4]> = BoundedQueue::inline();
        q.push(&1).unwrap();
        q.push(&2).unwrap();
        assert_eq!(q.pop(), Some(1));
        q.push(&3).unwrap();
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_full_queue_drops_new_events() {
        let mut q: BoundedQueue<u32, [Option<u32>; 2]> = BoundedQueue::inline();
        q.push(&1).unwrap();
        q.push(&2).unwrap();
        assert_eq!(q.push(&3), Err(EmitError::Full));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
    }

    #[test]
    fn test_wraps_around() {
        let mut q: BoundedQueue<u32, [Option<u32>; 3]> = BoundedQueue::inline();
        for round in 0..5u32 {
            q.push(&round).unwrap();
            q.push(&(round + 100)).unwrap();
            assert_eq!(q.pop(), Some(round));
            assert_eq!(q.pop(), Some(round + 100));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_always_full() {
        let mut q: BoundedQueue<u32, [Option<u32>; 0]> = BoundedQueue::inline();
        assert_eq!(q.push(&1), Err(EmitError::Full));
        assert_eq!(q.pop(), None);
    }
}
