//! Signal-masked critical sections
//!
//! Translator state shared with signal handlers (the lookup cache, the
//! guest memory tracker) must never be observed mid-mutation from a
//! handler running on the same thread. These guards order construction
//! as (1) mask all signals, (2) take the lock, and destruction as
//! (1) drop the lock, (2) restore the saved mask, so a signal can never
//! arrive while the lock is held.

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Block every signal (the kernel keeps KILL/STOP unblockable).
pub const FULL_MASK: u64 = !0;

fn set_process_signal_mask(mask: u64) -> u64 {
    let mut original: u64 = 0;
    let ret = unsafe {
        libc::syscall(
            libc::SYS_rt_sigprocmask,
            libc::SIG_SETMASK,
            &mask as *const u64,
            &mut original as *mut u64,
            std::mem::size_of::<u64>(),
        )
    };
    debug_assert_eq!(ret, 0, "rt_sigprocmask rejected the mask");
    original
}

/// Read the calling thread's current signal mask.
pub fn current_signal_mask() -> u64 {
    let mut mask: u64 = 0;
    unsafe {
        libc::syscall(
            libc::SYS_rt_sigprocmask,
            libc::SIG_SETMASK,
            std::ptr::null::<u64>(),
            &mut mask as *mut u64,
            std::mem::size_of::<u64>(),
        );
    }
    mask
}

/// Masks signals, then locks a mutex, for the lifetime of the guard.
pub struct ScopedSignalMaskWithMutex<'a, T> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    original_mask: u64,
}

impl<'a, T> ScopedSignalMaskWithMutex<'a, T> {
    pub fn lock(mutex: &'a Mutex<T>) -> Self {
        Self::lock_with_mask(mutex, FULL_MASK)
    }

    pub fn lock_with_mask(mutex: &'a Mutex<T>, mask: u64) -> Self {
        let original_mask = set_process_signal_mask(mask);
        let guard = mutex.lock();
        ScopedSignalMaskWithMutex {
            guard: ManuallyDrop::new(guard),
            original_mask,
        }
    }
}

impl<T> Deref for ScopedSignalMaskWithMutex<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ScopedSignalMaskWithMutex<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for ScopedSignalMaskWithMutex<'_, T> {
    fn drop(&mut self) {
        // Unlock before unmasking; the inverse order would open a window
        // where a handler could contend on the held lock.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        set_process_signal_mask(self.original_mask);
    }
}

enum RwGuard<'a, T> {
    Read(RwLockReadGuard<'a, T>),
    Write(RwLockWriteGuard<'a, T>),
}

/// The shared-mutex variant: reader or writer mode is chosen at
/// construction, the mask discipline is identical.
pub struct ScopedSignalMaskWithRwLock<'a, T> {
    guard: ManuallyDrop<RwGuard<'a, T>>,
    original_mask: u64,
}

impl<'a, T> ScopedSignalMaskWithRwLock<'a, T> {
    pub fn read(lock: &'a RwLock<T>) -> Self {
        Self::with_mask(lock, true, FULL_MASK)
    }

    pub fn write(lock: &'a RwLock<T>) -> Self {
        Self::with_mask(lock, false, FULL_MASK)
    }

    pub fn with_mask(lock: &'a RwLock<T>, shared: bool, mask: u64) -> Self {
        let original_mask = set_process_signal_mask(mask);
        let guard = if shared {
            RwGuard::Read(lock.read())
        } else {
            RwGuard::Write(lock.write())
        };
        ScopedSignalMaskWithRwLock {
            guard: ManuallyDrop::new(guard),
            original_mask,
        }
    }

    pub fn is_writer(&self) -> bool {
        matches!(*self.guard, RwGuard::Write(_))
    }
}

impl<T> Deref for ScopedSignalMaskWithRwLock<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &*self.guard {
            RwGuard::Read(guard) => guard,
            RwGuard::Write(guard) => guard,
        }
    }
}

impl<T> DerefMut for ScopedSignalMaskWithRwLock<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut *self.guard {
            RwGuard::Read(_) => panic!("write access through a reader guard"),
            RwGuard::Write(guard) => guard,
        }
    }
}

impl<T> Drop for ScopedSignalMaskWithRwLock<'_, T> {
    fn drop(&mut self) {
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        set_process_signal_mask(self.original_mask);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usr1_bit() -> u64 {
        1u64 << (libc::SIGUSR1 as u64 - 1)
    }

    #[test]
    fn test_mask_applied_and_restored() {
        let mutex = Mutex::new(42);
        let before = current_signal_mask();
        {
            let section = ScopedSignalMaskWithMutex::lock(&mutex);
            assert_eq!(*section, 42);
            let inside = current_signal_mask();
            assert_ne!(inside & usr1_bit(), 0, "SIGUSR1 should be blocked");
            assert!(mutex.try_lock().is_none(), "mutex should be held");
        }
        assert_eq!(current_signal_mask(), before);
        assert!(mutex.try_lock().is_some(), "mutex should be released");
    }

    #[test]
    fn test_mutation_through_guard() {
        let mutex = Mutex::new(Vec::<u32>::new());
        {
            let mut section = ScopedSignalMaskWithMutex::lock(&mutex);
            section.push(7);
        }
        assert_eq!(*mutex.lock(), vec![7]);
    }

    #[test]
    fn test_rwlock_reader_allows_other_readers() {
        let lock = RwLock::new(1);
        let section = ScopedSignalMaskWithRwLock::read(&lock);
        assert!(!section.is_writer());
        assert_eq!(*section, 1);
        assert!(lock.try_read().is_some(), "shared mode admits more readers");
        assert!(lock.try_write().is_none());
    }

    #[test]
    fn test_rwlock_writer_is_exclusive() {
        let lock = RwLock::new(5);
        let before = current_signal_mask();
        {
            let mut section = ScopedSignalMaskWithRwLock::write(&lock);
            assert!(section.is_writer());
            *section = 9;
            assert!(lock.try_read().is_none());
        }
        assert_eq!(*lock.read(), 9);
        assert_eq!(current_signal_mask(), before);
    }

    #[test]
    fn test_custom_mask_round_trip() {
        let mutex = Mutex::new(());
        let before = current_signal_mask();
        {
            let _section = ScopedSignalMaskWithMutex::lock_with_mask(&mutex, usr1_bit());
            let inside = current_signal_mask();
            assert_eq!(inside & usr1_bit(), usr1_bit());
        }
        assert_eq!(current_signal_mask(), before);
    }
}
