//! Runtime contracts consumed by the server.
//!
//! squall does not ship an event loop. It drives all of its I/O through the
//! [`Reactor`] trait and the byte-stream contract in [`io`], and any
//! single-threaded reactor that can dispatch readable-socket callbacks and
//! one-shot timers can host it.
//!
//! Reactors are shared as [`Handle`]s (`Rc<dyn Reactor>`). A thread-default
//! handle can be installed with [`set_default`] (or built lazily through
//! [`set_default_factory`]) so servers constructed without an explicit
//! reactor resolve one at start-up, and each forked worker process can
//! install its own.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Instant;

pub mod io;

/// A one-shot callback scheduled on the reactor.
pub type Callback = Box<dyn FnOnce()>;

/// Cancellation token for a timeout scheduled with [`Reactor::add_timeout`].
///
/// The value is assigned by the reactor and is only meaningful to the
/// reactor that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timeout(pub u64);

/// The single-threaded scheduler dispatching I/O readiness and timers.
///
/// All callbacks run serialized on the thread that owns the reactor; the
/// trait is deliberately not `Send`, which is what makes the lock-free
/// connection state machine sound.
pub trait Reactor {
    /// The reactor's current time.
    ///
    /// Connections derive timeout deadlines from this clock rather than
    /// calling `Instant::now` so a test reactor can control time.
    fn now(&self) -> Instant;

    /// Schedules `callback` to run at `deadline`, returning a token that
    /// can cancel it.
    fn add_timeout(&self, deadline: Instant, callback: Callback) -> Timeout;

    /// Cancels a previously scheduled timeout. Cancelling a timeout that
    /// already fired is a no-op.
    fn remove_timeout(&self, timeout: &Timeout);

    /// Registers `callback` to run whenever `fd` becomes readable.
    fn add_handler(&self, fd: RawFd, callback: Box<dyn FnMut()>);

    /// Unregisters the readable handler for `fd`, dropping its callback.
    fn remove_handler(&self, fd: RawFd);
}

/// A shared reactor reference.
pub type Handle = Rc<dyn Reactor>;

struct Registry {
    handle: Option<Handle>,
    factory: Option<Box<dyn Fn() -> Handle>>,
}

thread_local! {
    static DEFAULT: RefCell<Registry> = RefCell::new(Registry {
        handle: None,
        factory: None,
    });
}

/// Installs `handle` as this thread's default reactor.
pub fn set_default(handle: Handle) {
    DEFAULT.with(|slot| slot.borrow_mut().handle = Some(handle));
}

/// Registers a constructor used to build the default reactor lazily.
///
/// The factory runs at most once per thread, the first time [`default`] is
/// called with no handle installed. Multi-process servers rely on this:
/// the factory is registered before `start`, and each forked child builds
/// its own reactor on first use.
pub fn set_default_factory<F>(factory: F)
where
    F: Fn() -> Handle + 'static,
{
    DEFAULT.with(|slot| slot.borrow_mut().factory = Some(Box::new(factory)));
}

/// Drops this thread's default reactor handle, if any.
///
/// The registered factory, if any, is kept; the next [`default`] call
/// builds a fresh reactor.
pub fn clear_default() {
    DEFAULT.with(|slot| slot.borrow_mut().handle = None);
}

/// Returns this thread's default reactor.
///
/// # Panics
///
/// Panics if no handle was installed with [`set_default`] and no factory
/// was registered with [`set_default_factory`].
pub fn default() -> Handle {
    DEFAULT.with(|slot| {
        let mut registry = slot.borrow_mut();
        if let Some(ref handle) = registry.handle {
            return handle.clone();
        }
        let handle = match registry.factory {
            Some(ref factory) => factory(),
            None => panic!(
                "no default reactor: install one with squall::rt::set_default \
                 or register a factory with squall::rt::set_default_factory"
            ),
        };
        registry.handle = Some(handle.clone());
        handle
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockReactor;

    #[test]
    fn default_returns_installed_handle() {
        let reactor = MockReactor::new();
        let installed: Handle = reactor.clone();
        set_default(installed.clone());
        let handle = default();
        assert!(Rc::ptr_eq(&handle, &installed));
        clear_default();
    }

    #[test]
    fn factory_builds_lazily_once() {
        clear_default();
        set_default_factory(|| {
            let reactor: Handle = MockReactor::new();
            reactor
        });
        let first = default();
        let second = default();
        assert!(Rc::ptr_eq(&first, &second));
        clear_default();
    }
}
