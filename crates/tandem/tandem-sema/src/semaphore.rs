use std::io;
use std::ptr::NonNull;
use std::time::{Duration, Instant};

use tandem_core::{AccessDescriptor, IpcError, ObjectName, Result, Role, Timeout};
use tracing::{debug, error, warn};

/// Result of a wait that did not fail outright.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The count was positive and has been decremented.
    Acquired,
    /// The deadline passed first.
    TimedOut,
    /// The peer that should have posted is gone. The count was not touched.
    Abandoned,
}

/// A named POSIX semaphore with a ceiling.
///
/// POSIX semaphores have no maximum, so the ceiling is checked with
/// `sem_getvalue` before posting. That check is exact as long as a single
/// process posts to the semaphore, which the channel protocol guarantees.
///
/// Dropping closes the local handle. A creator also unlinks the name; the
/// kernel object itself stays alive until every process has closed it.
#[derive(Debug)]
pub struct CountingSemaphore {
    name: ObjectName,
    sem: NonNull<libc::sem_t>,
    max_count: u32,
    role: Role,
}

// SAFETY: POSIX semaphores are designed for concurrent use from any thread
// (and any process); the handle is only closed in `drop`.
unsafe impl Send for CountingSemaphore {}
unsafe impl Sync for CountingSemaphore {}

impl CountingSemaphore {
    /// Creates (`Role::Creator`) or attaches to (`Role::Attacher`) the
    /// semaphore called `name`.
    ///
    /// A creator seeds the count with `initial_count`; an attacher ignores it.
    /// Both sides must agree on `max_count`.
    ///
    /// # Errors
    /// - `NameCollision` if a creator finds the name taken
    /// - `NotFound` if an attacher finds nothing to attach to
    pub fn open(
        name: ObjectName,
        initial_count: u32,
        max_count: u32,
        role: Role,
        access: &AccessDescriptor,
    ) -> Result<Self> {
        if initial_count > max_count {
            return Err(IpcError::Os {
                op: "sem_open",
                name: name.to_string(),
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "initial count exceeds the ceiling",
                ),
            });
        }

        let c_name = name.to_c_string().map_err(|source| IpcError::Os {
            op: "sem_open",
            name: name.to_string(),
            source,
        })?;

        // SAFETY: `c_name` is a valid NUL-terminated string; the variadic
        // arguments match what sem_open expects with O_CREAT.
        let raw = unsafe {
            match role {
                Role::Creator => libc::sem_open(
                    c_name.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL,
                    access.mode() as libc::c_uint,
                    initial_count as libc::c_uint,
                ),
                Role::Attacher => libc::sem_open(c_name.as_ptr(), 0),
            }
        };

        if raw == libc::SEM_FAILED {
            let err = IpcError::from_open("sem_open", name.as_str(), io::Error::last_os_error());
            match &err {
                IpcError::NameCollision { .. } => warn!(%name, "semaphore already exists"),
                IpcError::NotFound { .. } => debug!(%name, "semaphore not created yet"),
                other => error!(%name, error = %other, "sem_open failed"),
            }
            return Err(err);
        }

        let sem = NonNull::new(raw).ok_or_else(|| IpcError::Os {
            op: "sem_open",
            name: name.to_string(),
            source: io::Error::other("sem_open returned null"),
        })?;

        debug!(%name, %role, initial_count, max_count, "semaphore opened");

        Ok(Self {
            name,
            sem,
            max_count,
            role,
        })
    }

    #[inline]
    pub fn name(&self) -> &ObjectName {
        &self.name
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    /// Blocks until the count is positive (then decrements it) or `timeout`
    /// elapses.
    ///
    /// A plain wait has no way to observe the peer, so it never reports
    /// `Abandoned`; see [`wait_watched`](Self::wait_watched).
    pub fn wait(&self, timeout: Timeout) -> Result<WaitOutcome> {
        let deadline = timeout.deadline_from(Instant::now());
        if self.wait_until(deadline)? {
            Ok(WaitOutcome::Acquired)
        } else {
            Ok(WaitOutcome::TimedOut)
        }
    }

    /// Like [`wait`](Self::wait), but wakes every `interval` to ask
    /// `peer_alive` whether the process expected to post still exists.
    ///
    /// Returns `Abandoned` as soon as the probe says no, even for an infinite
    /// wait. A count that is already positive wins over a dead peer, so
    /// anything posted before the peer died is still delivered.
    pub fn wait_watched<F>(
        &self,
        timeout: Timeout,
        interval: Duration,
        mut peer_alive: F,
    ) -> Result<WaitOutcome>
    where
        F: FnMut() -> bool,
    {
        if interval.is_zero() {
            return self.wait(timeout);
        }

        let deadline = timeout.deadline_from(Instant::now());
        loop {
            let now = Instant::now();
            let slice_end = match now.checked_add(interval) {
                Some(end) => Some(deadline.map_or(end, |d| d.min(end))),
                None => deadline,
            };

            if self.wait_until(slice_end)? {
                return Ok(WaitOutcome::Acquired);
            }

            if !peer_alive() {
                warn!(name = %self.name, "peer vanished while waiting");
                return Ok(WaitOutcome::Abandoned);
            }

            if let Some(d) = deadline
                && Instant::now() >= d
            {
                return Ok(WaitOutcome::TimedOut);
            }
        }
    }

    /// Decrements the count if it is positive, without blocking.
    pub fn try_wait(&self) -> Result<bool> {
        loop {
            // SAFETY: `sem` is a live handle from sem_open.
            if unsafe { libc::sem_trywait(self.sem.as_ptr()) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(self.os_error("sem_trywait", err)),
            }
        }
    }

    /// Increments the count by `count`.
    ///
    /// # Errors
    /// `CountOverflow` if the result would pass the ceiling; the count is
    /// left unchanged in that case.
    pub fn post(&self, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }

        if let Some(current) = self.value()?
            && current.saturating_add(count) > self.max_count
        {
            warn!(name = %self.name, current, count, max = self.max_count, "post would pass ceiling");
            return Err(IpcError::CountOverflow {
                name: self.name.to_string(),
                count,
                max: self.max_count,
            });
        }

        for _ in 0..count {
            // SAFETY: `sem` is a live handle from sem_open.
            if unsafe { libc::sem_post(self.sem.as_ptr()) } != 0 {
                return Err(self.os_error("sem_post", io::Error::last_os_error()));
            }
        }
        Ok(())
    }

    /// Current count, or `None` where the platform cannot report it.
    pub fn value(&self) -> Result<Option<u32>> {
        let mut value: libc::c_int = 0;
        // SAFETY: `sem` is a live handle and `value` is a valid out pointer.
        if unsafe { libc::sem_getvalue(self.sem.as_ptr(), &mut value) } == 0 {
            // Linux reports 0 (never negative) while threads are blocked.
            return Ok(Some(value.max(0) as u32));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOSYS) => Ok(None),
            _ => Err(self.os_error("sem_getvalue", err)),
        }
    }

    /// Removes `name` from the namespace. Returns `false` if it did not exist.
    ///
    /// Processes that already hold a handle keep working.
    pub fn unlink(name: &ObjectName) -> Result<bool> {
        let c_name = name.to_c_string().map_err(|source| IpcError::Os {
            op: "sem_unlink",
            name: name.to_string(),
            source,
        })?;
        // SAFETY: `c_name` is a valid NUL-terminated string.
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } == 0 {
            debug!(%name, "semaphore unlinked");
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOENT) => Ok(false),
            _ => Err(IpcError::Os {
                op: "sem_unlink",
                name: name.to_string(),
                source: err,
            }),
        }
    }

    /// Returns `true` if the count was acquired before `deadline`.
    #[cfg(target_os = "linux")]
    fn wait_until(&self, deadline: Option<Instant>) -> Result<bool> {
        let Some(deadline) = deadline else {
            return self.wait_forever();
        };

        loop {
            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            let abs = realtime_after(remaining);

            // SAFETY: `sem` is a live handle and `abs` a valid timespec.
            if unsafe { libc::sem_timedwait(self.sem.as_ptr(), &abs) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                // The realtime clock may have jumped; the monotonic deadline rules.
                Some(libc::ETIMEDOUT) if Instant::now() >= deadline => return Ok(false),
                Some(libc::ETIMEDOUT) | Some(libc::EINTR) => continue,
                _ => return Err(self.os_error("sem_timedwait", err)),
            }
        }
    }

    /// Poll fallback for targets without `sem_timedwait` (macOS).
    #[cfg(not(target_os = "linux"))]
    fn wait_until(&self, deadline: Option<Instant>) -> Result<bool> {
        let Some(deadline) = deadline else {
            return self.wait_forever();
        };

        const POLL: Duration = Duration::from_micros(500);
        loop {
            if self.try_wait()? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep(POLL.min(deadline - now));
        }
    }

    fn wait_forever(&self) -> Result<bool> {
        loop {
            // SAFETY: `sem` is a live handle from sem_open.
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(self.os_error("sem_wait", err));
            }
        }
    }

    fn os_error(&self, op: &'static str, source: io::Error) -> IpcError {
        error!(name = %self.name, op, error = %source, "semaphore call failed");
        IpcError::Os {
            op,
            name: self.name.to_string(),
            source,
        }
    }
}

impl Drop for CountingSemaphore {
    fn drop(&mut self) {
        // SAFETY: `sem` came from sem_open and is closed exactly once.
        if unsafe { libc::sem_close(self.sem.as_ptr()) } != 0 {
            warn!(name = %self.name, error = %io::Error::last_os_error(), "sem_close failed");
        }
        if self.role.is_creator()
            && let Err(e) = Self::unlink(&self.name)
        {
            warn!(name = %self.name, error = %e, "failed to unlink semaphore");
        }
    }
}

/// Absolute `CLOCK_REALTIME` time `after` from now, as `sem_timedwait` wants.
#[cfg(target_os = "linux")]
fn realtime_after(after: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid out pointer; CLOCK_REALTIME always exists.
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
    }

    let mut sec = now.tv_sec.saturating_add(after.as_secs() as libc::time_t);
    let mut nsec = now.tv_nsec + after.subsec_nanos() as libc::c_long;
    if nsec >= 1_000_000_000 {
        sec = sec.saturating_add(1);
        nsec -= 1_000_000_000;
    }
    libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static NEXT: AtomicU32 = AtomicU32::new(0);

    fn unique_name() -> ObjectName {
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        ObjectName::build("/tdm-test-", &format!("s{}-{n}", std::process::id()))
    }

    fn create(name: &ObjectName, initial: u32, max: u32) -> CountingSemaphore {
        CountingSemaphore::open(
            name.clone(),
            initial,
            max,
            Role::Creator,
            AccessDescriptor::process_default(),
        )
        .expect("create semaphore")
    }

    fn attach(name: &ObjectName, max: u32) -> Result<CountingSemaphore> {
        CountingSemaphore::open(
            name.clone(),
            0,
            max,
            Role::Attacher,
            AccessDescriptor::process_default(),
        )
    }

    #[test]
    fn second_creator_collides() {
        let name = unique_name();
        let _first = create(&name, 1, 1);
        let second = CountingSemaphore::open(
            name.clone(),
            1,
            1,
            Role::Creator,
            AccessDescriptor::process_default(),
        );
        assert!(matches!(second, Err(IpcError::NameCollision { .. })));
    }

    #[test]
    fn attacher_without_creator_is_not_found() {
        let name = unique_name();
        assert!(matches!(attach(&name, 1), Err(IpcError::NotFound { .. })));
    }

    #[test]
    fn initial_count_above_ceiling_is_rejected() {
        let name = unique_name();
        let sem = CountingSemaphore::open(
            name,
            2,
            1,
            Role::Creator,
            AccessDescriptor::process_default(),
        );
        assert!(matches!(sem, Err(IpcError::Os { .. })));
    }

    #[test]
    fn wait_consumes_and_post_restores() {
        let name = unique_name();
        let creator = create(&name, 1, 1);
        let attacher = attach(&name, 1).expect("attach");

        assert_eq!(
            attacher.wait(Timeout::from_millis(100)).unwrap(),
            WaitOutcome::Acquired
        );
        assert_eq!(
            creator.wait(Timeout::from_millis(20)).unwrap(),
            WaitOutcome::TimedOut
        );

        attacher.post(1).unwrap();
        assert!(creator.try_wait().unwrap());
        assert!(!creator.try_wait().unwrap());
    }

    #[test]
    fn post_past_ceiling_fails_and_keeps_count() {
        let name = unique_name();
        let sem = create(&name, 1, 1);

        let err = sem.post(1).unwrap_err();
        assert!(matches!(err, IpcError::CountOverflow { max: 1, .. }));
        if let Some(v) = sem.value().unwrap() {
            assert_eq!(v, 1);
        }
    }

    #[test]
    fn post_many_up_to_ceiling() {
        let name = unique_name();
        let sem = create(&name, 0, 3);
        sem.post(3).unwrap();
        for _ in 0..3 {
            assert!(sem.try_wait().unwrap());
        }
        assert!(!sem.try_wait().unwrap());
    }

    #[test]
    fn bounded_wait_honours_timeout() {
        let name = unique_name();
        let sem = create(&name, 0, 1);
        let timeout = Duration::from_millis(50);

        let start = Instant::now();
        let outcome = sem.wait(timeout.into()).unwrap();
        let waited = start.elapsed();

        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(waited >= timeout, "returned early after {waited:?}");
        assert!(waited < timeout + Duration::from_secs(1));
    }

    #[test]
    fn watched_wait_reports_abandoned_peer() {
        let name = unique_name();
        let sem = create(&name, 0, 1);

        let start = Instant::now();
        let outcome = sem
            .wait_watched(Timeout::Infinite, Duration::from_millis(10), || false)
            .unwrap();

        assert_eq!(outcome, WaitOutcome::Abandoned);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn watched_wait_prefers_pending_count_over_dead_peer() {
        let name = unique_name();
        let sem = create(&name, 1, 1);
        let outcome = sem
            .wait_watched(Timeout::from_millis(50), Duration::from_millis(10), || false)
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Acquired);
    }

    #[test]
    fn watched_wait_times_out_with_live_peer() {
        let name = unique_name();
        let sem = create(&name, 0, 1);
        let outcome = sem
            .wait_watched(Timeout::from_millis(40), Duration::from_millis(10), || true)
            .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn creator_drop_unlinks_name() {
        let name = unique_name();
        drop(create(&name, 1, 1));
        assert!(matches!(attach(&name, 1), Err(IpcError::NotFound { .. })));
        assert!(!CountingSemaphore::unlink(&name).unwrap());
    }

    #[test]
    fn attacher_drop_keeps_name() {
        let name = unique_name();
        let _creator = create(&name, 1, 1);
        drop(attach(&name, 1).expect("attach"));
        assert!(attach(&name, 1).is_ok());
    }
}
