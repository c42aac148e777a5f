pub type Tid = u16;

/// Identifies the thread on whose behalf the VM subsystem is running.
///
/// The scheduler owns thread bookkeeping; the VM only needs to know who is
/// asking. Any `fn() -> Tid` (such as the scheduler's `running_thread_tid`)
/// can be used directly.
pub trait ThreadContext: Send + Sync {
    fn running_thread_tid(&self) -> Tid;
}

impl<F> ThreadContext for F
where
    F: Fn() -> Tid + Send + Sync,
{
    fn running_thread_tid(&self) -> Tid {
        self()
    }
}
