//! Units of background work.

use anyhow::Result;

/// A queued unit of work run against the executor's shared context `C`.
///
/// Errors and panics are logged by the executor and otherwise dropped; a job
/// that needs a retry has to submit one itself.
pub trait Job<C>: Send {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn run(self: Box<Self>, context: &C) -> Result<()>;
}

/// A closure-backed job. See [`job_fn`].
pub struct FnJob<F> {
    name: String,
    f: F,
}

/// Wrap `f` as a job called `name`.
pub fn job_fn<C, F>(name: impl Into<String>, f: F) -> FnJob<F>
where
    F: FnOnce(&C) -> Result<()> + Send,
{
    FnJob {
        name: name.into(),
        f,
    }
}

impl<C, F> Job<C> for FnJob<F>
where
    F: FnOnce(&C) -> Result<()> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(self: Box<Self>, context: &C) -> Result<()> {
        (self.f)(context)
    }
}
