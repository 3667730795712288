//! Pre/post hook pipeline.
//!
//! Hooks run sequentially; the first error short-circuits the rest and
//! becomes a hard failure of the whole apply/delete call. A panicking hook is
//! caught here and turned into `ReconcileError::Callback`; panics never reach
//! the operator or manager.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use keel_core::{Resource, Status};

use crate::ReconcileError;

/// What a hook is looking at.
#[derive(Debug, Clone, Copy)]
pub enum Hook<'a> {
    /// Before the store is touched.
    Pre(&'a Resource),
    /// After the store answered.
    Post(&'a Status),
}

impl<'a> Hook<'a> {
    pub fn resource(&self) -> &'a Resource {
        match *self {
            Hook::Pre(r) => r,
            Hook::Post(s) => &s.resource,
        }
    }

    pub fn status(&self) -> Option<&'a Status> {
        match *self {
            Hook::Pre(_) => None,
            Hook::Post(s) => Some(s),
        }
    }
}

pub type Callback = Arc<dyn Fn(Hook<'_>, Option<&ReconcileError>) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Callbacks {
    pub pre: Vec<Callback>,
    pub post: Vec<Callback>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks").field("pre", &self.pre.len()).field("post", &self.post.len()).finish()
    }
}

impl Callbacks {
    pub fn pre<F>(mut self, f: F) -> Self
    where
        F: Fn(Hook<'_>, Option<&ReconcileError>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.pre.push(Arc::new(f));
        self
    }

    pub fn post<F>(mut self, f: F) -> Self
    where
        F: Fn(Hook<'_>, Option<&ReconcileError>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.post.push(Arc::new(f));
        self
    }

    /// `self` first, then `other`.
    pub fn merged(&self, other: &Callbacks) -> Callbacks {
        Callbacks {
            pre: self.pre.iter().chain(other.pre.iter()).cloned().collect(),
            post: self.post.iter().chain(other.post.iter()).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool { self.pre.is_empty() && self.post.is_empty() }

    pub(crate) fn run_pre(&self, res: &Resource) -> Result<(), ReconcileError> {
        run(&self.pre, Hook::Pre(res), None)
    }

    pub(crate) fn run_post(&self, status: &Status, err: Option<&ReconcileError>) -> Result<(), ReconcileError> {
        run(&self.post, Hook::Post(status), err)
    }
}

/// Run `callbacks` in order; stop at the first error.
pub fn run(callbacks: &[Callback], hook: Hook<'_>, err: Option<&ReconcileError>) -> Result<(), ReconcileError> {
    callbacks.iter().try_for_each(|cb| invoke(cb, hook, err))
}

fn invoke(cb: &Callback, hook: Hook<'_>, err: Option<&ReconcileError>) -> Result<(), ReconcileError> {
    match panic::catch_unwind(AssertUnwindSafe(|| cb(hook, err))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ReconcileError::Callback(format!("{:#}", e))),
        Err(payload) => Err(ReconcileError::Callback(format!("callback panicked: {}", panic_message(&*payload)))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
