//! Lifecycle callback registry.
//!
//! Four append-only lists, one per lifecycle event. Lists are filled while
//! the instance is being constructed (registration needs `&mut`) and only
//! read afterwards. Callbacks run in registration order; a failing callback
//! does not stop the ones after it, and all failures are returned together.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use hive_proto::{CtlError, CtlResult, Rank};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Details handed to instance-exit callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceExit {
    pub index: u32,
    pub rank: Rank,
    pub error: Option<String>,
    pub pid: Option<u32>,
}

pub type OnAwaitFormatFn = Arc<dyn Fn(u32, PathBuf) -> BoxFuture<CtlResult<()>> + Send + Sync>;
pub type OnStorageReadyFn = Arc<dyn Fn() -> BoxFuture<CtlResult<()>> + Send + Sync>;
pub type OnReadyFn = Arc<dyn Fn() -> BoxFuture<CtlResult<()>> + Send + Sync>;
pub type OnInstanceExitFn = Arc<dyn Fn(InstanceExit) -> BoxFuture<CtlResult<()>> + Send + Sync>;

/// Wrap an async closure as an await-format callback.
pub fn await_format_fn<F, Fut>(f: F) -> OnAwaitFormatFn
where
    F: Fn(u32, PathBuf) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CtlResult<()>> + Send + 'static,
{
    Arc::new(move |idx, mount| Box::pin(f(idx, mount)))
}

/// Wrap an async closure as a storage-ready callback.
pub fn storage_ready_fn<F, Fut>(f: F) -> OnStorageReadyFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CtlResult<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// Wrap an async closure as a ready callback.
pub fn ready_fn<F, Fut>(f: F) -> OnReadyFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CtlResult<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// Wrap an async closure as an instance-exit callback.
pub fn instance_exit_fn<F, Fut>(f: F) -> OnInstanceExitFn
where
    F: Fn(InstanceExit) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CtlResult<()>> + Send + 'static,
{
    Arc::new(move |exit| Box::pin(f(exit)))
}

#[derive(Default, Clone)]
pub struct Callbacks {
    await_format: Vec<OnAwaitFormatFn>,
    storage_ready: Vec<OnStorageReadyFn>,
    ready: Vec<OnReadyFn>,
    instance_exit: Vec<OnInstanceExitFn>,
}

impl Callbacks {
    pub fn add_await_format(&mut self, fns: impl IntoIterator<Item = OnAwaitFormatFn>) {
        self.await_format.extend(fns);
    }

    pub fn add_storage_ready(&mut self, fns: impl IntoIterator<Item = OnStorageReadyFn>) {
        self.storage_ready.extend(fns);
    }

    pub fn add_ready(&mut self, fns: impl IntoIterator<Item = OnReadyFn>) {
        self.ready.extend(fns);
    }

    pub fn add_instance_exit(&mut self, fns: impl IntoIterator<Item = OnInstanceExitFn>) {
        self.instance_exit.extend(fns);
    }

    pub async fn run_await_format(&self, index: u32, scm_mount: PathBuf) -> CtlResult<()> {
        let mut results = Vec::with_capacity(self.await_format.len());
        for f in &self.await_format {
            results.push(f(index, scm_mount.clone()).await);
        }
        collect(results)
    }

    pub async fn run_storage_ready(&self) -> CtlResult<()> {
        let mut results = Vec::with_capacity(self.storage_ready.len());
        for f in &self.storage_ready {
            results.push(f().await);
        }
        collect(results)
    }

    pub async fn run_ready(&self) -> CtlResult<()> {
        let mut results = Vec::with_capacity(self.ready.len());
        for f in &self.ready {
            results.push(f().await);
        }
        collect(results)
    }

    pub async fn run_instance_exit(&self, exit: InstanceExit) -> CtlResult<()> {
        let mut results = Vec::with_capacity(self.instance_exit.len());
        for f in &self.instance_exit {
            results.push(f(exit.clone()).await);
        }
        collect(results)
    }
}

fn collect(results: Vec<CtlResult<()>>) -> CtlResult<()> {
    let errors: Vec<CtlError> = results.into_iter().filter_map(Result::err).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(CtlError::Callbacks(errors))
    }
}
