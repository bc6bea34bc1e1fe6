#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bastion_core::StateError;
use bastion_resources::{ResourceRegistry, TypedResource, TypedSpec};
use bastion_runtime::{Controller, Runtime, RuntimeOptions};
use bastion_store::{safe, State};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const USER: &str = "user";
const WAIT: Duration = Duration::from_secs(10);

pub fn state() -> Arc<State> { Arc::new(State::new(ResourceRegistry::with_all())) }

/// Creates or replaces a user-owned resource.
pub fn put<T: TypedSpec>(st: &State, id: &str, spec: T) {
    safe::modify::<T, _, _, StateError>(&st.as_owner(USER), id, |s| {
        *s = spec.clone();
        Ok(())
    })
    .unwrap();
}

pub struct Running {
    pub ctx: CancellationToken,
    task: JoinHandle<()>,
}

impl Running {
    pub async fn stop(self) {
        self.ctx.cancel();
        tokio::time::timeout(WAIT, self.task).await.unwrap().unwrap();
    }
}

pub fn start(st: &Arc<State>, controllers: Vec<Box<dyn Controller>>) -> Running {
    let opts = RuntimeOptions { backoff_initial: Duration::from_millis(10), backoff_max: Duration::from_millis(100) };
    let mut rt = Runtime::with_options(Arc::clone(st), opts);
    for c in controllers {
        rt.register_boxed(c).unwrap();
    }
    let ctx = CancellationToken::new();
    let task = tokio::spawn(rt.run(ctx.clone()));
    Running { ctx, task }
}

/// Polls until resource `id` exists and satisfies `pred`.
pub async fn wait_for<T, F>(st: &State, id: &str, pred: F) -> TypedResource<T>
where
    T: TypedSpec,
    F: Fn(&T) -> bool,
{
    let res = tokio::time::timeout(WAIT, async {
        loop {
            if let Some(r) = safe::get_opt::<T, _>(st, id).unwrap() {
                if pred(&r.spec) {
                    return r;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    match res {
        Ok(r) => r,
        Err(_) => panic!("timed out waiting for {}/{id}; last: {:?}", T::NAME, safe::get_opt::<T, _>(st, id).unwrap().map(|r| r.metadata)),
    }
}

pub async fn wait_gone<T: TypedSpec>(st: &State, id: &str) {
    tokio::time::timeout(WAIT, async {
        while safe::get_opt::<T, _>(st, id).unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{}/{id} still present", T::NAME));
}
