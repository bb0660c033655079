use std::future::Future;
use std::time::Duration;

/// Spawns a background task on the browser event loop.
#[cfg(target_arch = "wasm32")]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}

/// Spawns a background task on the ambient tokio runtime. Outside of one, the task runs on a
/// current-thread runtime driven by a dedicated `storefront-background` thread.
#[cfg(not(target_arch = "wasm32"))]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    use std::sync::LazyLock;
    use tokio::runtime::{Builder, Handle};

    use crate::logger::Logger;

    static RUNTIME_LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@storefront/runtime"));
    static BACKGROUND_RUNTIME: LazyLock<Option<Handle>> = LazyLock::new(|| {
        let runtime = match Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(err) => {
                RUNTIME_LOGGER.error(format!("failed to build background runtime: {err}"));
                return None;
            }
        };
        let handle = runtime.handle().clone();
        let driver = std::thread::Builder::new()
            .name("storefront-background".to_owned())
            .spawn(move || runtime.block_on(std::future::pending::<()>()));
        match driver {
            Ok(_) => Some(handle),
            Err(err) => {
                RUNTIME_LOGGER.error(format!("failed to start background runtime thread: {err}"));
                None
            }
        }
    });

    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else if let Some(handle) = BACKGROUND_RUNTIME.as_ref() {
        handle.spawn(future);
    } else {
        RUNTIME_LOGGER.warn("dropping background task: no runtime available");
    }
}

/// Waits for `duration` using the platform timer. Zero durations still yield once so
/// retry loops never starve the executor.
pub async fn sleep(duration: Duration) {
    sleep_impl(duration).await;
}

#[cfg(target_arch = "wasm32")]
async fn sleep_impl(duration: Duration) {
    gloo_timers::future::sleep(duration).await;
}

#[cfg(not(target_arch = "wasm32"))]
async fn sleep_impl(duration: Duration) {
    if duration.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn detached_tasks_run_without_an_ambient_runtime() {
        let (sender, receiver) = mpsc::channel();
        spawn_detached(async move {
            sleep(Duration::from_millis(5)).await;
            let _ = sender.send(std::thread::current().name().map(str::to_owned));
        });

        let thread = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(thread.as_deref(), Some("storefront-background"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn detached_tasks_prefer_the_ambient_runtime() {
        let (sender, receiver) = tokio::sync::oneshot::channel();
        spawn_detached(async move {
            let _ = sender.send(());
        });
        receiver.await.unwrap();
    }
}
