use log::info;
use simple_error::bail;
use std::io;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread::Builder;
use std::thread::JoinHandle;

use crate::result::Result;
use crate::shutdown::Shutdown;

/// The worker loops are shallow; keep their stacks small.
pub const DEFAULT_THREAD_STACKSIZE: usize = 128 * 1024;

/// T: return value from the thread in the successful case
/// C: resources shared with the thread that are returned to the caller of join
pub struct InterruptableThread<T, C>
where
    T: Send + 'static,
    C: Send + 'static,
{
    handle: JoinHandle<(Result<T>, C)>,
    shutdown: Arc<Shutdown>,
}

impl<T, C> InterruptableThread<T, C>
where
    T: Send + 'static,
    C: Send + 'static,
{
    /// Spawn a named worker. The function receives the shared shutdown flag
    /// and should stop its work once the flag is set; when it fails, a unit
    /// is sent on `err_sender` so the orchestrator can stop the others.
    pub fn spawn<F>(
        name: &str,
        shutdown: Arc<Shutdown>,
        err_sender: SyncSender<()>,
        func: F,
        ctx: C,
    ) -> io::Result<Self>
    where
        F: FnOnce(&C, &Shutdown) -> Result<T>,
        F: Send + 'static,
    {
        let builder = Builder::new()
            .name(String::from(name))
            .stack_size(DEFAULT_THREAD_STACKSIZE);
        let thread_shutdown = Arc::clone(&shutdown);

        let handle = builder.spawn(move || {
            let res = func(&ctx, &thread_shutdown);
            if res.is_err() {
                err_sender
                    .send(())
                    .expect("could not send result back, parent died");
            }
            (res, ctx)
        })?;

        Ok(Self { handle, shutdown })
    }

    /// To be called before join() to stop the underlying thread
    pub fn shutdown(&self) {
        self.shutdown.signal();
    }

    /// Join the underlying thread
    pub fn join(self) -> Result<(Result<T>, C)> {
        assert!(
            self.shutdown.is_set(),
            "shutdown() needs to be called before join()"
        );
        let name = self.name();
        info!("join {} thread...", name);
        match self.handle.join() {
            Err(e) => bail!("could not join thread ({}): {:?}", name, e),
            Ok((v, ctx)) => Ok((v, ctx)),
        }
    }

    pub fn name(&self) -> String {
        if let Some(name) = self.handle.thread().name() {
            name.to_string()
        } else {
            format!("{:?}", &self.handle.thread().id())
        }
    }
}
